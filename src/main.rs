use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use nalu_bus::{DecodingStats, ParamsEvent, Session, VideoParamsListener, VideoRatio};
use tokio_util::sync::CancellationToken;

mod api;
mod cli;
mod player;

const DIAGNOSE_INTERVAL: Duration = Duration::from_secs(5);

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("nalu_bus", log::LevelFilter::Debug)
        .init();
}

struct LogListener;

impl VideoParamsListener for LogListener {
    fn on_video_ratio_changed(&self, ratio: VideoRatio) {
        log::info!("video ratio changed to {}x{}", ratio.width, ratio.height);
    }

    fn on_decoding_stats_changed(&self, stats: &DecodingStats) {
        log::debug!("{}", stats);
    }
}

fn diagnose(session: &Session) {
    if !session.any_video_data_received() {
        log::warn!("no video data received, {}", session.source().describe());
    } else if session.receiving_but_cannot_parse() {
        log::warn!("receiving data but no h264 units can be parsed from it, check the framing");
    } else if !session.any_units_parsed_since_last_call() {
        log::warn!("video stream stalled");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = cli::Args::parse();
    nalu_bus::init()?;

    let config = args.session_config()?;
    let session = Arc::new(Session::start(config, args.source(), args.sink())?);
    session.register_listener(Arc::new(LogListener))?;
    player::set_session(session.clone()).await;

    let cancel = CancellationToken::new();
    api::start_api_server(args.listen.clone(), cancel.clone());

    let mut events = session.event_stream();
    let mut diagnose_ticker = tokio::time::interval(DIAGNOSE_INTERVAL);
    diagnose_ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
            Some(event) = events.next() => {
                if let ParamsEvent::RatioChanged(_) = event {
                    log::info!("{}", session.info_string());
                }
            },
            _ = diagnose_ticker.tick() => {
                diagnose(&session);
            },
        }
    }

    if let Some(session) = player::take_session().await {
        tokio::task::spawn_blocking(move || session.stop()).await?;
    }
    log::info!("{}", session.info_string());
    Ok(())
}
