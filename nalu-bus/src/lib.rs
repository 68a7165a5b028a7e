use std::sync::OnceLock;

/// Process-wide setup. Safe to call any number of times; only the first call
/// does work and every call returns its outcome. With the `ffmpeg` feature
/// this registers the FFmpeg codecs.
pub fn init() -> anyhow::Result<()> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| {
        #[cfg(feature = "ffmpeg")]
        ffmpeg_next::init().map_err(|e| format!("ffmpeg_next init: {}", e))?;
        log::debug!("nalu-bus initialised");
        Ok(())
    })
    .clone()
    .map_err(|e| anyhow::anyhow!(e))
}

pub mod avcc;
pub mod config;
pub mod error;
pub mod feeder;
pub mod framer;
pub mod ingest;
pub mod nalu;
pub mod notifier;
pub mod queue;
pub mod recorder;
pub mod rtp;
pub mod session;
pub mod sink;
pub mod source;
pub mod sps;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SessionConfig;
pub use error::{DecoderInitError, FeedError, SinkError, SourceError};
pub use feeder::{FeederState, StopMode};
pub use framer::{FramingMode, NaluFramer};
pub use nalu::NalUnit;
pub use notifier::{ParamsEvent, ParamsPoll, VideoParamsListener, VideoRatio};
pub use queue::OverflowPolicy;
pub use session::Session;
pub use sink::{DecoderSink, ProbeSink, SinkEvents};
pub use source::SourceConfig;
pub use stats::DecodingStats;

#[cfg(feature = "ffmpeg")]
pub use sink::FfmpegSink;
