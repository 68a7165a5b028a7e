use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::DecoderInitError;
use crate::feeder::{DecoderFeeder, FeederState};
use crate::framer::NaluFramer;
use crate::ingest::{Ingest, Ingested};
use crate::nalu::NALU_MAXLEN;
use crate::notifier::{
    ParamsEventReceiver, ParamsEventStream, ParamsNotifier, ParamsPoll, VideoParamsListener,
    VideoRatio, spawn_poll_task,
};
use crate::queue::IngestQueue;
use crate::recorder::RawRecorder;
use crate::sink::DecoderSink;
use crate::source::{SourceConfig, SourceTask};
use crate::stats::{DecodingStats, StatsAggregator};

/// One decode run, from `start` to `stop` (or drop). Counters begin at zero
/// for every session.
pub struct Session {
    config: SessionConfig,
    source: SourceConfig,
    cancel: CancellationToken,
    stats: Arc<StatsAggregator>,
    notifier: Arc<ParamsNotifier>,
    queue: Arc<IngestQueue>,
    ingest: Arc<Ingest>,
    feeder: DecoderFeeder,
    source_task: Mutex<Option<SourceTask>>,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    parsed_at_last_call: AtomicU64,
    stopped: AtomicBool,
}

impl Session {
    /// Acquires the decoder sink, then opens the source. Either failing
    /// leaves nothing running and nothing recorded.
    pub fn start(
        config: SessionConfig,
        source: SourceConfig,
        sink: Box<dyn DecoderSink>,
    ) -> Result<Self, DecoderInitError> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let stats = Arc::new(StatsAggregator::new(config.stats_window()));
        let notifier = Arc::new(ParamsNotifier::new(stats.clone()));
        let queue = Arc::new(IngestQueue::new(config.queue_capacity, config.overflow));

        let feeder = DecoderFeeder::start(
            sink,
            queue.clone(),
            stats.clone(),
            notifier.clone(),
            config.feeder_options(),
            cancel.child_token(),
        )?;

        // only once the decoder is ours, so a failed start leaves no file
        let recorder = match &config.record_dir {
            Some(dir) if source.is_live() => match RawRecorder::create(dir) {
                Ok(recorder) => Some(recorder),
                Err(e) => {
                    log::error!("ground recording disabled: {}", e);
                    None
                }
            },
            _ => None,
        };
        let framer = NaluFramer::with_max_len(source.framing(), config.max_unit_len);
        let ingest = Arc::new(Ingest::new(framer, queue.clone(), stats.clone(), recorder));

        let source_task =
            match SourceTask::spawn(&source, &config, ingest.clone(), cancel.child_token()) {
                Ok(task) => task,
                Err(e) => {
                    log::error!("open {} error: {:#?}", source.describe(), e);
                    cancel.cancel();
                    feeder.stop();
                    return Err(e.into());
                }
            };

        log::info!("session started, {}", source.describe());
        Ok(Self {
            config,
            source,
            cancel,
            stats,
            notifier,
            queue,
            ingest,
            feeder,
            source_task: Mutex::new(source_task),
            poll_task: Mutex::new(None),
            parsed_at_last_call: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    /// Stops reading, stops the feeder and releases the sink. Returns within
    /// roughly `stop_timeout` even with a hung decoder. Calling it again does
    /// nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.queue.close();

        let source_task = self
            .source_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut task) = source_task {
            task.stop();
        }
        self.ingest.finish_recording();
        self.feeder.stop();

        if let Some(task) = self
            .poll_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        log::info!("session stopped, {}", self.stats.snapshot());
    }

    pub fn state(&self) -> FeederState {
        self.feeder.state()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    /// Feeds bytes from the embedding application. Ignored once stopped.
    pub fn push_bytes(&self, data: &[u8]) -> Ingested {
        if self.is_stopped() {
            return Ingested::default();
        }
        self.ingest.push_bytes(data)
    }

    /// Flushes the last buffered unit of an external stream.
    pub fn end_of_stream(&self) -> Ingested {
        if self.is_stopped() {
            return Ingested::default();
        }
        self.ingest.finish()
    }

    /// Drops partially framed data, for example after the sender restarted.
    pub fn reset_framer(&self) {
        self.ingest.reset();
    }

    pub fn poll(&self) -> ParamsPoll {
        self.notifier.poll()
    }

    pub fn stats(&self) -> DecodingStats {
        self.stats.snapshot()
    }

    pub fn latest_ratio(&self) -> Option<VideoRatio> {
        self.notifier.latest_ratio()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Registers a listener and makes sure the periodic poll task runs.
    /// Needs a tokio runtime.
    pub fn register_listener(&self, listener: Arc<dyn VideoParamsListener>) -> anyhow::Result<()> {
        self.notifier.register(listener);
        self.start_polling()
    }

    /// Starts the poll task that feeds listeners and `StatsChanged` events.
    /// Idempotent.
    pub fn start_polling(&self) -> anyhow::Result<()> {
        if self.is_stopped() {
            return Err(anyhow::anyhow!("session stopped"));
        }
        let mut poll_task = self.poll_task.lock().unwrap_or_else(|e| e.into_inner());
        if poll_task.is_none() {
            *poll_task = Some(spawn_poll_task(
                self.notifier.clone(),
                self.config.poll_interval(),
                self.cancel.child_token(),
            )?);
        }
        Ok(())
    }

    /// Ratio events arrive as soon as a new geometry is decoded; stats events
    /// only while the poll task runs.
    pub fn subscribe(&self) -> ParamsEventReceiver {
        self.notifier.subscribe()
    }

    pub fn event_stream(&self) -> ParamsEventStream {
        self.notifier.event_stream()
    }

    pub fn any_video_data_received(&self) -> bool {
        self.stats.bytes_received() > 0
    }

    /// Plenty of bytes but not a single unit out of them: most likely the
    /// wrong framing or not H.264 at all.
    pub fn receiving_but_cannot_parse(&self) -> bool {
        self.stats.bytes_received() > NALU_MAXLEN as u64 && self.stats.units_parsed() == 0
    }

    pub fn any_units_parsed_since_last_call(&self) -> bool {
        let parsed = self.stats.units_parsed();
        self.parsed_at_last_call.swap(parsed, Ordering::AcqRel) != parsed
    }

    /// Multi-line human readable status.
    pub fn info_string(&self) -> String {
        let stats = self.stats.snapshot();
        let mut info = String::new();
        let _ = writeln!(info, "source: {}", self.source.describe());
        let _ = writeln!(info, "state: {:?}", self.state());
        let _ = writeln!(
            info,
            "received: {} bytes, {} units, {} key frames",
            stats.bytes_received,
            stats.units_received,
            self.ingest.keyframes()
        );
        if let SourceConfig::Udp { rtp: true, .. } = self.source {
            let _ = writeln!(info, "lost packets: {}", self.ingest.lost_packets());
        }
        if let Some(ratio) = self.latest_ratio() {
            let _ = writeln!(info, "video: {}x{}", ratio.width, ratio.height);
        }
        if !self.any_video_data_received() {
            let _ = writeln!(info, "no video data received yet");
        } else if self.receiving_but_cannot_parse() {
            let _ = writeln!(info, "receiving data but cannot parse h264 units");
        }
        let _ = write!(info, "{}", stats);
        info
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
