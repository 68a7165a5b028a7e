use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{DecoderInitError, FeedError, SinkError};
use crate::nalu::NalUnit;
use crate::notifier::{ParamsNotifier, VideoRatio};
use crate::queue::IngestQueue;
use crate::sink::{DecoderSink, SinkEvent, event_channel};
use crate::stats::StatsAggregator;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// How long one `wait_input_ready` call may block before the feeder checks
/// for cancellation again.
pub const INPUT_WAIT_SLICE: Duration = Duration::from_millis(10);

/// What happens to units still queued when the session stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Count them as dropped.
    #[default]
    Discard,
    /// Submit them before closing the decoder.
    Drain,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeederState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: FeederState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn set(&self, state: FeederState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn get(&self) -> FeederState {
        match self.0.load(Ordering::Acquire) {
            1 => FeederState::Starting,
            2 => FeederState::Running,
            3 => FeederState::Stopping,
            _ => FeederState::Idle,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FeederOptions {
    pub stop_mode: StopMode,
    pub stop_timeout: Duration,
    pub input_wait_slice: Duration,
}

impl Default for FeederOptions {
    fn default() -> Self {
        Self {
            stop_mode: StopMode::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            input_wait_slice: INPUT_WAIT_SLICE,
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// Owns the decoder sink and the thread that feeds it from the queue.
pub struct DecoderFeeder {
    state: Arc<StateCell>,
    cancel: CancellationToken,
    queue: Arc<IngestQueue>,
    stats: Arc<StatsAggregator>,
    options: FeederOptions,
    worker: Mutex<Option<Worker>>,
}

impl DecoderFeeder {
    /// Opens `sink` and starts the feed thread. On error the sink has been
    /// closed again and nothing is left running.
    pub fn start(
        mut sink: Box<dyn DecoderSink>,
        queue: Arc<IngestQueue>,
        stats: Arc<StatsAggregator>,
        notifier: Arc<ParamsNotifier>,
        options: FeederOptions,
        cancel: CancellationToken,
    ) -> Result<Self, DecoderInitError> {
        let state = Arc::new(StateCell::new(FeederState::Starting));

        let (events, events_rx) = event_channel();
        if let Err(e) = sink.open(events) {
            log::error!("open {} sink error: {:#?}", sink.name(), e);
            sink.close();
            state.set(FeederState::Idle);
            return Err(DecoderInitError::Sink(e));
        }
        let sink_name = sink.name();

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let feed_loop = FeedLoop {
            sink,
            queue: queue.clone(),
            stats: stats.clone(),
            notifier,
            events: events_rx,
            cancel: cancel.clone(),
            options,
            last_ratio: None,
        };
        let handle = std::thread::Builder::new()
            .name("nalu-feeder".to_string())
            .spawn(move || {
                feed_loop.run();
                let _ = done_tx.send(());
            })
            .map_err(|e| {
                state.set(FeederState::Idle);
                DecoderInitError::Spawn(e)
            })?;

        state.set(FeederState::Running);
        log::info!("decoder feeder started with {} sink", sink_name);

        Ok(Self {
            state,
            cancel,
            queue,
            stats,
            options,
            worker: Mutex::new(Some(Worker {
                handle,
                done: done_rx,
            })),
        })
    }

    pub fn state(&self) -> FeederState {
        self.state.get()
    }

    /// Stops the feed thread and releases the sink. Safe to call more than
    /// once and from any thread other than the feeder's own.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(worker) = worker else {
            return;
        };

        self.state.set(FeederState::Stopping);
        self.cancel.cancel();
        self.queue.close();

        match worker.done.recv_timeout(self.options.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    log::error!("decoder feeder thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("{}", FeedError::StopTimeout(self.options.stop_timeout));
                // the thread still owns the sink and closes it if the sink
                // ever returns
                let discarded = self.queue.drain();
                self.stats.record_dropped(discarded);
            }
        }

        self.state.set(FeederState::Idle);
        log::info!("decoder feeder stopped");
    }
}

impl Drop for DecoderFeeder {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Step {
    Unit(Option<NalUnit>),
    Event(Option<SinkEvent>),
    Closed,
}

struct FeedLoop {
    sink: Box<dyn DecoderSink>,
    queue: Arc<IngestQueue>,
    stats: Arc<StatsAggregator>,
    notifier: Arc<ParamsNotifier>,
    events: Receiver<SinkEvent>,
    cancel: CancellationToken,
    options: FeederOptions,
    last_ratio: Option<VideoRatio>,
}

impl FeedLoop {
    fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let step = crossbeam_channel::select! {
                recv(self.queue.units()) -> unit => Step::Unit(unit.ok()),
                recv(self.events) -> event => Step::Event(event.ok()),
                recv(self.queue.closed_signal()) -> _ => Step::Closed,
            };
            match step {
                Step::Unit(Some(unit)) => self.feed(unit),
                Step::Unit(None) | Step::Closed => break,
                Step::Event(Some(event)) => self.handle_event(event),
                // sink dropped its event handle; nothing more will come
                Step::Event(None) => self.events = crossbeam_channel::never(),
            }
        }
        self.finish();
    }

    fn feed(&mut self, unit: NalUnit) {
        let wait_started = Instant::now();
        let slice = self.options.input_wait_slice;
        let ready = loop {
            match guarded(|| self.sink.wait_input_ready(slice)) {
                Ok(true) => break Ok(()),
                Ok(false) if self.cancel.is_cancelled() => {
                    log::debug!("{} not fed, decoder never became ready", unit);
                    self.stats.record_dropped(1);
                    return;
                }
                Ok(false) => {}
                Err(e) => break Err(e),
            }
        };
        let wait = wait_started.elapsed();

        let submit_started = Instant::now();
        let result = match ready {
            Ok(()) => guarded(|| self.sink.submit(&unit)).and_then(|submitted| submitted),
            Err(e) => Err(e),
        };
        self.stats.record_fed(wait, submit_started.elapsed());
        if let Err(e) = result {
            self.stats.record_decode_failure();
            log::warn!(
                "{}",
                FeedError::DecodeSubmit {
                    seq: unit.seq(),
                    source: e
                }
            );
        }
        self.drain_events();
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: SinkEvent) {
        match event {
            SinkEvent::Frame { width, height } => {
                self.stats.record_frame_decoded();
                let Some(ratio) = VideoRatio::new(width, height) else {
                    return;
                };
                if self.last_ratio != Some(ratio) {
                    self.last_ratio = Some(ratio);
                    self.notifier.report_ratio(ratio);
                }
            }
            SinkEvent::Failed(reason) => {
                self.stats.record_decode_failure();
                log::warn!("decoder reported failure: {}", reason);
            }
        }
    }

    fn finish(&mut self) {
        if self.options.stop_mode == StopMode::Drain {
            while let Some(unit) = self.queue.try_pop() {
                self.feed(unit);
            }
        }
        let discarded = self.queue.drain();
        if discarded > 0 {
            log::debug!("discarded {} queued units on stop", discarded);
            self.stats.record_dropped(discarded);
        }
        self.drain_events();
        if let Err(e) = guarded(|| self.sink.close()) {
            log::error!("close {} sink error: {}", self.sink.name(), e);
        }
        self.drain_events();
    }
}

/// Runs one call into the sink, turning a panic into a [`SinkError`] so a
/// faulty decoder costs one unit rather than the feed thread.
fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, SinkError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| SinkError::Panicked(panic_message(payload)))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
#[path = "feeder_test.rs"]
mod feeder_test;
