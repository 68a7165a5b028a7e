use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::stats::{DecodingStats, StatsAggregator};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VideoRatio {
    pub width: u32,
    pub height: u32,
}

impl VideoRatio {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        (width > 0 && height > 0).then_some(Self { width, height })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParamsEvent {
    RatioChanged(VideoRatio),
    StatsChanged(DecodingStats),
}

pub type ParamsEventSender = tokio::sync::broadcast::Sender<ParamsEvent>;
pub type ParamsEventReceiver = tokio::sync::broadcast::Receiver<ParamsEvent>;
pub type ParamsEventStream = Pin<Box<dyn Stream<Item = ParamsEvent> + Send>>;

/// Result of one poll.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamsPoll {
    /// Set once per change of geometry.
    pub ratio_changed: Option<VideoRatio>,
    pub stats: DecodingStats,
}

/// Receives the two kinds of change a session reports.
pub trait VideoParamsListener: Send + Sync {
    fn on_video_ratio_changed(&self, ratio: VideoRatio);

    fn on_decoding_stats_changed(&self, stats: &DecodingStats);
}

#[derive(Default)]
struct NotifyState {
    latest_ratio: Option<VideoRatio>,
    polled_ratio: Option<VideoRatio>,
    dispatched_ratio: Option<VideoRatio>,
    dispatched_stats: Option<DecodingStats>,
}

pub struct ParamsNotifier {
    stats: Arc<StatsAggregator>,
    state: Mutex<NotifyState>,
    listeners: Mutex<Vec<Arc<dyn VideoParamsListener>>>,
    events: ParamsEventSender,
}

impl ParamsNotifier {
    pub fn new(stats: Arc<StatsAggregator>) -> Self {
        let (events, _) = tokio::sync::broadcast::channel(64);
        Self {
            stats,
            state: Mutex::new(NotifyState::default()),
            listeners: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Records the geometry of a decoded frame. Returns true only when it
    /// differs from the previous one.
    pub fn report_ratio(&self, ratio: VideoRatio) -> bool {
        {
            let mut state = self.lock_state();
            if state.latest_ratio == Some(ratio) {
                return false;
            }
            state.latest_ratio = Some(ratio);
        }
        log::info!("video ratio changed: {}x{}", ratio.width, ratio.height);
        if self.events.receiver_count() > 0 {
            let _ = self.events.send(ParamsEvent::RatioChanged(ratio));
        }
        true
    }

    pub fn latest_ratio(&self) -> Option<VideoRatio> {
        self.lock_state().latest_ratio
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn poll(&self) -> ParamsPoll {
        let ratio_changed = {
            let mut state = self.lock_state();
            if state.latest_ratio != state.polled_ratio {
                state.polled_ratio = state.latest_ratio;
                state.latest_ratio
            } else {
                None
            }
        };
        ParamsPoll {
            ratio_changed,
            stats: self.stats.snapshot(),
        }
    }

    pub fn register(&self, listener: Arc<dyn VideoParamsListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn has_listeners(&self) -> bool {
        !self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn subscribe(&self) -> ParamsEventReceiver {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> ParamsEventStream {
        let stream =
            BroadcastStream::new(self.subscribe()).filter_map(|r| async move { r.ok() });
        Box::pin(stream)
    }

    /// One tick of the periodic poller: hands registered listeners whatever
    /// changed since the last tick. Unchanged stats are not re-sent.
    pub fn dispatch(&self) {
        let stats = self.stats.snapshot();
        let (ratio, stats_changed) = {
            let mut state = self.lock_state();
            let ratio = match state.latest_ratio {
                Some(r) if state.dispatched_ratio != Some(r) => {
                    state.dispatched_ratio = Some(r);
                    Some(r)
                }
                _ => None,
            };
            let stats_changed = state.dispatched_stats != Some(stats);
            if stats_changed {
                state.dispatched_stats = Some(stats);
            }
            (ratio, stats_changed)
        };

        if !stats_changed && ratio.is_none() {
            return;
        }
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners.iter() {
            if let Some(ratio) = ratio {
                listener.on_video_ratio_changed(ratio);
            }
            if stats_changed {
                listener.on_decoding_stats_changed(&stats);
            }
        }
        if stats_changed && self.events.receiver_count() > 0 {
            let _ = self.events.send(ParamsEvent::StatsChanged(stats));
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, NotifyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Runs [`ParamsNotifier::dispatch`] every `period` on the current tokio
/// runtime until `cancel` fires.
pub fn spawn_poll_task(
    notifier: Arc<ParamsNotifier>,
    period: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|e| anyhow::anyhow!("params poll task needs a tokio runtime: {}", e))?;
    Ok(handle.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                _ = ticker.tick() => {
                    notifier.dispatch();
                }
            }
        }
        log::debug!("params poll task stopped");
    }))
}

#[cfg(test)]
#[path = "notifier_test.rs"]
mod notifier_test;
