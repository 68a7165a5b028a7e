use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{ParamsEvent, ParamsNotifier, VideoParamsListener, VideoRatio, spawn_poll_task};
use crate::stats::{DecodingStats, StatsAggregator};

#[derive(Default)]
struct Collect {
    ratios: Mutex<Vec<VideoRatio>>,
    stats: Mutex<Vec<DecodingStats>>,
}

impl VideoParamsListener for Collect {
    fn on_video_ratio_changed(&self, ratio: VideoRatio) {
        self.ratios.lock().unwrap().push(ratio);
    }

    fn on_decoding_stats_changed(&self, stats: &DecodingStats) {
        self.stats.lock().unwrap().push(*stats);
    }
}

fn ratio(width: u32, height: u32) -> VideoRatio {
    VideoRatio::new(width, height).unwrap()
}

fn notifier() -> ParamsNotifier {
    ParamsNotifier::new(Arc::new(StatsAggregator::new(Duration::from_secs(60))))
}

#[test]
fn test_zero_sized_ratio_rejected() {
    assert!(VideoRatio::new(0, 720).is_none());
    assert!(VideoRatio::new(1280, 0).is_none());
}

#[test]
fn test_ratio_reported_once_per_change() {
    let notifier = notifier();
    assert!(notifier.report_ratio(ratio(1280, 720)));
    assert!(!notifier.report_ratio(ratio(1280, 720)));

    let poll = notifier.poll();
    assert_eq!(poll.ratio_changed, Some(ratio(1280, 720)));
    assert_eq!(notifier.poll().ratio_changed, None);

    assert!(notifier.report_ratio(ratio(1920, 1080)));
    assert_eq!(notifier.poll().ratio_changed, Some(ratio(1920, 1080)));
    assert_eq!(notifier.latest_ratio(), Some(ratio(1920, 1080)));
}

#[test]
fn test_poll_ignores_change_back_to_polled_ratio() {
    let notifier = notifier();
    notifier.report_ratio(ratio(1280, 720));
    assert_eq!(notifier.poll().ratio_changed, Some(ratio(1280, 720)));

    notifier.report_ratio(ratio(1920, 1080));
    notifier.report_ratio(ratio(1280, 720));
    assert_eq!(notifier.poll().ratio_changed, None);

    notifier.report_ratio(ratio(1920, 1080));
    assert_eq!(notifier.poll().ratio_changed, Some(ratio(1920, 1080)));
}

#[test]
fn test_poll_carries_fresh_stats() {
    let notifier = notifier();
    notifier.stats().record_bytes(10);
    assert_eq!(notifier.poll().stats.bytes_received, 10);
    notifier.stats().record_bytes(5);
    assert_eq!(notifier.poll().stats.bytes_received, 15);
}

#[test]
fn test_dispatch_skips_unchanged_stats() {
    let notifier = notifier();
    let listener = Arc::new(Collect::default());
    notifier.register(listener.clone());
    assert!(notifier.has_listeners());

    notifier.dispatch();
    notifier.dispatch();
    assert_eq!(listener.stats.lock().unwrap().len(), 1);
    assert!(listener.ratios.lock().unwrap().is_empty());

    notifier.stats().record_received(Duration::from_millis(1));
    notifier.report_ratio(ratio(640, 480));
    notifier.dispatch();
    notifier.dispatch();

    assert_eq!(listener.stats.lock().unwrap().len(), 2);
    assert_eq!(listener.stats.lock().unwrap()[1].units_received, 1);
    assert_eq!(*listener.ratios.lock().unwrap(), vec![ratio(640, 480)]);
}

#[test]
fn test_dispatch_and_poll_are_independent() {
    let notifier = notifier();
    let listener = Arc::new(Collect::default());
    notifier.register(listener.clone());

    notifier.report_ratio(ratio(800, 600));
    notifier.dispatch();
    // the listener saw it, a poller still gets it too
    assert_eq!(notifier.poll().ratio_changed, Some(ratio(800, 600)));
    assert_eq!(listener.ratios.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_subscribers_get_ratio_events() -> anyhow::Result<()> {
    let notifier = notifier();
    let mut rx = notifier.subscribe();

    notifier.report_ratio(ratio(1280, 720));
    notifier.report_ratio(ratio(1280, 720));
    notifier.report_ratio(ratio(720, 1280));

    assert_eq!(rx.recv().await?, ParamsEvent::RatioChanged(ratio(1280, 720)));
    assert_eq!(rx.recv().await?, ParamsEvent::RatioChanged(ratio(720, 1280)));
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_poll_task_dispatches_until_cancelled() -> anyhow::Result<()> {
    let notifier = Arc::new(notifier());
    let listener = Arc::new(Collect::default());
    notifier.register(listener.clone());
    let mut events = notifier.event_stream();

    let cancel = CancellationToken::new();
    let handle = spawn_poll_task(notifier.clone(), Duration::from_millis(10), cancel.clone())?;

    let first = tokio::time::timeout(Duration::from_secs(1), events.next()).await?;
    assert!(matches!(first, Some(ParamsEvent::StatsChanged(_))));

    notifier.stats().record_bytes(100);
    let next = tokio::time::timeout(Duration::from_secs(1), events.next()).await?;
    match next {
        Some(ParamsEvent::StatsChanged(stats)) => assert_eq!(stats.bytes_received, 100),
        other => panic!("unexpected event {:?}", other),
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await??;
    assert!(listener.stats.lock().unwrap().len() >= 2);
    Ok(())
}

#[test]
fn test_poll_task_needs_runtime() {
    let notifier = Arc::new(notifier());
    assert!(spawn_poll_task(notifier, Duration::from_millis(10), CancellationToken::new()).is_err());
}
