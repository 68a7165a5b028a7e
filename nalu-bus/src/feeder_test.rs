use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::{DecoderFeeder, FeederOptions, FeederState, StopMode};
use crate::error::DecoderInitError;
use crate::notifier::{ParamsEvent, ParamsNotifier, VideoRatio};
use crate::queue::{IngestQueue, OverflowPolicy};
use crate::stats::StatsAggregator;
use crate::testing::{RecordingSink, unit};

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    queue: Arc<IngestQueue>,
    stats: Arc<StatsAggregator>,
    notifier: Arc<ParamsNotifier>,
}

impl Harness {
    fn new(capacity: usize) -> Self {
        let stats = Arc::new(StatsAggregator::default());
        Self {
            queue: Arc::new(IngestQueue::new(capacity, OverflowPolicy::DropNewest)),
            notifier: Arc::new(ParamsNotifier::new(stats.clone())),
            stats,
        }
    }

    fn start(
        &self,
        sink: RecordingSink,
        options: FeederOptions,
    ) -> Result<DecoderFeeder, DecoderInitError> {
        DecoderFeeder::start(
            Box::new(sink),
            self.queue.clone(),
            self.stats.clone(),
            self.notifier.clone(),
            options,
            CancellationToken::new(),
        )
    }

    fn push(&self, seq: u64) {
        self.stats.record_received(Duration::ZERO);
        self.queue.push(unit(seq));
    }

    fn settled(&self) -> bool {
        let s = self.stats.snapshot();
        s.units_received == s.units_fed + s.units_dropped + s.units_unparseable
    }
}

fn options(stop_mode: StopMode, stop_timeout: Duration) -> FeederOptions {
    FeederOptions {
        stop_mode,
        stop_timeout,
        ..FeederOptions::default()
    }
}

#[test]
fn test_open_failure_leaves_idle() {
    let harness = Harness::new(4);
    let (sink, log) = RecordingSink::new();
    let result = harness.start(sink.failing_open(), FeederOptions::default());
    assert!(matches!(result, Err(DecoderInitError::Sink(_))));
    assert!(!log.opened());
    assert!(log.closed());
}

#[test]
fn test_feeds_in_order_and_closes_sink() {
    let harness = Harness::new(16);
    let (sink, log) = RecordingSink::new();
    let feeder = harness.start(sink, FeederOptions::default()).unwrap();
    assert_eq!(feeder.state(), FeederState::Running);
    assert!(log.opened());

    for seq in 0..10 {
        harness.push(seq);
    }
    assert!(log.wait_until(WAIT, |l| l.fed().len() == 10));
    assert_eq!(log.fed(), (0..10).collect::<Vec<_>>());

    feeder.stop();
    assert_eq!(feeder.state(), FeederState::Idle);
    assert!(log.closed());
    let stats = harness.stats.snapshot();
    assert_eq!(stats.units_fed, 10);
    assert_eq!(stats.units_dropped, 0);
    assert!(harness.settled());
}

#[test]
fn test_stop_is_idempotent() {
    let harness = Harness::new(4);
    let (sink, log) = RecordingSink::new();
    let feeder = harness.start(sink, FeederOptions::default()).unwrap();
    feeder.stop();
    feeder.stop();
    drop(feeder);
    assert!(log.closed());
}

#[test]
fn test_stop_discards_queued_units() {
    let harness = Harness::new(16);
    let (sink, log) = RecordingSink::new();
    let (sink, gate) = sink.gated();
    let feeder = Arc::new(harness.start(sink, options(StopMode::Discard, WAIT)).unwrap());

    for seq in 0..4 {
        harness.push(seq);
    }
    assert!(log.wait_until(WAIT, |l| l.submits() == 1));

    let stopper = {
        let feeder = feeder.clone();
        std::thread::spawn(move || feeder.stop())
    };
    std::thread::sleep(Duration::from_millis(30));
    drop(gate);
    stopper.join().unwrap();

    assert_eq!(log.fed(), vec![0]);
    let stats = harness.stats.snapshot();
    assert_eq!(stats.units_fed, 1);
    assert_eq!(stats.units_dropped, 3);
    assert!(harness.settled());
}

#[test]
fn test_stop_drains_queued_units() {
    let harness = Harness::new(16);
    let (sink, log) = RecordingSink::new();
    let (sink, gate) = sink.gated();
    let feeder = Arc::new(harness.start(sink, options(StopMode::Drain, WAIT)).unwrap());

    for seq in 0..4 {
        harness.push(seq);
    }
    assert!(log.wait_until(WAIT, |l| l.submits() == 1));

    let stopper = {
        let feeder = feeder.clone();
        std::thread::spawn(move || feeder.stop())
    };
    std::thread::sleep(Duration::from_millis(30));
    drop(gate);
    stopper.join().unwrap();

    assert_eq!(log.fed(), vec![0, 1, 2, 3]);
    assert_eq!(harness.stats.snapshot().units_dropped, 0);
    assert!(harness.settled());
}

#[test]
fn test_stop_gives_up_on_hung_sink() {
    let harness = Harness::new(16);
    let (sink, log) = RecordingSink::new();
    let (sink, gate) = sink.gated();
    let feeder = harness
        .start(sink, options(StopMode::Discard, Duration::from_millis(100)))
        .unwrap();

    for seq in 0..4 {
        harness.push(seq);
    }
    assert!(log.wait_until(WAIT, |l| l.submits() == 1));

    let started = Instant::now();
    feeder.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(feeder.state(), FeederState::Idle);
    assert_eq!(harness.stats.snapshot().units_dropped, 3);
    assert!(!log.closed());

    // the abandoned thread still cleans up once the sink returns
    drop(gate);
    assert!(log.wait_until(WAIT, |l| l.closed()));
    assert_eq!(log.fed(), vec![0]);
    assert!(harness.settled());
}

#[test]
fn test_submit_error_counted_and_skipped() {
    let harness = Harness::new(16);
    let (sink, log) = RecordingSink::new();
    let feeder = harness.start(sink.rejecting(1), FeederOptions::default()).unwrap();

    for seq in 0..3 {
        harness.push(seq);
    }
    assert!(log.wait_until(WAIT, |l| l.submits() == 3));
    feeder.stop();

    assert_eq!(log.fed(), vec![0, 2]);
    let stats = harness.stats.snapshot();
    assert_eq!(stats.units_fed, 3);
    assert_eq!(stats.decode_failures, 1);
    assert!(harness.settled());
}

#[test]
fn test_ratio_reported_on_change_only() {
    let harness = Harness::new(16);
    let mut events = harness.notifier.subscribe();
    let (sink, log) = RecordingSink::new();
    let feeder = harness
        .start(sink.with_frames(1280, 720), FeederOptions::default())
        .unwrap();

    for seq in 0..5 {
        harness.push(seq);
    }
    assert!(log.wait_until(WAIT, |l| l.fed().len() == 5));
    feeder.stop();

    let ratio = VideoRatio::new(1280, 720).unwrap();
    assert_eq!(harness.notifier.latest_ratio(), Some(ratio));
    assert_eq!(harness.stats.snapshot().frames_decoded, 5);
    assert_eq!(events.try_recv().unwrap(), ParamsEvent::RatioChanged(ratio));
    assert!(events.try_recv().is_err());
}

#[test]
fn test_sink_panic_counted_and_feeding_continues() {
    let harness = Harness::new(16);
    let (sink, log) = RecordingSink::new();
    let feeder = harness.start(sink.panicking(1), FeederOptions::default()).unwrap();

    for seq in 0..4 {
        harness.push(seq);
    }
    assert!(log.wait_until(WAIT, |l| l.fed().len() == 3));
    assert_eq!(feeder.state(), FeederState::Running);
    assert_eq!(log.fed(), vec![0, 2, 3]);

    feeder.stop();
    assert!(log.closed());
    let stats = harness.stats.snapshot();
    assert_eq!(stats.units_fed, 4);
    assert_eq!(stats.decode_failures, 1);
    assert!(harness.settled());
}

#[test]
fn test_failure_events_counted() {
    let harness = Harness::new(16);
    let (sink, log) = RecordingSink::new();
    let feeder = harness
        .start(sink.reporting_failure(2), FeederOptions::default())
        .unwrap();

    for seq in 0..5 {
        harness.push(seq);
    }
    assert!(log.wait_until(WAIT, |l| l.fed().len() == 5));
    feeder.stop();

    let stats = harness.stats.snapshot();
    assert_eq!(stats.units_fed, 5);
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(log.fed(), (0..5).collect::<Vec<_>>());
    assert!(harness.settled());
}
