use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::FeedError;
use crate::framer::{Framed, NaluFramer};
use crate::queue::{IngestQueue, Pushed};
use crate::recorder::RawRecorder;
use crate::stats::StatsAggregator;

/// What one chunk turned into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ingested {
    pub units: usize,
    pub pictures: usize,
    pub dropped: usize,
    pub unparseable: usize,
}

/// The producer side of a session: frames incoming bytes, counts them, and
/// hands units to the queue. Shared by the source thread and external
/// callers of `Session::push_bytes`.
pub struct Ingest {
    framer: Mutex<NaluFramer>,
    queue: Arc<IngestQueue>,
    stats: Arc<StatsAggregator>,
    recorder: Option<Mutex<RawRecorder>>,
    keyframes: AtomicU64,
}

impl Ingest {
    pub fn new(
        framer: NaluFramer,
        queue: Arc<IngestQueue>,
        stats: Arc<StatsAggregator>,
        recorder: Option<RawRecorder>,
    ) -> Self {
        Self {
            framer: Mutex::new(framer),
            queue,
            stats,
            recorder: recorder.map(Mutex::new),
            keyframes: AtomicU64::new(0),
        }
    }

    pub fn push_bytes(&self, chunk: &[u8]) -> Ingested {
        let mut ingested = Ingested::default();
        if chunk.is_empty() {
            return ingested;
        }
        self.stats.record_bytes(chunk.len());
        let mut framer = self.lock_framer();
        for framed in framer.feed(chunk) {
            self.accept(framed, &mut ingested);
        }
        ingested
    }

    /// End of stream: flushes the unit still buffered in the framer.
    pub fn finish(&self) -> Ingested {
        let mut ingested = Ingested::default();
        let mut framer = self.lock_framer();
        for framed in framer.finish() {
            self.accept(framed, &mut ingested);
        }
        ingested
    }

    pub fn finish_recording(&self) {
        if let Some(recorder) = &self.recorder {
            recorder.lock().unwrap_or_else(|e| e.into_inner()).finish();
        }
    }

    pub fn reset(&self) {
        self.lock_framer().reset();
    }

    pub fn keyframes(&self) -> u64 {
        self.keyframes.load(Ordering::Relaxed)
    }

    pub fn lost_packets(&self) -> u64 {
        self.lock_framer().lost_packets()
    }

    fn accept(&self, framed: Framed, ingested: &mut Ingested) {
        match framed {
            Framed::Unit(unit) => {
                self.stats.record_received(unit.arrival().elapsed());
                ingested.units += 1;
                if unit.starts_picture() {
                    ingested.pictures += 1;
                }
                if unit.is_keyframe() {
                    self.keyframes.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(recorder) = &self.recorder {
                    recorder.lock().unwrap_or_else(|e| e.into_inner()).write(&unit);
                }
                let seq = unit.seq();
                if self.queue.push(unit) == Pushed::Dropped {
                    self.stats.record_dropped(1);
                    ingested.dropped += 1;
                    log::debug!("{}", FeedError::QueueOverflow { seq });
                }
            }
            Framed::Unparseable { bytes, reason } => {
                self.stats.record_unparseable();
                ingested.unparseable += 1;
                log::debug!(
                    "{}",
                    FeedError::Parse(format!("{} ({} bytes)", reason, bytes))
                );
            }
        }
    }

    fn lock_framer(&self) -> MutexGuard<'_, NaluFramer> {
        self.framer.lock().unwrap_or_else(|e| e.into_inner())
    }
}
