use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::nalu::NalUnit;

/// What `push` does when the queue is at capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming unit. Units already queued keep flowing.
    #[default]
    DropNewest,
    /// Park the producer until there is room or the queue is closed.
    Block,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    Dropped,
}

/// Bounded FIFO between the ingest thread and the feeder thread.
pub struct IngestQueue {
    tx: Sender<NalUnit>,
    rx: Receiver<NalUnit>,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
    // Never sent on; dropping it disconnects `close_rx` and wakes every
    // select waiting on it.
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl IngestQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let (close_tx, close_rx) = crossbeam_channel::bounded(0);
        Self {
            tx,
            rx,
            capacity,
            policy,
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        }
    }

    pub fn push(&self, unit: NalUnit) -> Pushed {
        if self.is_closed() {
            return Pushed::Dropped;
        }
        match self.policy {
            OverflowPolicy::DropNewest => match self.tx.try_send(unit) {
                Ok(()) => Pushed::Queued,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => Pushed::Dropped,
            },
            OverflowPolicy::Block => {
                crossbeam_channel::select! {
                    send(self.tx, unit) -> res => match res {
                        Ok(()) => Pushed::Queued,
                        Err(_) => Pushed::Dropped,
                    },
                    recv(self.close_rx) -> _ => Pushed::Dropped,
                }
            }
        }
    }

    /// Waits for the next unit. `None` once the queue is closed.
    pub fn pop(&self) -> Option<NalUnit> {
        if self.is_closed() {
            return None;
        }
        crossbeam_channel::select! {
            recv(self.rx) -> unit => unit.ok(),
            recv(self.close_rx) -> _ => None,
        }
    }

    pub fn try_pop(&self) -> Option<NalUnit> {
        self.rx.try_recv().ok()
    }

    /// Wakes all parked producers and consumers. Queued units stay until
    /// drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut guard) = self.close_tx.lock() {
            guard.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Discards everything queued and returns how many units that was.
    pub fn drain(&self) -> u64 {
        let mut n = 0;
        while self.rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub(crate) fn units(&self) -> &Receiver<NalUnit> {
        &self.rx
    }

    pub(crate) fn closed_signal(&self) -> &Receiver<()> {
        &self.close_rx
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
