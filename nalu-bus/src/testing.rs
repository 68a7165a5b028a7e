//! Fixtures shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::error::SinkError;
use crate::nalu::{NalUnit, START_CODE};
use crate::sink::{DecoderSink, SinkEvents};

/// What a [`RecordingSink`] saw, readable after the sink has been moved into
/// a session.
#[derive(Clone, Default)]
pub(crate) struct SinkLog {
    fed: Arc<Mutex<Vec<u64>>>,
    opened: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    submits: Arc<AtomicUsize>,
}

impl SinkLog {
    pub(crate) fn fed(&self) -> Vec<u64> {
        self.fed.lock().unwrap().clone()
    }

    pub(crate) fn opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    /// Polls until `f` holds or `timeout` passes.
    pub(crate) fn wait_until(&self, timeout: Duration, f: impl Fn(&SinkLog) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        f(self)
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    log: SinkLog,
    events: Option<SinkEvents>,
    gate: Option<Receiver<()>>,
    frame_size: Option<(u32, u32)>,
    fail_open: bool,
    reject_seq: Option<u64>,
    panic_seq: Option<u64>,
    fail_event_seq: Option<u64>,
}

impl RecordingSink {
    pub(crate) fn new() -> (Self, SinkLog) {
        let sink = Self::default();
        let log = sink.log.clone();
        (sink, log)
    }

    /// Every submit waits for one token on the returned sender. Dropping the
    /// sender lets all further submits through.
    pub(crate) fn gated(mut self) -> (Self, Sender<()>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.gate = Some(rx);
        (self, tx)
    }

    /// Reports a decoded frame of this size for every slice.
    pub(crate) fn with_frames(mut self, width: u32, height: u32) -> Self {
        self.frame_size = Some((width, height));
        self
    }

    pub(crate) fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub(crate) fn rejecting(mut self, seq: u64) -> Self {
        self.reject_seq = Some(seq);
        self
    }

    pub(crate) fn panicking(mut self, seq: u64) -> Self {
        self.panic_seq = Some(seq);
        self
    }

    /// Accepts unit `seq`, then reports it as undecodable through the event
    /// channel the way an asynchronous decoder would.
    pub(crate) fn reporting_failure(mut self, seq: u64) -> Self {
        self.fail_event_seq = Some(seq);
        self
    }
}

impl DecoderSink for RecordingSink {
    fn open(&mut self, events: SinkEvents) -> Result<(), SinkError> {
        if self.fail_open {
            return Err(SinkError::Unavailable("no surface".to_string()));
        }
        self.log.opened.store(true, Ordering::SeqCst);
        self.events = Some(events);
        Ok(())
    }

    fn submit(&mut self, unit: &NalUnit) -> Result<(), SinkError> {
        self.log.submits.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if gate.recv().is_err() {
                self.gate = None;
            }
        }
        if self.panic_seq == Some(unit.seq()) {
            panic!("decoder crashed on unit {}", unit.seq());
        }
        if self.reject_seq == Some(unit.seq()) {
            return Err(SinkError::Rejected {
                seq: unit.seq(),
                reason: "corrupt slice".to_string(),
            });
        }
        self.log.fed.lock().unwrap().push(unit.seq());
        if let (Some(seq), Some(events)) = (self.fail_event_seq, &self.events) {
            if seq == unit.seq() {
                events.failed(format!("bitstream error in unit {}", seq));
            }
        }
        if let (Some((w, h)), Some(events)) = (self.frame_size, &self.events) {
            if unit.starts_picture() {
                events.frame(w, h);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.log.closed.store(true, Ordering::SeqCst);
        self.events = None;
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// A non-IDR slice payload of `len` bytes that opens a picture and contains
/// no zero bytes, so it never fakes a start code.
pub(crate) fn slice_payload(len: usize, fill: u8) -> Vec<u8> {
    let fill = if fill == 0 { 0xaa } else { fill };
    let mut payload = vec![fill; len.max(2)];
    payload[0] = 0x41;
    payload[1] = 0x9a;
    payload
}

pub(crate) fn annexb(payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for payload in payloads {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(payload);
    }
    out
}

/// `n` slices, sizes spread across 100..=2000 bytes.
pub(crate) fn slice_stream(n: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| slice_payload(100 + (i * 211) % 1901, (i % 200) as u8 + 1))
        .collect()
}

pub(crate) fn unit(seq: u64) -> NalUnit {
    NalUnit::from_payload(&slice_payload(16, 0x55), seq, Instant::now()).unwrap()
}

#[derive(Default)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    pub(crate) fn bit(&mut self, b: bool) -> &mut Self {
        if self.bits % 8 == 0 {
            self.bytes.push(0);
        }
        if b {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 1 << (7 - self.bits % 8);
        }
        self.bits += 1;
        self
    }

    pub(crate) fn u(&mut self, n: u32, v: u32) -> &mut Self {
        for i in (0..n).rev() {
            self.bit((v >> i) & 1 == 1);
        }
        self
    }

    pub(crate) fn ue(&mut self, v: u32) -> &mut Self {
        let x = v + 1;
        let len = 32 - x.leading_zeros();
        self.u(len - 1, 0).u(len, x)
    }

    pub(crate) fn finish(&mut self) -> Vec<u8> {
        self.bit(true);
        std::mem::take(&mut self.bytes)
    }
}

/// Baseline-profile SPS payload for a `width_mbs` x `height_mbs` picture.
pub(crate) fn baseline_sps(width_mbs: u32, height_mbs: u32, crop_bottom: Option<u32>) -> Vec<u8> {
    let mut w = BitWriter::default();
    w.u(8, 66).u(8, 0).u(8, 31).ue(0);
    w.ue(0).ue(2).ue(1).bit(false);
    w.ue(width_mbs - 1).ue(height_mbs - 1);
    w.bit(true).bit(true);
    match crop_bottom {
        Some(bottom) => {
            w.bit(true).ue(0).ue(0).ue(0).ue(bottom);
        }
        None => {
            w.bit(false);
        }
    }
    w.bit(false);
    let mut sps = vec![0x67];
    sps.extend(escape_emulation(&w.finish()));
    sps
}

/// Inserts emulation prevention bytes so the payload never contains a start
/// code, whatever values were written into it.
fn escape_emulation(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 2);
    let mut zeros = 0;
    for &b in rbsp {
        if zeros >= 2 && b <= 3 {
            out.push(3);
            zeros = 0;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}
