//! Splits an incoming byte stream into NAL units.
//!
//! Two framings are understood: an Annex-B byte stream (file, asset, raw
//! H.264 over UDP) where units are delimited by `00 00 01` / `00 00 00 01`
//! start codes, and RTP where each chunk is one packet (see [`crate::rtp`]).
//! Partial units are kept between `feed` calls. Corrupt input never fails
//! the stream; it surfaces as [`Framed::Unparseable`] and framing resumes at
//! the next boundary.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::nalu::{NALU_MAXLEN, NalUnit};
use crate::rtp::RtpDepacketizer;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingMode {
    #[default]
    AnnexB,
    Rtp,
}

#[derive(Debug)]
pub enum Framed {
    Unit(NalUnit),
    Unparseable { bytes: usize, reason: &'static str },
}

/// Output of the per-framing parsers before a sequence index is assigned.
#[derive(Debug, PartialEq)]
pub(crate) enum RawUnit {
    Complete { payload: Vec<u8>, arrival: Instant },
    Malformed { bytes: usize, reason: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanState {
    /// No start code seen yet; buffered bytes are junk.
    Searching,
    /// Buffer holds the payload of the current unit.
    InUnit,
    /// Current unit was rejected; skip to the next start code.
    Discarding,
}

pub struct NaluFramer {
    mode: FramingMode,
    buf: BytesMut,
    sync: ScanState,
    scan_from: usize,
    unit_arrival: Instant,
    chunk_arrival: Instant,
    rtp: RtpDepacketizer,
    pending: VecDeque<Framed>,
    next_seq: u64,
    max_len: usize,
}

impl NaluFramer {
    pub fn new(mode: FramingMode) -> Self {
        Self::with_max_len(mode, NALU_MAXLEN)
    }

    pub fn with_max_len(mode: FramingMode, max_len: usize) -> Self {
        let now = Instant::now();
        Self {
            mode,
            buf: BytesMut::with_capacity(64 * 1024),
            sync: ScanState::Searching,
            scan_from: 0,
            unit_arrival: now,
            chunk_arrival: now,
            rtp: RtpDepacketizer::new(max_len),
            pending: VecDeque::new(),
            next_seq: 0,
            max_len,
        }
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Appends `chunk` and returns the units it completes. The iterator is
    /// lazy: scanning happens as it is advanced, and anything it did not
    /// reach is picked up by the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Units<'_> {
        self.chunk_arrival = Instant::now();
        match self.mode {
            FramingMode::AnnexB => self.buf.extend_from_slice(chunk),
            FramingMode::Rtp => {
                for raw in self.rtp.depacketize(chunk, self.chunk_arrival) {
                    let framed = self.assign(raw);
                    self.pending.push_back(framed);
                }
            }
        }
        Units { framer: self }
    }

    /// End of stream: emits the buffered tail unit, if any.
    pub fn finish(&mut self) -> Units<'_> {
        if self.mode == FramingMode::AnnexB {
            while let Some(framed) = self.next_annexb() {
                self.pending.push_back(framed);
            }
            let tail = self.buf.split();
            let raw = match self.sync {
                ScanState::InUnit => Some(self.complete(&tail, self.unit_arrival)),
                ScanState::Searching if !tail.is_empty() => Some(RawUnit::Malformed {
                    bytes: tail.len(),
                    reason: "no start code",
                }),
                _ => None,
            };
            if let Some(raw) = raw {
                let framed = self.assign(raw);
                self.pending.push_back(framed);
            }
            self.sync = ScanState::Searching;
            self.scan_from = 0;
        }
        Units { framer: self }
    }

    /// Drops all partial state. Sequence numbering continues.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.sync = ScanState::Searching;
        self.scan_from = 0;
        self.pending.clear();
        self.rtp.reset();
    }

    pub fn lost_packets(&self) -> u64 {
        self.rtp.lost_packets()
    }

    fn next_framed(&mut self) -> Option<Framed> {
        if let Some(framed) = self.pending.pop_front() {
            return Some(framed);
        }
        match self.mode {
            FramingMode::AnnexB => self.next_annexb(),
            FramingMode::Rtp => None,
        }
    }

    fn next_annexb(&mut self) -> Option<Framed> {
        loop {
            let Some((pos, code_len)) = find_start_code(&self.buf, self.scan_from) else {
                self.scan_from = self.buf.len().saturating_sub(3);
                return self.check_overflow();
            };
            let body = self.buf.split_to(pos);
            self.buf.advance(code_len);
            self.scan_from = 0;

            let raw = match self.sync {
                ScanState::InUnit => Some(self.complete(&body, self.unit_arrival)),
                ScanState::Searching if !body.is_empty() => Some(RawUnit::Malformed {
                    bytes: body.len(),
                    reason: "no start code",
                }),
                _ => None,
            };
            self.sync = ScanState::InUnit;
            self.unit_arrival = self.chunk_arrival;

            if let Some(raw) = raw {
                return Some(self.assign(raw));
            }
        }
    }

    fn check_overflow(&mut self) -> Option<Framed> {
        if self.buf.len() <= self.max_len || self.sync == ScanState::Discarding {
            if self.sync == ScanState::Discarding {
                // keep the last bytes, they may be the head of a start code
                let keep = self.buf.len().min(3);
                self.buf.advance(self.buf.len() - keep);
                self.scan_from = 0;
            }
            return None;
        }
        let bytes = self.buf.len();
        let keep = bytes.min(3);
        self.buf.advance(bytes - keep);
        self.scan_from = 0;
        self.sync = ScanState::Discarding;
        Some(Framed::Unparseable {
            bytes,
            reason: "unit exceeds maximum length",
        })
    }

    fn complete(&self, body: &[u8], arrival: Instant) -> RawUnit {
        // trailing_zero_8bits belong to the stream, not the unit
        let end = body.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        let payload = &body[..end];
        if payload.len() > self.max_len {
            return RawUnit::Malformed {
                bytes: payload.len(),
                reason: "unit exceeds maximum length",
            };
        }
        RawUnit::Complete {
            payload: payload.to_vec(),
            arrival,
        }
    }

    fn assign(&mut self, raw: RawUnit) -> Framed {
        match raw {
            RawUnit::Complete { payload, .. } if payload.is_empty() => Framed::Unparseable {
                bytes: 0,
                reason: "empty unit",
            },
            RawUnit::Complete { payload, .. } if payload[0] & 0x80 != 0 => Framed::Unparseable {
                bytes: payload.len(),
                reason: "forbidden_zero_bit set",
            },
            RawUnit::Complete { payload, arrival } => {
                match NalUnit::from_payload(&payload, self.next_seq, arrival) {
                    Some(unit) => {
                        self.next_seq += 1;
                        Framed::Unit(unit)
                    }
                    None => Framed::Unparseable {
                        bytes: 0,
                        reason: "empty unit",
                    },
                }
            }
            RawUnit::Malformed { bytes, reason } => Framed::Unparseable { bytes, reason },
        }
    }
}

pub struct Units<'a> {
    framer: &'a mut NaluFramer,
}

impl Iterator for Units<'_> {
    type Item = Framed;

    fn next(&mut self) -> Option<Framed> {
        loop {
            match self.framer.next_framed()? {
                // back-to-back start codes, nothing to report
                Framed::Unparseable { bytes: 0, .. } => continue,
                framed => return Some(framed),
            }
        }
    }
}

/// Position of the first start code at or after `from`, and its length.
/// A `00 00 01` preceded by a zero byte is reported as the 4-byte form.
fn find_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    if buf.len() < 3 {
        return None;
    }
    let mut i = from;
    while i + 3 <= buf.len() {
        if buf[i + 2] > 1 {
            i += 3;
        } else if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            if i > 0 && buf[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        } else {
            i += 1;
        }
    }
    None
}

#[cfg(test)]
#[path = "framer_test.rs"]
mod framer_test;
