//! H.264 RTP payload (RFC 6184) to NAL units.
//!
//! Handles single NAL unit packets, STAP-A aggregation and FU-A
//! fragmentation. A sequence gap inside a fragmented unit discards that unit
//! rather than handing a damaged unit to the decoder.

use std::time::Instant;

use crate::framer::RawUnit;

const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;

const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

pub struct RtpDepacketizer {
    max_len: usize,
    fragment: Vec<u8>,
    fragment_arrival: Option<Instant>,
    /// Set after a fragmented unit was thrown away, so its trailing
    /// fragments are not reported again.
    discarding: bool,
    last_seq: Option<u16>,
    lost_packets: u64,
}

impl RtpDepacketizer {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            fragment: Vec::with_capacity(64 * 1024),
            fragment_arrival: None,
            discarding: false,
            last_seq: None,
            lost_packets: 0,
        }
    }

    pub fn reset(&mut self) {
        self.fragment.clear();
        self.fragment_arrival = None;
        self.discarding = false;
        self.last_seq = None;
    }

    /// Packets missing from the sequence number space since creation.
    pub fn lost_packets(&self) -> u64 {
        self.lost_packets
    }

    pub(crate) fn depacketize(&mut self, packet: &[u8], arrival: Instant) -> Vec<RawUnit> {
        let mut out = Vec::new();
        let Some((seq, payload)) = parse_header(packet) else {
            log::debug!("rtp: malformed packet of {} bytes", packet.len());
            out.push(RawUnit::Malformed {
                bytes: packet.len(),
                reason: "malformed rtp packet",
            });
            return out;
        };

        let in_order = self.track_sequence(seq);
        if in_order == SeqCheck::Duplicate {
            log::debug!("rtp: duplicate sequence number {}", seq);
            return out;
        }

        let header = payload[0];
        match header & 0x1f {
            1..=23 => {
                self.abandon_fragment(&mut out);
                self.discarding = false;
                out.push(RawUnit::Complete {
                    payload: payload.to_vec(),
                    arrival,
                });
            }
            NAL_STAP_A => {
                self.abandon_fragment(&mut out);
                self.discarding = false;
                self.split_stap_a(&payload[1..], arrival, &mut out);
            }
            NAL_FU_A => self.push_fragment(payload, in_order == SeqCheck::Gap, arrival, &mut out),
            other => {
                log::debug!("rtp: unsupported payload structure {}", other);
                out.push(RawUnit::Malformed {
                    bytes: payload.len(),
                    reason: "unsupported rtp payload structure",
                });
            }
        }
        out
    }

    fn track_sequence(&mut self, seq: u16) -> SeqCheck {
        let check = match self.last_seq {
            None => SeqCheck::InOrder,
            Some(last) if last == seq => return SeqCheck::Duplicate,
            Some(last) if last.wrapping_add(1) == seq => SeqCheck::InOrder,
            Some(last) => {
                let missing = seq.wrapping_sub(last).wrapping_sub(1);
                log::debug!("rtp: missing {} packet(s), last {} current {}", missing, last, seq);
                self.lost_packets += missing as u64;
                SeqCheck::Gap
            }
        };
        self.last_seq = Some(seq);
        check
    }

    fn push_fragment(&mut self, payload: &[u8], gap: bool, arrival: Instant, out: &mut Vec<RawUnit>) {
        let Some(&fu) = payload.get(1) else {
            out.push(RawUnit::Malformed {
                bytes: payload.len(),
                reason: "truncated fu-a header",
            });
            return;
        };
        let start = fu & 0x80 != 0;
        let end = fu & 0x40 != 0;
        let data = &payload[2..];

        if start {
            self.abandon_fragment(out);
            self.discarding = false;
            self.fragment.push((payload[0] & 0xe0) | (fu & 0x1f));
            self.fragment.extend_from_slice(data);
            self.fragment_arrival = Some(arrival);
        } else if self.fragment_arrival.is_some() {
            if gap {
                self.abandon_fragment(out);
                self.discarding = true;
                return;
            }
            self.fragment.extend_from_slice(data);
        } else {
            // continuation of a unit whose start we never saw
            if !self.discarding {
                out.push(RawUnit::Malformed {
                    bytes: payload.len(),
                    reason: "fu-a fragment without start",
                });
                self.discarding = true;
            }
            return;
        }

        if self.fragment.len() > self.max_len {
            self.abandon_fragment(out);
            self.discarding = true;
            return;
        }

        if end {
            if let Some(arrival) = self.fragment_arrival.take() {
                out.push(RawUnit::Complete {
                    payload: std::mem::take(&mut self.fragment),
                    arrival,
                });
            }
        }
    }

    fn abandon_fragment(&mut self, out: &mut Vec<RawUnit>) {
        if self.fragment_arrival.take().is_some() {
            out.push(RawUnit::Malformed {
                bytes: self.fragment.len(),
                reason: "incomplete fu-a unit",
            });
        }
        self.fragment.clear();
    }

    fn split_stap_a(&mut self, mut body: &[u8], arrival: Instant, out: &mut Vec<RawUnit>) {
        while !body.is_empty() {
            if body.len() < 2 {
                out.push(RawUnit::Malformed {
                    bytes: body.len(),
                    reason: "truncated stap-a",
                });
                return;
            }
            let size = u16::from_be_bytes([body[0], body[1]]) as usize;
            body = &body[2..];
            if size == 0 || size > body.len() {
                out.push(RawUnit::Malformed {
                    bytes: body.len(),
                    reason: "invalid stap-a unit size",
                });
                return;
            }
            out.push(RawUnit::Complete {
                payload: body[..size].to_vec(),
                arrival,
            });
            body = &body[size..];
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SeqCheck {
    InOrder,
    Gap,
    Duplicate,
}

/// Returns the sequence number and the payload (NAL header onwards), or
/// `None` when the packet is not a usable RTP v2 packet.
fn parse_header(packet: &[u8]) -> Option<(u16, &[u8])> {
    if packet.len() <= RTP_HEADER_LEN {
        return None;
    }
    let flags = packet[0];
    if flags >> 6 != RTP_VERSION {
        return None;
    }
    let padding = flags & 0x20 != 0;
    let extension = flags & 0x10 != 0;
    let csrc_count = (flags & 0x0f) as usize;
    let seq = u16::from_be_bytes([packet[2], packet[3]]);

    let mut offset = RTP_HEADER_LEN + csrc_count * 4;
    if extension {
        let ext = packet.get(offset..offset + 4)?;
        let words = u16::from_be_bytes([ext[2], ext[3]]) as usize;
        offset += 4 + words * 4;
    }
    let mut end = packet.len();
    if padding {
        let pad = *packet.last()? as usize;
        end = end.checked_sub(pad)?;
    }
    if offset >= end {
        return None;
    }
    Some((seq, &packet[offset..end]))
}

#[cfg(test)]
#[path = "rtp_test.rs"]
mod rtp_test;
