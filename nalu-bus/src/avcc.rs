//! Length-prefixed H.264 (AVCC, as stored in MP4/MKV) to Annex-B.

use bytes::{BufMut, Bytes, BytesMut};

use crate::nalu::START_CODE;

/// True when `data` already starts with a start code.
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 0, 1]) || data.starts_with(&[0, 0, 1])
}

/// The decoder configuration record of an AVCC stream: the NAL length size
/// and its parameter sets, kept as Annex-B so they can be replayed ahead of
/// keyframes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvccConfig {
    length_size: usize,
    parameter_sets: Bytes,
}

impl AvccConfig {
    /// Parses an `avcC` record. Returns `None` for extradata that is missing,
    /// already Annex-B, or truncated.
    pub fn parse(extradata: &[u8]) -> Option<Self> {
        if extradata.len() < 7 || extradata[0] != 1 || is_annexb(extradata) {
            return None;
        }
        let length_size = (extradata[4] & 0x03) as usize + 1;
        if length_size == 3 {
            return None;
        }

        let mut out = BytesMut::new();
        let mut rest = &extradata[5..];
        let sps_count = (*rest.first()? & 0x1f) as usize;
        rest = &rest[1..];
        rest = copy_sets(rest, sps_count, &mut out)?;
        let pps_count = *rest.first()? as usize;
        copy_sets(&rest[1..], pps_count, &mut out)?;

        Some(Self {
            length_size,
            parameter_sets: out.freeze(),
        })
    }

    pub fn length_size(&self) -> usize {
        self.length_size
    }

    /// SPS and PPS units, each behind a start code.
    pub fn parameter_sets(&self) -> &Bytes {
        &self.parameter_sets
    }

    /// Rewrites one packet. A length running past the end of the packet
    /// ends the conversion; what was converted so far is kept.
    pub fn to_annexb(&self, packet: &[u8]) -> Bytes {
        if is_annexb(packet) {
            return Bytes::copy_from_slice(packet);
        }
        let mut out = BytesMut::with_capacity(packet.len() + 16);
        let mut i = 0;
        while i + self.length_size <= packet.len() {
            let len = packet[i..i + self.length_size]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize);
            i += self.length_size;
            if len == 0 || len > packet.len() - i {
                break;
            }
            out.put_slice(&START_CODE);
            out.put_slice(&packet[i..i + len]);
            i += len;
        }
        out.freeze()
    }
}

fn copy_sets<'a>(mut data: &'a [u8], count: usize, out: &mut BytesMut) -> Option<&'a [u8]> {
    for _ in 0..count {
        if data.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let set = data.get(2..2 + len)?;
        out.put_slice(&START_CODE);
        out.put_slice(set);
        data = &data[2 + len..];
    }
    Some(data)
}
