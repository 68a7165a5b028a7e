use std::fmt::{Display, Formatter};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

/// Every unit handed downstream starts with this prefix, whatever framing it
/// arrived in.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Units larger than this are treated as corrupt.
pub const NALU_MAXLEN: usize = 1024 * 1024;

pub const NAL_TYPE_SLICE_NON_IDR: u8 = 1;
pub const NAL_TYPE_SLICE_IDR: u8 = 5;
pub const NAL_TYPE_SEI: u8 = 6;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;
pub const NAL_TYPE_AUD: u8 = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NalKind {
    ParameterSet,
    Slice,
    Other,
}

impl NalKind {
    pub fn from_type(nal_type: u8) -> Self {
        match nal_type {
            NAL_TYPE_SPS | NAL_TYPE_PPS => NalKind::ParameterSet,
            1..=5 => NalKind::Slice,
            _ => NalKind::Other,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NalUnit {
    data: Bytes,
    seq: u64,
    arrival: Instant,
    kind: NalKind,
}

impl NalUnit {
    /// Builds a unit from the NAL header byte onwards, prepending the start
    /// code. Returns `None` for an empty payload.
    pub fn from_payload(payload: &[u8], seq: u64, arrival: Instant) -> Option<Self> {
        let header = *payload.first()?;
        let mut buf = BytesMut::with_capacity(START_CODE.len() + payload.len());
        buf.put_slice(&START_CODE);
        buf.put_slice(payload);
        Some(Self {
            data: buf.freeze(),
            seq,
            arrival,
            kind: NalKind::from_type(header & 0x1f),
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    pub fn kind(&self) -> NalKind {
        self.kind
    }

    /// Start code plus payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[START_CODE.len()..]
    }

    pub fn nal_type(&self) -> u8 {
        self.data[START_CODE.len()] & 0x1f
    }

    pub fn is_sps(&self) -> bool {
        self.nal_type() == NAL_TYPE_SPS
    }

    pub fn is_pps(&self) -> bool {
        self.nal_type() == NAL_TYPE_PPS
    }

    pub fn is_keyframe(&self) -> bool {
        self.nal_type() == NAL_TYPE_SLICE_IDR
    }

    /// True when this slice opens a new picture (first_mb_in_slice == 0,
    /// which is a single leading 1 bit in exp-golomb).
    pub fn starts_picture(&self) -> bool {
        self.kind == NalKind::Slice && self.payload().get(1).is_some_and(|b| b & 0x80 != 0)
    }

    pub fn name(&self) -> &'static str {
        nal_name(self.nal_type())
    }
}

impl Display for NalUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "NalUnit {{ seq: {}, type: {}, size: {} }}", self.seq, self.name(), self.size())
    }
}

pub fn nal_name(nal_type: u8) -> &'static str {
    match nal_type {
        0 => "Unspecified",
        1 => "Coded slice of a non-IDR picture",
        2 => "Coded slice data partition A",
        3 => "Coded slice data partition B",
        4 => "Coded slice data partition C",
        5 => "Coded slice of an IDR picture",
        6 => "Supplemental enhancement information (SEI)",
        7 => "Sequence parameter set",
        8 => "Picture parameter set",
        9 => "Access unit delimiter",
        10 => "End of sequence",
        11 => "End of stream",
        12 => "Filler data",
        13 => "Sequence parameter set extension",
        19 => "Coded slice of an auxiliary coded picture without partitioning",
        _ => "Unknown",
    }
}
