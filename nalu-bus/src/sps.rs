//! Picture size from an H.264 sequence parameter set.

use crate::nalu::NAL_TYPE_SPS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpsGeometry {
    pub width: u32,
    pub height: u32,
}

/// Parses an SPS payload (NAL header byte onwards). Returns `None` for other
/// unit types or a truncated/corrupt set.
pub fn parse_sps_geometry(payload: &[u8]) -> Option<SpsGeometry> {
    if payload.first()? & 0x1f != NAL_TYPE_SPS {
        return None;
    }
    let rbsp = strip_emulation_prevention(&payload[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.u(8)?;
    r.u(8)?; // constraint flags
    r.u(8)?; // level_idc
    r.ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.flag()?;
        }
        r.ue()?; // bit_depth_luma_minus8
        r.ue()?; // bit_depth_chroma_minus8
        r.flag()?; // qpprime_y_zero_transform_bypass_flag
        if r.flag()? {
            let lists = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..lists {
                if r.flag()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.ue()?; // log2_max_frame_num_minus4
    match r.ue()? {
        0 => {
            r.ue()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            r.flag()?;
            r.se()?;
            r.se()?;
            for _ in 0..r.ue()? {
                r.se()?;
            }
        }
        _ => {}
    }
    r.ue()?; // max_num_ref_frames
    r.flag()?; // gaps_in_frame_num_value_allowed_flag
    let width_mbs = r.ue()?.checked_add(1)?;
    let height_map_units = r.ue()?.checked_add(1)?;
    let frame_mbs_only = r.flag()?;
    if !frame_mbs_only {
        r.flag()?; // mb_adaptive_frame_field_flag
    }
    r.flag()?; // direct_8x8_inference_flag

    let (mut left, mut right, mut top, mut bottom) = (0u32, 0, 0, 0);
    if r.flag()? {
        left = r.ue()?;
        right = r.ue()?;
        top = r.ue()?;
        bottom = r.ue()?;
    }

    let field_factor: u32 = if frame_mbs_only { 1 } else { 2 };
    let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
    let (crop_x, crop_y): (u32, u32) = match chroma_array_type {
        0 => (1, field_factor),
        1 => (2, 2 * field_factor),
        2 => (2, field_factor),
        _ => (1, field_factor),
    };

    // every value here comes straight from the stream
    let width = width_mbs
        .checked_mul(16)?
        .checked_sub(crop_x.checked_mul(left.checked_add(right)?)?)?;
    let height = field_factor
        .checked_mul(height_map_units)?
        .checked_mul(16)?
        .checked_sub(crop_y.checked_mul(top.checked_add(bottom)?)?)?;
    if width == 0 || height == 0 {
        return None;
    }
    Some(SpsGeometry { width, height })
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Option<()> {
    let mut last = 8i64;
    let mut next = 8i64;
    for _ in 0..size {
        if next != 0 {
            next = (last + r.se()? + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn flag(&mut self) -> Option<bool> {
        Some(self.bit()? == 1)
    }

    fn u(&mut self, n: u32) -> Option<u32> {
        let mut v = 0;
        for _ in 0..n {
            v = (v << 1) | self.bit()?;
        }
        Some(v)
    }

    fn ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        Some(((1u64 << zeros) - 1 + self.u(zeros)? as u64) as u32)
    }

    fn se(&mut self) -> Option<i64> {
        let k = self.ue()? as i64;
        Some(if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::baseline_sps;

    #[test]
    fn test_parse_720p() {
        let sps = baseline_sps(80, 45, None);
        assert_eq!(
            parse_sps_geometry(&sps),
            Some(SpsGeometry {
                width: 1280,
                height: 720
            })
        );
    }

    #[test]
    fn test_parse_1080p_with_cropping() {
        let sps = baseline_sps(120, 68, Some(4));
        assert_eq!(
            parse_sps_geometry(&sps),
            Some(SpsGeometry {
                width: 1920,
                height: 1080
            })
        );
    }

    #[test]
    fn test_rejects_non_sps_and_truncated() {
        assert_eq!(parse_sps_geometry(&[0x68, 0xce, 0x38, 0x80]), None);
        assert_eq!(parse_sps_geometry(&[0x67, 0x42]), None);
        assert_eq!(parse_sps_geometry(&[]), None);
    }

    #[test]
    fn test_oversized_values_rejected() {
        assert_eq!(parse_sps_geometry(&baseline_sps(1 << 28, 1, None)), None);
        assert_eq!(parse_sps_geometry(&baseline_sps(1, 1 << 28, None)), None);
        assert_eq!(parse_sps_geometry(&baseline_sps(80, 45, Some(1 << 31))), None);
    }

    #[test]
    fn test_emulation_prevention_removed() {
        assert_eq!(
            strip_emulation_prevention(&[0, 0, 3, 1, 0, 0, 3, 0]),
            vec![0, 0, 1, 0, 0, 0]
        );
    }
}
