// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Extraction of coded color aspects from H.264 codec-specific data.
//!
//! The component only needs one thing from the bitstream: the colour
//! description carried in the VUI of the first SPS of a CSD work. The
//! reader handles emulation-prevention bytes; the SPS walk skips exactly
//! the syntax elements preceding the colour description.

use std::io::Cursor;

use anyhow::anyhow;
use bytes::Buf;

use crate::c2::ColorAspects;

/// A bit reader over RBSP data that strips emulation-prevention bytes.
struct NaluReader<'a> {
    data: Cursor<&'a [u8]>,
    curr_byte: u32,
    num_remaining_bits_in_curr_byte: usize,
    /// Last two bytes seen, for emulation-prevention detection.
    prev_two_bytes: u32,
}

impl<'a> NaluReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: 0,
            num_remaining_bits_in_curr_byte: 0,
            prev_two_bytes: 0xffff,
        }
    }

    fn get_byte(&mut self) -> anyhow::Result<u8> {
        if self.data.remaining() == 0 {
            return Err(anyhow!("reader ran out of bits"));
        }
        Ok(self.data.get_u8())
    }

    fn update_curr_byte(&mut self) -> anyhow::Result<()> {
        let mut byte = self.get_byte()?;

        if (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
            // Skip the emulation-prevention byte; three more bytes must pass
            // before another one can occur.
            byte = self.get_byte()?;
            self.prev_two_bytes = 0xffff;
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);
        self.curr_byte = u32::from(byte);
        Ok(())
    }

    fn read_bit(&mut self) -> anyhow::Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    /// Reads up to 31 bits from the stream.
    fn read_bits(&mut self, num_bits: usize) -> anyhow::Result<u32> {
        if num_bits > 31 {
            return Err(anyhow!("more than 31 ({}) bits requested", num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0u32;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        Ok(out)
    }

    fn skip_bits(&mut self, mut num_bits: usize) -> anyhow::Result<()> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 31);
            self.read_bits(n)?;
            num_bits -= n;
        }
        Ok(())
    }

    fn read_ue(&mut self) -> anyhow::Result<u32> {
        let mut num_zeroes = 0;
        while !self.read_bit()? {
            num_zeroes += 1;
            if num_zeroes > 31 {
                return Err(anyhow!("invalid exp-Golomb code"));
            }
        }

        let mut value = (1u32 << num_zeroes) - 1;
        if num_zeroes > 0 {
            value = value
                .checked_add(self.read_bits(num_zeroes)?)
                .ok_or_else(|| anyhow!("exp-Golomb code out of range"))?;
        }
        Ok(value)
    }

    fn read_se(&mut self) -> anyhow::Result<i32> {
        let ue = self.read_ue()? as i32;
        if ue % 2 == 0 {
            Ok(-ue / 2)
        } else {
            Ok(ue / 2 + 1)
        }
    }
}

/// Returns the payload (header byte excluded) of the first SPS NAL unit in
/// an Annex-B stream, if any.
fn find_sps(data: &[u8]) -> Option<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    for (n, &start) in starts.iter().enumerate() {
        if start >= data.len() {
            continue;
        }
        let nalu_type = data[start] & 0x1f;
        if nalu_type != 7 {
            continue;
        }
        let mut end = starts.get(n + 1).map(|next| next - 3).unwrap_or(data.len());
        // A four-byte start code owns the zero before it.
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        return Some(&data[start + 1..end]);
    }

    None
}

fn skip_scaling_list(r: &mut NaluReader, size: usize) -> anyhow::Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = r.read_se()?;
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Walks an SPS RBSP up to the VUI colour description and returns it.
fn parse_sps_color_aspects(rbsp: &[u8]) -> anyhow::Result<Option<ColorAspects>> {
    let r = &mut NaluReader::new(rbsp);

    let profile_idc = r.read_bits(8)?;
    // constraint_setN_flags and reserved_zero_2bits, then level_idc.
    r.skip_bits(16)?;
    let _seq_parameter_set_id = r.read_ue()?;

    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            let _separate_colour_plane_flag = r.read_bit()?;
        }
        let _bit_depth_luma_minus8 = r.read_ue()?;
        let _bit_depth_chroma_minus8 = r.read_ue()?;
        let _qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
        if r.read_bit()? {
            // seq_scaling_matrix_present_flag
            let num_lists = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..num_lists {
                if r.read_bit()? {
                    skip_scaling_list(r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num_minus4 = r.read_ue()?;
    let pic_order_cnt_type = r.read_ue()?;
    match pic_order_cnt_type {
        0 => {
            let _log2_max_pic_order_cnt_lsb_minus4 = r.read_ue()?;
        }
        1 => {
            let _delta_pic_order_always_zero_flag = r.read_bit()?;
            let _offset_for_non_ref_pic = r.read_se()?;
            let _offset_for_top_to_bottom_field = r.read_se()?;
            let num_ref_frames_in_pic_order_cnt_cycle = r.read_ue()?;
            if num_ref_frames_in_pic_order_cnt_cycle > 255 {
                return Err(anyhow!("invalid num_ref_frames_in_pic_order_cnt_cycle"));
            }
            for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
                let _offset_for_ref_frame = r.read_se()?;
            }
        }
        _ => (),
    }

    let _max_num_ref_frames = r.read_ue()?;
    let _gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
    let _pic_width_in_mbs_minus1 = r.read_ue()?;
    let _pic_height_in_map_units_minus1 = r.read_ue()?;
    if !r.read_bit()? {
        // frame_mbs_only_flag unset
        let _mb_adaptive_frame_field_flag = r.read_bit()?;
    }
    let _direct_8x8_inference_flag = r.read_bit()?;
    if r.read_bit()? {
        // frame_cropping_flag
        for _ in 0..4 {
            let _crop_offset = r.read_ue()?;
        }
    }

    if !r.read_bit()? {
        // No VUI parameters.
        return Ok(None);
    }

    if r.read_bit()? {
        // aspect_ratio_info_present_flag
        let aspect_ratio_idc = r.read_bits(8)?;
        if aspect_ratio_idc == 255 {
            // sar_width and sar_height
            r.skip_bits(32)?;
        }
    }
    if r.read_bit()? {
        // overscan_info_present_flag
        let _overscan_appropriate_flag = r.read_bit()?;
    }

    if !r.read_bit()? {
        // video_signal_type_present_flag unset: no colour information.
        return Ok(None);
    }
    let _video_format = r.read_bits(3)?;
    let video_full_range_flag = r.read_bit()?;
    if !r.read_bit()? {
        // colour_description_present_flag unset.
        return Ok(None);
    }
    let colour_primaries = r.read_bits(8)? as u8;
    let transfer_characteristics = r.read_bits(8)? as u8;
    let matrix_coefficients = r.read_bits(8)? as u8;

    Ok(Some(ColorAspects::from_iso(
        colour_primaries,
        transfer_characteristics,
        matrix_coefficients,
        video_full_range_flag,
    )))
}

/// Extracts the colour description from the first SPS of `data`, an Annex-B
/// bitstream. Returns `None` when there is no SPS, the SPS carries no colour
/// description, or the stream is malformed.
pub fn parse_coded_color_aspects(data: &[u8]) -> Option<ColorAspects> {
    let sps = match find_sps(data) {
        Some(sps) => sps,
        None => {
            log::debug!("Couldn't find SPS");
            return None;
        }
    };

    match parse_sps_color_aspects(sps) {
        Ok(aspects) => aspects,
        Err(e) => {
            log::debug!("Couldn't parse color description from SPS: {:#}", e);
            None
        }
    }
}
