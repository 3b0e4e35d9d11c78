// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Static per-component interface data.
//!
//! The full parameter-reflection machinery of the codec framework stays on
//! the client side; the component only needs the handful of values below,
//! plus a place to store the colour aspects parsed out of codec-specific
//! data so output buffers can be annotated with them.

use std::sync::Mutex;

use crate::c2::{C2Status, ColorAspects};
use crate::VideoCodec;

/// Every input buffer is negotiated to this size. 1 MB per decoding unit is
/// enough for the streams this component accepts.
const INPUT_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub struct DecodeInterface {
    name: String,
    codec: VideoCodec,
    secure: bool,
    block_pool_id: u64,
    coded_color_aspects: Mutex<Option<ColorAspects>>,
}

impl DecodeInterface {
    /// Builds the interface for a component name such as
    /// `c2.v4l2.avc.decoder` or `c2.v4l2.vp9.decoder.secure`.
    pub fn new(name: &str, block_pool_id: u64) -> Result<DecodeInterface, C2Status> {
        let codec = if name.contains(".avc.") || name.ends_with(".avc") {
            VideoCodec::H264
        } else if name.contains(".vp8.") || name.ends_with(".vp8") {
            VideoCodec::VP8
        } else if name.contains(".vp9.") || name.ends_with(".vp9") {
            VideoCodec::VP9
        } else if name.contains(".hevc.") || name.ends_with(".hevc") {
            VideoCodec::HEVC
        } else {
            log::error!("No codec for component name: {}", name);
            return Err(C2Status::C2BadValue);
        };

        Ok(DecodeInterface {
            name: name.to_owned(),
            codec,
            secure: name.contains(".secure"),
            block_pool_id,
            coded_color_aspects: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn video_codec(&self) -> VideoCodec {
        self.codec
    }

    /// Secure instances get no CPU mapping of the bitstream, which disables
    /// colour-aspects parsing.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn input_buffer_size(&self) -> usize {
        INPUT_BUFFER_SIZE
    }

    /// How many decoded frames the codec may hold back before emitting the
    /// first one, sized after the reference-frame requirements of each
    /// codec.
    pub fn output_delay(&self) -> usize {
        match self.codec {
            VideoCodec::H264 | VideoCodec::HEVC => 16,
            VideoCodec::VP8 => 4,
            VideoCodec::VP9 => 9,
        }
    }

    /// The block pool configured by the client for output allocation.
    pub fn block_pool_id(&self) -> u64 {
        self.block_pool_id
    }

    /// Configuration hook: commits colour aspects parsed from the stream.
    pub fn config_coded_color_aspects(&self, aspects: ColorAspects) {
        *self.coded_color_aspects.lock().unwrap() = Some(aspects);
    }

    /// The colour aspects output buffers should currently be annotated
    /// with. Unspecified until codec-specific data has been parsed.
    pub fn query_color_aspects(&self) -> ColorAspects {
        self.coded_color_aspects.lock().unwrap().unwrap_or_default()
    }
}
