// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Codec2-shaped work model exchanged with the client framework.
//!
//! A [`Work`] carries at most one compressed input buffer and exactly one
//! worklet describing the expected output. Works are correlated with device
//! buffers through a 30-bit bitstream id derived from the frame index.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use bitflags::bitflags;

use crate::video_frame::VideoFrame;

/// Status codes reported to the client. Numerical values taken from
/// frameworks/av/media/codec2/core/include/C2.h so they can cross an FFI
/// boundary unchanged.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub enum C2Status {
    #[default]
    C2Ok = 0,
    C2BadState = 1,   // EPERM
    C2NotFound = 2,   // ENOENT
    C2Blocking = 11,  // EAGAIN
    C2NoMemory = 12,  // ENOMEM
    C2Corrupted = 14, // EFAULT
    C2BadValue = 22,  // EINVAL
    C2Omitted = 38,   // ENOSYS
}

/// Externally observable component states.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ComponentState {
    Stopped,
    Running,
    // On Error, stop() must be called before start() works again.
    Error,
    Released,
}

bitflags! {
    /// Frame flags, matching C2FrameData::flags_t bit positions.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        const DROP_FRAME = 1 << 0;
        const END_OF_STREAM = 1 << 1;
        const DISCARD_FRAME = 1 << 2;
        const CODEC_CONFIG = 1 << 31;
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        FrameFlags::empty()
    }
}

/// Drain modes accepted by `drain()`.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DrainMode {
    /// Drain into the next component of a tunnel. Not supported.
    Chain,
    ComponentNoEos,
    ComponentWithEos,
}

/// Flush modes accepted by `flush()`.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum FlushMode {
    Component,
    /// Flush through a tunnel. Not supported.
    Chain,
}

/// Monotonic ordering information attached to every work.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WorkOrdinal {
    pub frame_index: u64,
    pub timestamp: u64,
}

/// Maps a frame index to the correlation token carried through the device's
/// buffer timestamp. Masked to 30 bits to avoid wraparound on the signed
/// seconds field; collisions require 2^30 in-flight frames.
pub fn frame_index_to_bitstream_id(frame_index: u64) -> i32 {
    (frame_index & 0x3FFF_FFFF) as i32
}

/// A linear block of compressed bitstream data backed by a DMA-buf.
///
/// `data` is the CPU mapping of the block and may be empty for secure
/// streams, in which case only the DMA-buf handle is meaningful.
#[derive(Debug, Clone)]
pub struct LinearBlock {
    pub dmabuf: Arc<OwnedFd>,
    pub data: Arc<Vec<u8>>,
    pub offset: usize,
    pub size: usize,
}

impl LinearBlock {
    /// The mapped payload of this block, or an empty slice when the block
    /// is not CPU-readable.
    pub fn payload(&self) -> &[u8] {
        let end = self.offset.saturating_add(self.size);
        self.data.get(self.offset..end).unwrap_or(&[])
    }
}

/// Color aspects attached to output buffers, as parsed from the stream.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ColorAspects {
    pub primaries: ColorPrimaries,
    pub transfer: ColorTransfer,
    pub matrix: ColorMatrix,
    pub range: ColorRange,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ColorPrimaries {
    #[default]
    Unspecified,
    Bt709,
    Bt601_625,
    Bt601_525,
    Bt2020,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ColorTransfer {
    #[default]
    Unspecified,
    Smpte170M,
    Linear,
    Srgb,
    St2084,
    Hlg,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ColorMatrix {
    #[default]
    Unspecified,
    Bt709,
    Bt601,
    Bt2020,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ColorRange {
    #[default]
    Unspecified,
    Full,
    Limited,
}

impl ColorAspects {
    /// Maps ISO/IEC 23001-8 code points (as carried in an H.264 VUI colour
    /// description) onto the codec framework's enums. Unknown code points
    /// degrade to Unspecified.
    pub fn from_iso(primaries: u8, transfer: u8, matrix: u8, full_range: bool) -> ColorAspects {
        ColorAspects {
            primaries: match primaries {
                1 => ColorPrimaries::Bt709,
                5 => ColorPrimaries::Bt601_625,
                6 => ColorPrimaries::Bt601_525,
                9 => ColorPrimaries::Bt2020,
                _ => ColorPrimaries::Unspecified,
            },
            transfer: match transfer {
                1 | 6 | 7 => ColorTransfer::Smpte170M,
                8 => ColorTransfer::Linear,
                13 => ColorTransfer::Srgb,
                16 => ColorTransfer::St2084,
                18 => ColorTransfer::Hlg,
                _ => ColorTransfer::Unspecified,
            },
            matrix: match matrix {
                1 => ColorMatrix::Bt709,
                5 | 6 => ColorMatrix::Bt601,
                9 | 10 => ColorMatrix::Bt2020,
                _ => ColorMatrix::Unspecified,
            },
            range: if full_range { ColorRange::Full } else { ColorRange::Limited },
        }
    }
}

/// A decoded output buffer handed back to the client, wrapping the graphic
/// block produced by the device together with any attached stream info.
#[derive(Debug)]
pub struct GraphicBuffer {
    pub frame: VideoFrame,
    pub color_aspects: Option<ColorAspects>,
}

/// Input payload of a work. `buffers` holds at most one entry; a `None`
/// entry stands for a buffer that was released (or was never supplied, for
/// EOS and empty-CSD works) so completion checks stay uniform.
#[derive(Debug, Default)]
pub struct FrameData {
    pub flags: FrameFlags,
    pub ordinal: WorkOrdinal,
    pub buffers: Vec<Option<LinearBlock>>,
}

/// Expected output of a work.
#[derive(Debug, Default)]
pub struct WorkletOutput {
    pub flags: FrameFlags,
    pub ordinal: WorkOrdinal,
    pub buffers: Vec<GraphicBuffer>,
}

#[derive(Debug, Default)]
pub struct Worklet {
    pub output: WorkletOutput,
}

/// One unit of client submission.
#[derive(Debug, Default)]
pub struct Work {
    pub input: FrameData,
    pub worklets: Vec<Worklet>,
    pub worklets_processed: u32,
    pub result: C2Status,
}

impl Work {
    /// Builds a work with a single empty worklet, the shape every valid
    /// submission must have.
    pub fn new(flags: FrameFlags, ordinal: WorkOrdinal, input: Option<LinearBlock>) -> Work {
        Work {
            input: FrameData {
                flags,
                ordinal,
                buffers: input.map(Some).into_iter().collect(),
            },
            worklets: vec![Worklet::default()],
            worklets_processed: 0,
            result: C2Status::C2Ok,
        }
    }

    pub fn bitstream_id(&self) -> i32 {
        frame_index_to_bitstream_id(self.input.ordinal.frame_index)
    }

    pub fn is_eos(&self) -> bool {
        self.input.flags.contains(FrameFlags::END_OF_STREAM)
    }

    pub fn is_csd(&self) -> bool {
        self.input.flags.contains(FrameFlags::CODEC_CONFIG)
    }

    /// Whether the input buffer has been released (or was a placeholder).
    pub fn input_released(&self) -> bool {
        matches!(self.input.buffers.first(), Some(None))
    }

    /// Releases the input buffer. Works that never carried one are left
    /// untouched.
    pub fn release_input(&mut self) {
        if let Some(slot) = self.input.buffers.first_mut() {
            *slot = None;
        }
    }
}

/// Callbacks into the client framework. Invoked on the decoder sequence.
pub trait Listener: Send + Sync {
    /// One or more works finished; `result` on each tells how.
    fn on_work_done(&self, works: Vec<Work>);
    /// The component entered the error state.
    fn on_error(&self, status: C2Status);
}
