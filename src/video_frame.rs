// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded output frames and the frame-pool contract.
//!
//! Frames are allocated by an external pool sized to the current coded
//! resolution. The decoder imports their DMA-buf handles into the device's
//! output queue and stamps each frame with its bitstream id and visible
//! rectangle before handing it to the component.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;

use crate::{HalPixelFormat, Rect, Resolution};

/// A decoded video frame backed by imported DMA-buf memory.
#[derive(Debug)]
pub struct VideoFrame {
    /// Stable identity of the backing block within its pool. Blocks keep
    /// their device slot across round trips through the pool.
    block_id: u32,
    planes: Vec<Arc<OwnedFd>>,
    coded_size: Resolution,
    bitstream_id: i32,
    visible_rect: Rect,
}

impl VideoFrame {
    pub fn new(block_id: u32, planes: Vec<Arc<OwnedFd>>, coded_size: Resolution) -> VideoFrame {
        VideoFrame {
            block_id,
            planes,
            coded_size,
            bitstream_id: -1,
            visible_rect: Rect::default(),
        }
    }

    pub fn block_id(&self) -> u32 {
        self.block_id
    }

    /// The DMA-buf handle of each plane, in plane order.
    pub fn fds(&self) -> &[Arc<OwnedFd>] {
        &self.planes
    }

    pub fn coded_size(&self) -> Resolution {
        self.coded_size
    }

    pub fn bitstream_id(&self) -> i32 {
        self.bitstream_id
    }

    pub fn set_bitstream_id(&mut self, bitstream_id: i32) {
        self.bitstream_id = bitstream_id;
    }

    pub fn visible_rect(&self) -> Rect {
        self.visible_rect
    }

    pub fn set_visible_rect(&mut self, rect: Rect) {
        self.visible_rect = rect;
    }
}

/// An asynchronous allocator of output frames.
///
/// Pools service a single request at a time: `request_frame` arms one, the
/// fd returned by `poll_fd` becomes readable once a frame is available, and
/// `take_frame` collects it. Dropping the pool cancels any outstanding
/// request.
pub trait VideoFramePool {
    /// Arms a frame request. Returns false if a previous request is still
    /// outstanding, in which case the call is a no-op.
    fn request_frame(&mut self) -> bool;

    /// Takes the frame satisfying the armed request, if it has arrived.
    fn take_frame(&mut self) -> Option<VideoFrame>;

    /// Readable whenever a requested frame is waiting to be taken.
    fn poll_fd(&self) -> BorrowedFd<'_>;
}

/// Produces a pool for the given coded size, pixel format and buffer count.
/// Returning `None` means the pool could not be created; the decoder treats
/// this as fatal.
pub type GetVideoFramePoolFn =
    Box<dyn FnMut(Resolution, HalPixelFormat, usize) -> Option<Box<dyn VideoFramePool>>>;
