// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The contract between the decoder and the kernel video device.
//!
//! A decoder device is a memory-to-memory, multi-planar video node with an
//! input queue carrying compressed bitstream buffers and an output queue
//! producing decoded frames, both backed by imported DMA-buf memory.
//! Correlation between the two sides travels through the buffer timestamp:
//! the decoder stamps each input buffer with a bitstream id and reads it
//! back from the output buffers the device produces.
//!
//! The implementation over real V4L2 nodes lives in [`v4l2`] behind the
//! `v4l2` feature; tests drive the same contract through a scripted
//! in-memory device.

#[cfg(test)]
pub(crate) mod dummy;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::os::fd::BorrowedFd;

use nix::poll::PollFlags;
use thiserror::Error;

use crate::video_frame::VideoFrame;
use crate::{Fourcc, Rect, Resolution, VideoCodec};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open device: {0}")]
    Open(String),
    #[error("device is missing capability: {0}")]
    MissingCapability(&'static str),
    #[error("format {0} not supported by device")]
    UnsupportedFormat(Fourcc),
    #[error("no buffer available")]
    NoBufferAvailable,
    #[error("{0} failed")]
    Ioctl(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Record of a dequeued output buffer.
#[derive(Debug, Clone, Copy)]
pub struct DequeuedOutputBuffer {
    /// The device slot the buffer was queued on.
    pub slot: usize,
    /// The correlation token read back from the buffer timestamp.
    pub bitstream_id: i32,
    pub bytes_used: usize,
    /// Set on the final buffer of a drain sequence.
    pub is_last: bool,
}

/// An fd the decoder wants its caller to sleep on, with the poll events
/// that signal there is work to do.
#[derive(Debug)]
pub struct WaitTarget<'a> {
    pub fd: BorrowedFd<'a>,
    pub events: PollFlags,
}

/// The compressed-bitstream side of the device.
pub trait InputQueue {
    /// Negotiates the compressed format; `buffer_size` is the size of the
    /// single bitstream plane.
    fn set_format(&mut self, format: Fourcc, buffer_size: usize) -> DeviceResult<()>;

    /// Requests `count` DMA-buf slots. Returns the number actually
    /// allocated, which may differ. Implies returning all buffers to the
    /// free pool.
    fn allocate_buffers(&mut self, count: usize) -> DeviceResult<usize>;

    fn stream_on(&mut self) -> DeviceResult<()>;
    fn stream_off(&mut self) -> DeviceResult<()>;

    fn num_free(&self) -> usize;
    fn num_queued(&self) -> usize;

    /// Size of the bitstream plane of the negotiated format.
    fn plane_size(&self) -> usize;

    /// Queues `[offset, offset + size)` of `dmabuf` on a free slot,
    /// carrying `bitstream_id` through the buffer timestamp.
    fn queue(
        &mut self,
        bitstream_id: i32,
        dmabuf: BorrowedFd,
        offset: usize,
        size: usize,
    ) -> DeviceResult<()>;

    /// Dequeues one consumed input buffer and returns its bitstream id, or
    /// `None` when no buffer is ready.
    fn try_dequeue(&mut self) -> DeviceResult<Option<i32>>;
}

/// The decoded-frame side of the device.
pub trait OutputQueue {
    /// Pixel formats the device can decode into.
    fn supported_formats(&self) -> DeviceResult<Vec<Fourcc>>;

    /// Attempts to select `format` at `coded_size`. The device may adjust
    /// the size; the result is observable through [`OutputQueue::format`].
    fn try_set_format(&mut self, format: Fourcc, coded_size: Resolution) -> DeviceResult<()>;

    /// The currently negotiated format and coded size.
    fn format(&self) -> DeviceResult<(Fourcc, Resolution)>;

    /// The visible rectangle according to the device's composition target,
    /// if it supports one.
    fn compose_rect(&self) -> Option<Rect>;

    /// Fallback visible rectangle from the legacy crop target.
    fn crop_rect(&self) -> Option<Rect>;

    fn allocate_buffers(&mut self, count: usize) -> DeviceResult<usize>;
    fn deallocate_buffers(&mut self) -> DeviceResult<()>;

    fn stream_on(&mut self) -> DeviceResult<()>;
    fn stream_off(&mut self) -> DeviceResult<()>;
    fn is_streaming(&self) -> bool;

    fn num_allocated(&self) -> usize;
    fn num_free(&self) -> usize;
    fn num_queued(&self) -> usize;

    /// Imports the frame's DMA-buf planes into `slot` and queues it.
    fn queue_frame(&mut self, slot: usize, frame: &VideoFrame) -> DeviceResult<()>;

    /// Dequeues one decoded buffer, or `None` when no buffer is ready.
    fn try_dequeue(&mut self) -> DeviceResult<Option<DequeuedOutputBuffer>>;
}

/// A handle on a memory-to-memory decoder device node.
pub trait DecoderDevice {
    type Input: InputQueue;
    type Output: OutputQueue;

    /// Opens a device able to decode `codec`, verifying it offers
    /// multi-planar memory-to-memory streaming.
    fn open(codec: VideoCodec) -> DeviceResult<Self>
    where
        Self: Sized;

    /// Probes support for the stop command, without which flushing cannot
    /// be implemented.
    fn try_stop_command(&mut self) -> DeviceResult<()>;

    fn subscribe_source_change(&mut self) -> DeviceResult<()>;

    /// Drains the device's event queue. Returns true when a source-change
    /// event carrying the resolution-change flag was seen.
    fn dequeue_source_change(&mut self) -> DeviceResult<bool>;

    /// Issues the stop decoder command, beginning a drain.
    fn send_stop_command(&mut self) -> DeviceResult<()>;

    /// Issues the start decoder command, resuming after a completed drain.
    fn send_start_command(&mut self) -> DeviceResult<()>;

    /// Minimum number of output buffers the driver needs for the current
    /// stream.
    fn min_output_buffers(&mut self) -> DeviceResult<usize>;

    /// Hands out the two queues. May only be called once.
    fn take_queues(&mut self) -> DeviceResult<(Self::Input, Self::Output)>;

    /// What to sleep on, given which directions currently have buffers
    /// in flight. `None` means the device cannot produce work right now.
    fn wait_target(&self, input_queued: bool, output_queued: bool) -> Option<WaitTarget<'_>>;
}
