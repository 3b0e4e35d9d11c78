// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder-device implementation over V4L2 memory-to-memory nodes, built on
//! the `v4l2r` crate. The device's OUTPUT queue carries the compressed
//! bitstream and its CAPTURE queue the decoded frames; both use imported
//! DMA-buf memory.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::Arc;

use nix::poll::PollFlags;

use v4l2r::device::queue::direction::{Capture, Output};
use v4l2r::device::queue::qbuf::get_free::GetFreeOutputBuffer;
use v4l2r::device::queue::qbuf::get_indexed::GetCaptureBufferByIndex;
use v4l2r::device::queue::qbuf::{CaptureQueueable, OutputQueueable};
use v4l2r::device::queue::{BuffersAllocated, Queue, QueueInit};
use v4l2r::device::{AllocatedQueue, Device, DeviceConfig, Stream, TryDequeue};
use v4l2r::ioctl;
use v4l2r::memory::DmaBufHandle;
use v4l2r::nix::sys::time::TimeVal;
use v4l2r::{Format, PixelFormat, PlaneLayout, QueueType};

use crate::device::{
    DecoderDevice, DequeuedOutputBuffer, DeviceError, DeviceResult, InputQueue, OutputQueue,
    WaitTarget,
};
use crate::video_frame::VideoFrame;
use crate::{Fourcc, Rect, Resolution, VideoCodec};

type DmaBufPlanes = Vec<DmaBufHandle<File>>;

// Decoder nodes are not enumerated past this index.
const MAX_DEVICE_NODES: usize = 64;

#[doc(hidden)]
mod ctrl_ioctl {
    use v4l2r::bindings::v4l2_control;
    nix::ioctl_readwrite!(vidioc_g_ctrl, b'V', 27, v4l2_control);
}

fn dup_fd(fd: BorrowedFd) -> DeviceResult<File> {
    Ok(File::from(fd.try_clone_to_owned()?))
}

pub struct V4l2Device {
    device: Arc<Device>,
    queues_taken: bool,
}

impl V4l2Device {
    /// Whether this node can decode `pixelformat` through a multi-planar
    /// memory-to-memory interface.
    fn is_decoder_for(device: &Device, pixelformat: PixelFormat) -> bool {
        let caps: ioctl::Capability = match ioctl::querycap(device) {
            Ok(caps) => caps,
            Err(_) => return false,
        };
        if !caps.device_caps().contains(
            ioctl::Capabilities::VIDEO_M2M_MPLANE | ioctl::Capabilities::STREAMING,
        ) {
            return false;
        }

        ioctl::FormatIterator::new(device, QueueType::VideoOutputMplane)
            .any(|desc| desc.pixelformat == pixelformat)
    }
}

impl DecoderDevice for V4l2Device {
    type Input = V4l2InputQueue;
    type Output = V4l2OutputQueue;

    fn open(codec: VideoCodec) -> DeviceResult<Self> {
        let pixelformat = PixelFormat::from_u32(codec.compressed_format().0);

        for index in 0..MAX_DEVICE_NODES {
            let path = PathBuf::from(format!("/dev/video{}", index));
            if !path.exists() {
                continue;
            }

            let device = match Device::open(&path, DeviceConfig::new().non_blocking_dqbuf()) {
                Ok(device) => device,
                Err(e) => {
                    log::debug!("Failed to open {}: {}", path.display(), e);
                    continue;
                }
            };

            if !Self::is_decoder_for(&device, pixelformat) {
                continue;
            }

            log::info!("Using {} to decode {}", path.display(), codec);
            return Ok(V4l2Device { device: Arc::new(device), queues_taken: false });
        }

        log::error!("Failed to find a decoder device for {}", codec);
        Err(DeviceError::Open(format!("no device supports {}", codec)))
    }

    fn try_stop_command(&mut self) -> DeviceResult<()> {
        ioctl::try_decoder_cmd(&*self.device, ioctl::DecoderCommand::Stop)
            .map_err(|_| DeviceError::Ioctl("TRY_DECODER_CMD"))
    }

    fn subscribe_source_change(&mut self) -> DeviceResult<()> {
        ioctl::subscribe_event(
            &*self.device,
            ioctl::EventType::SourceChange(0),
            ioctl::SubscribeEventFlags::empty(),
        )
        .map_err(|_| DeviceError::Ioctl("SUBSCRIBE_EVENT"))
    }

    fn dequeue_source_change(&mut self) -> DeviceResult<bool> {
        let mut resolution_changed = false;
        loop {
            match ioctl::dqevent::<ioctl::Event>(&*self.device) {
                Ok(ioctl::Event::SrcChangeEvent(changes)) => {
                    if changes.contains(ioctl::SrcChanges::RESOLUTION) {
                        resolution_changed = true;
                    }
                }
                Ok(_) => (),
                Err(ioctl::DqEventError::NotReady) => break,
                Err(_) => return Err(DeviceError::Ioctl("DQEVENT")),
            }
        }
        Ok(resolution_changed)
    }

    fn send_stop_command(&mut self) -> DeviceResult<()> {
        ioctl::decoder_cmd(&*self.device, ioctl::DecoderCommand::Stop)
            .map_err(|_| DeviceError::Ioctl("DECODER_CMD"))
    }

    fn send_start_command(&mut self) -> DeviceResult<()> {
        ioctl::decoder_cmd(&*self.device, ioctl::DecoderCommand::Start)
            .map_err(|_| DeviceError::Ioctl("DECODER_CMD"))
    }

    fn min_output_buffers(&mut self) -> DeviceResult<usize> {
        let mut ctrl = v4l2r::bindings::v4l2_control {
            id: v4l2r::bindings::V4L2_CID_MIN_BUFFERS_FOR_CAPTURE,
            value: 0,
        };
        unsafe { ctrl_ioctl::vidioc_g_ctrl(self.device.as_raw_fd(), &mut ctrl) }
            .map_err(|_| DeviceError::Ioctl("G_CTRL"))?;
        log::debug!("MIN_BUFFERS_FOR_CAPTURE returns {}", ctrl.value);
        Ok(ctrl.value as usize)
    }

    fn take_queues(&mut self) -> DeviceResult<(Self::Input, Self::Output)> {
        if self.queues_taken {
            return Err(DeviceError::Ioctl("REQBUFS"));
        }
        self.queues_taken = true;

        let input = Queue::get_output_mplane_queue(Arc::clone(&self.device))
            .map_err(|_| DeviceError::Ioctl("REQBUFS"))?;
        let output = Queue::get_capture_mplane_queue(Arc::clone(&self.device))
            .map_err(|_| DeviceError::Ioctl("REQBUFS"))?;

        Ok((
            V4l2InputQueue { state: InputQueueState::Init(input), plane_size: 0 },
            V4l2OutputQueue { state: OutputQueueState::Init(output), streaming: false },
        ))
    }

    fn wait_target(&self, input_queued: bool, output_queued: bool) -> Option<WaitTarget<'_>> {
        if !input_queued && !output_queued {
            // With nothing in flight the node would only signal POLLERR.
            return None;
        }

        let mut events = PollFlags::POLLPRI;
        if input_queued {
            events |= PollFlags::POLLOUT;
        }
        if output_queued {
            events |= PollFlags::POLLIN;
        }

        // The fd is owned by `self.device`, which outlives the borrow.
        let fd = unsafe { BorrowedFd::borrow_raw(self.device.as_raw_fd()) };
        Some(WaitTarget { fd, events })
    }
}

#[derive(Default)]
enum InputQueueState {
    Init(Queue<Output, QueueInit>),
    Allocated(Queue<Output, BuffersAllocated<DmaBufPlanes>>),
    #[default]
    Invalid,
}

pub struct V4l2InputQueue {
    state: InputQueueState,
    plane_size: usize,
}

impl InputQueue for V4l2InputQueue {
    fn set_format(&mut self, format: Fourcc, buffer_size: usize) -> DeviceResult<()> {
        let queue = match &mut self.state {
            InputQueueState::Init(queue) => queue,
            _ => return Err(DeviceError::Ioctl("S_FMT")),
        };

        let applied: Format = queue
            .change_format()
            .map_err(|_| DeviceError::Ioctl("G_FMT"))?
            .set_pixelformat(PixelFormat::from_u32(format.0))
            .set_planes_layout(vec![PlaneLayout {
                sizeimage: buffer_size as u32,
                ..Default::default()
            }])
            .apply()
            .map_err(|_| DeviceError::Ioctl("S_FMT"))?;

        if applied.pixelformat.to_u32() != format.0 {
            return Err(DeviceError::UnsupportedFormat(format));
        }
        self.plane_size = applied
            .plane_fmt
            .first()
            .map(|plane| plane.sizeimage as usize)
            .unwrap_or(0);
        Ok(())
    }

    fn allocate_buffers(&mut self, count: usize) -> DeviceResult<usize> {
        self.state = match std::mem::take(&mut self.state) {
            InputQueueState::Init(queue) => InputQueueState::Allocated(
                queue
                    .request_buffers::<DmaBufPlanes>(count as u32)
                    .map_err(|_| DeviceError::Ioctl("REQBUFS"))?,
            ),
            _ => return Err(DeviceError::Ioctl("REQBUFS")),
        };
        match &self.state {
            InputQueueState::Allocated(queue) => Ok(queue.num_buffers()),
            _ => unreachable!(),
        }
    }

    fn stream_on(&mut self) -> DeviceResult<()> {
        match &self.state {
            InputQueueState::Allocated(queue) => {
                queue.stream_on().map_err(|_| DeviceError::Ioctl("STREAMON"))
            }
            _ => Err(DeviceError::Ioctl("STREAMON")),
        }
    }

    fn stream_off(&mut self) -> DeviceResult<()> {
        match &self.state {
            InputQueueState::Allocated(queue) => {
                queue.stream_off().map_err(|_| DeviceError::Ioctl("STREAMOFF"))?;
                Ok(())
            }
            _ => Err(DeviceError::Ioctl("STREAMOFF")),
        }
    }

    fn num_free(&self) -> usize {
        match &self.state {
            InputQueueState::Allocated(queue) => queue.num_free_buffers(),
            _ => 0,
        }
    }

    fn num_queued(&self) -> usize {
        match &self.state {
            InputQueueState::Allocated(queue) => queue.num_queued_buffers(),
            _ => 0,
        }
    }

    fn plane_size(&self) -> usize {
        self.plane_size
    }

    fn queue(
        &mut self,
        bitstream_id: i32,
        dmabuf: BorrowedFd,
        offset: usize,
        size: usize,
    ) -> DeviceResult<()> {
        let queue = match &self.state {
            InputQueueState::Allocated(queue) => queue,
            _ => return Err(DeviceError::Ioctl("QBUF")),
        };

        let buffer = queue
            .try_get_free_buffer()
            .map_err(|_| DeviceError::NoBufferAvailable)?;

        if offset != 0 {
            // The queued length spans the payload from the start of the
            // block; the decoder resynchronizes on the next start code.
            log::debug!("Input buffer at nonzero offset {}", offset);
        }

        let handle = DmaBufHandle::from(dup_fd(dmabuf)?);
        buffer
            .set_timestamp(TimeVal::new(bitstream_id as i64, 0))
            .queue_with_handles(vec![handle], &[offset + size])
            .map_err(|_| DeviceError::Ioctl("QBUF"))
    }

    fn try_dequeue(&mut self) -> DeviceResult<Option<i32>> {
        let queue = match &self.state {
            InputQueueState::Allocated(queue) => queue,
            _ => return Ok(None),
        };

        match queue.try_dequeue() {
            Ok(buffer) => Ok(Some(buffer.data.timestamp().tv_sec as i32)),
            Err(ioctl::DqBufError::IoctlError(ioctl::DqBufIoctlError::NotReady)) => Ok(None),
            Err(_) => Err(DeviceError::Ioctl("DQBUF")),
        }
    }
}

#[derive(Default)]
enum OutputQueueState {
    Init(Queue<Capture, QueueInit>),
    Allocated(Queue<Capture, BuffersAllocated<DmaBufPlanes>>),
    #[default]
    Invalid,
}

pub struct V4l2OutputQueue {
    state: OutputQueueState,
    streaming: bool,
}

impl V4l2OutputQueue {
    fn selection_rect(&self, target: ioctl::SelectionTarget) -> Option<Rect> {
        let rect: v4l2r::Rect = match &self.state {
            OutputQueueState::Init(queue) => queue.get_selection(target).ok()?,
            OutputQueueState::Allocated(queue) => queue.get_selection(target).ok()?,
            OutputQueueState::Invalid => return None,
        };

        if rect.left < 0 || rect.top < 0 {
            return None;
        }
        let left = rect.left as u32;
        let top = rect.top as u32;
        Some(Rect::new(left, top, left + rect.width, top + rect.height))
    }
}

impl OutputQueue for V4l2OutputQueue {
    fn supported_formats(&self) -> DeviceResult<Vec<Fourcc>> {
        let iter = match &self.state {
            OutputQueueState::Init(queue) => queue.format_iter(),
            OutputQueueState::Allocated(queue) => queue.format_iter(),
            OutputQueueState::Invalid => return Err(DeviceError::Ioctl("ENUM_FMT")),
        };
        Ok(iter.map(|desc| Fourcc(desc.pixelformat.to_u32())).collect())
    }

    fn try_set_format(&mut self, format: Fourcc, coded_size: Resolution) -> DeviceResult<()> {
        let builder = match &mut self.state {
            OutputQueueState::Init(queue) => queue.change_format(),
            OutputQueueState::Allocated(queue) => queue.change_format(),
            OutputQueueState::Invalid => return Err(DeviceError::Ioctl("S_FMT")),
        };

        let applied: Format = builder
            .map_err(|_| DeviceError::Ioctl("G_FMT"))?
            .set_size(coded_size.width as usize, coded_size.height as usize)
            .set_pixelformat(PixelFormat::from_u32(format.0))
            .apply()
            .map_err(|_| DeviceError::Ioctl("S_FMT"))?;

        if applied.pixelformat.to_u32() != format.0 {
            return Err(DeviceError::UnsupportedFormat(format));
        }
        Ok(())
    }

    fn format(&self) -> DeviceResult<(Fourcc, Resolution)> {
        let format: Format = match &self.state {
            OutputQueueState::Init(queue) => queue.get_format(),
            OutputQueueState::Allocated(queue) => queue.get_format(),
            OutputQueueState::Invalid => return Err(DeviceError::Ioctl("G_FMT")),
        }
        .map_err(|_| DeviceError::Ioctl("G_FMT"))?;

        Ok((
            Fourcc(format.pixelformat.to_u32()),
            Resolution::new(format.width, format.height),
        ))
    }

    fn compose_rect(&self) -> Option<Rect> {
        self.selection_rect(ioctl::SelectionTarget::Compose)
    }

    fn crop_rect(&self) -> Option<Rect> {
        self.selection_rect(ioctl::SelectionTarget::Crop)
    }

    fn allocate_buffers(&mut self, count: usize) -> DeviceResult<usize> {
        self.state = match std::mem::take(&mut self.state) {
            OutputQueueState::Init(queue) => OutputQueueState::Allocated(
                queue
                    .request_buffers::<DmaBufPlanes>(count as u32)
                    .map_err(|_| DeviceError::Ioctl("REQBUFS"))?,
            ),
            _ => return Err(DeviceError::Ioctl("REQBUFS")),
        };
        match &self.state {
            OutputQueueState::Allocated(queue) => Ok(queue.num_buffers()),
            _ => unreachable!(),
        }
    }

    fn deallocate_buffers(&mut self) -> DeviceResult<()> {
        self.state = match std::mem::take(&mut self.state) {
            OutputQueueState::Allocated(queue) => {
                let result = queue.free_buffers().map_err(|_| DeviceError::Ioctl("REQBUFS"))?;
                OutputQueueState::Init(result.queue)
            }
            other => other,
        };
        self.streaming = false;
        Ok(())
    }

    fn stream_on(&mut self) -> DeviceResult<()> {
        match &self.state {
            OutputQueueState::Allocated(queue) => {
                queue.stream_on().map_err(|_| DeviceError::Ioctl("STREAMON"))?;
                self.streaming = true;
                Ok(())
            }
            _ => Err(DeviceError::Ioctl("STREAMON")),
        }
    }

    fn stream_off(&mut self) -> DeviceResult<()> {
        match &self.state {
            OutputQueueState::Allocated(queue) => {
                queue.stream_off().map_err(|_| DeviceError::Ioctl("STREAMOFF"))?;
                self.streaming = false;
                Ok(())
            }
            // Nothing is streaming before the first allocation.
            _ => {
                self.streaming = false;
                Ok(())
            }
        }
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn num_allocated(&self) -> usize {
        match &self.state {
            OutputQueueState::Allocated(queue) => queue.num_buffers(),
            _ => 0,
        }
    }

    fn num_free(&self) -> usize {
        match &self.state {
            OutputQueueState::Allocated(queue) => queue.num_free_buffers(),
            _ => 0,
        }
    }

    fn num_queued(&self) -> usize {
        match &self.state {
            OutputQueueState::Allocated(queue) => queue.num_queued_buffers(),
            _ => 0,
        }
    }

    fn queue_frame(&mut self, slot: usize, frame: &VideoFrame) -> DeviceResult<()> {
        let queue = match &self.state {
            OutputQueueState::Allocated(queue) => queue,
            _ => return Err(DeviceError::Ioctl("QBUF")),
        };

        let mut handles = Vec::with_capacity(frame.fds().len());
        for fd in frame.fds() {
            handles.push(DmaBufHandle::from(dup_fd(fd.as_fd())?));
        }

        let buffer = queue
            .try_get_buffer(slot)
            .map_err(|_| DeviceError::NoBufferAvailable)?;
        buffer
            .queue_with_handles(handles)
            .map_err(|_| DeviceError::Ioctl("QBUF"))
    }

    fn try_dequeue(&mut self) -> DeviceResult<Option<DequeuedOutputBuffer>> {
        let queue = match &self.state {
            OutputQueueState::Allocated(queue) => queue,
            _ => return Ok(None),
        };

        match queue.try_dequeue() {
            Ok(buffer) => Ok(Some(DequeuedOutputBuffer {
                slot: buffer.data.index() as usize,
                bitstream_id: buffer.data.timestamp().tv_sec as i32,
                bytes_used: *buffer.data.get_first_plane().bytesused as usize,
                is_last: buffer.data.is_last(),
            })),
            Err(ioctl::DqBufError::IoctlError(ioctl::DqBufIoctlError::NotReady)) => Ok(None),
            Err(_) => Err(DeviceError::Ioctl("DQBUF")),
        }
    }
}
