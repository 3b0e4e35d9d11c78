// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A scripted in-memory device honoring the decoder-device contract, so the
//! decoder and component can be exercised without hardware. Tests hold a
//! [`DummyDeviceHandle`] and play the driver: completing input buffers,
//! producing output buffers, and raising source-change events.

use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard};

use nix::poll::PollFlags;
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::device::{
    DecoderDevice, DequeuedOutputBuffer, DeviceError, DeviceResult, InputQueue, OutputQueue,
    WaitTarget,
};
use crate::video_frame::{VideoFrame, VideoFramePool};
use crate::{Fourcc, Rect, Resolution, VideoCodec};

struct State {
    commands: Vec<&'static str>,
    stop_with_queued_inputs: bool,
    pending_source_change: bool,

    input_plane_size: usize,
    input_allocated: usize,
    input_streaming: bool,
    input_queued: VecDeque<i32>,
    input_done: VecDeque<i32>,

    min_output_buffers: usize,
    capture_formats: Vec<Fourcc>,
    capture_format: (Fourcc, Resolution),
    compose_rect: Option<Rect>,
    crop_rect: Option<Rect>,
    output_allocated: usize,
    output_streaming: bool,
    output_queued: VecDeque<usize>,
    output_done: VecDeque<DequeuedOutputBuffer>,
}

impl Default for State {
    fn default() -> Self {
        State {
            commands: Vec::new(),
            stop_with_queued_inputs: false,
            pending_source_change: false,
            input_plane_size: 0,
            input_allocated: 0,
            input_streaming: false,
            input_queued: VecDeque::new(),
            input_done: VecDeque::new(),
            min_output_buffers: 4,
            capture_formats: vec![Fourcc::from_bytes(b"NV12")],
            capture_format: (Fourcc::from_bytes(b"NV12"), Resolution::default()),
            compose_rect: None,
            crop_rect: None,
            output_allocated: 0,
            output_streaming: false,
            output_queued: VecDeque::new(),
            output_done: VecDeque::new(),
        }
    }
}

struct Shared {
    state: Mutex<State>,
    event: EventFd,
}

impl Shared {
    fn state(&self) -> MutexGuard<State> {
        self.state.lock().unwrap()
    }

    fn signal(&self) {
        self.event.write(1).unwrap();
    }

    fn drain_event(&self) {
        let mut buf = [0u8; 8];
        let _ = nix::unistd::read(self.event.as_fd().as_raw_fd(), &mut buf);
    }
}

pub(crate) struct DummyDevice {
    shared: Arc<Shared>,
    queues_taken: bool,
}

impl DummyDevice {
    pub(crate) fn new() -> (DummyDevice, DummyDeviceHandle) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            event: EventFd::from_flags(EfdFlags::EFD_NONBLOCK).unwrap(),
        });
        (
            DummyDevice { shared: Arc::clone(&shared), queues_taken: false },
            DummyDeviceHandle { shared },
        )
    }
}

/// Test-side view of the device: plays the role of the driver.
#[derive(Clone)]
pub(crate) struct DummyDeviceHandle {
    shared: Arc<Shared>,
}

impl DummyDeviceHandle {
    /// Builds another device backed by the same state, for components that
    /// are restarted.
    pub(crate) fn new_device(&self) -> DummyDevice {
        DummyDevice { shared: Arc::clone(&self.shared), queues_taken: false }
    }

    /// The driver finished consuming the input buffer carrying `id`.
    pub(crate) fn complete_input(&self, id: i32) {
        let mut state = self.shared.state();
        let pos = state
            .input_queued
            .iter()
            .position(|&queued| queued == id)
            .expect("completing an input that is not queued");
        state.input_queued.remove(pos);
        state.input_done.push_back(id);
        drop(state);
        self.shared.signal();
    }

    /// The driver decoded into the oldest queued output slot.
    pub(crate) fn produce_output(&self, bitstream_id: i32, bytes_used: usize, is_last: bool) {
        let mut state = self.shared.state();
        let slot = state.output_queued.pop_front().expect("no queued output slot");
        state
            .output_done
            .push_back(DequeuedOutputBuffer { slot, bitstream_id, bytes_used, is_last });
        drop(state);
        self.shared.signal();
    }

    /// Raises a source-change event for a stream of the given coded size.
    pub(crate) fn push_source_change(&self, coded_size: Resolution, min_buffers: usize) {
        let mut state = self.shared.state();
        state.capture_format.1 = coded_size;
        state.min_output_buffers = min_buffers;
        state.pending_source_change = true;
        drop(state);
        self.shared.signal();
    }

    pub(crate) fn set_compose_rect(&self, rect: Option<Rect>) {
        self.shared.state().compose_rect = rect;
    }

    pub(crate) fn set_crop_rect(&self, rect: Option<Rect>) {
        self.shared.state().crop_rect = rect;
    }

    pub(crate) fn set_capture_formats(&self, formats: Vec<Fourcc>) {
        self.shared.state().capture_formats = formats;
    }

    pub(crate) fn commands(&self) -> Vec<&'static str> {
        self.shared.state().commands.clone()
    }

    pub(crate) fn queued_input_ids(&self) -> Vec<i32> {
        self.shared.state().input_queued.iter().copied().collect()
    }

    pub(crate) fn num_output_queued(&self) -> usize {
        self.shared.state().output_queued.len()
    }

    pub(crate) fn output_allocated(&self) -> usize {
        self.shared.state().output_allocated
    }

    pub(crate) fn stop_with_queued_inputs(&self) -> bool {
        self.shared.state().stop_with_queued_inputs
    }
}

impl DecoderDevice for DummyDevice {
    type Input = DummyInputQueue;
    type Output = DummyOutputQueue;

    fn open(_codec: VideoCodec) -> DeviceResult<Self> {
        Ok(DummyDevice::new().0)
    }

    fn try_stop_command(&mut self) -> DeviceResult<()> {
        self.shared.state().commands.push("TRY_STOP");
        Ok(())
    }

    fn subscribe_source_change(&mut self) -> DeviceResult<()> {
        self.shared.state().commands.push("SUBSCRIBE");
        Ok(())
    }

    fn dequeue_source_change(&mut self) -> DeviceResult<bool> {
        self.shared.drain_event();
        let mut state = self.shared.state();
        Ok(std::mem::take(&mut state.pending_source_change))
    }

    fn send_stop_command(&mut self) -> DeviceResult<()> {
        let mut state = self.shared.state();
        state.commands.push("STOP");
        if !state.input_queued.is_empty() {
            state.stop_with_queued_inputs = true;
        }
        Ok(())
    }

    fn send_start_command(&mut self) -> DeviceResult<()> {
        self.shared.state().commands.push("START");
        Ok(())
    }

    fn min_output_buffers(&mut self) -> DeviceResult<usize> {
        Ok(self.shared.state().min_output_buffers)
    }

    fn take_queues(&mut self) -> DeviceResult<(Self::Input, Self::Output)> {
        if self.queues_taken {
            return Err(DeviceError::Ioctl("take_queues"));
        }
        self.queues_taken = true;
        Ok((
            DummyInputQueue { shared: Arc::clone(&self.shared) },
            DummyOutputQueue { shared: Arc::clone(&self.shared) },
        ))
    }

    fn wait_target(&self, _input_queued: bool, _output_queued: bool) -> Option<WaitTarget<'_>> {
        Some(WaitTarget { fd: self.shared.event.as_fd(), events: PollFlags::POLLIN })
    }
}

pub(crate) struct DummyInputQueue {
    shared: Arc<Shared>,
}

impl InputQueue for DummyInputQueue {
    fn set_format(&mut self, _format: Fourcc, buffer_size: usize) -> DeviceResult<()> {
        self.shared.state().input_plane_size = buffer_size;
        Ok(())
    }

    fn allocate_buffers(&mut self, count: usize) -> DeviceResult<usize> {
        let mut state = self.shared.state();
        state.input_allocated = count;
        state.input_queued.clear();
        state.input_done.clear();
        Ok(count)
    }

    fn stream_on(&mut self) -> DeviceResult<()> {
        self.shared.state().input_streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> DeviceResult<()> {
        let mut state = self.shared.state();
        state.input_streaming = false;
        state.input_queued.clear();
        state.input_done.clear();
        Ok(())
    }

    fn num_free(&self) -> usize {
        let state = self.shared.state();
        state.input_allocated - state.input_queued.len() - state.input_done.len()
    }

    fn num_queued(&self) -> usize {
        let state = self.shared.state();
        state.input_queued.len() + state.input_done.len()
    }

    fn plane_size(&self) -> usize {
        self.shared.state().input_plane_size
    }

    fn queue(
        &mut self,
        bitstream_id: i32,
        _dmabuf: BorrowedFd,
        _offset: usize,
        _size: usize,
    ) -> DeviceResult<()> {
        let mut state = self.shared.state();
        if state.input_queued.len() + state.input_done.len() >= state.input_allocated {
            return Err(DeviceError::NoBufferAvailable);
        }
        state.input_queued.push_back(bitstream_id);
        Ok(())
    }

    fn try_dequeue(&mut self) -> DeviceResult<Option<i32>> {
        Ok(self.shared.state().input_done.pop_front())
    }
}

pub(crate) struct DummyOutputQueue {
    shared: Arc<Shared>,
}

impl OutputQueue for DummyOutputQueue {
    fn supported_formats(&self) -> DeviceResult<Vec<Fourcc>> {
        Ok(self.shared.state().capture_formats.clone())
    }

    fn try_set_format(&mut self, format: Fourcc, coded_size: Resolution) -> DeviceResult<()> {
        let mut state = self.shared.state();
        if !state.capture_formats.contains(&format) {
            return Err(DeviceError::UnsupportedFormat(format));
        }
        state.capture_format = (format, coded_size);
        Ok(())
    }

    fn format(&self) -> DeviceResult<(Fourcc, Resolution)> {
        Ok(self.shared.state().capture_format)
    }

    fn compose_rect(&self) -> Option<Rect> {
        self.shared.state().compose_rect
    }

    fn crop_rect(&self) -> Option<Rect> {
        self.shared.state().crop_rect
    }

    fn allocate_buffers(&mut self, count: usize) -> DeviceResult<usize> {
        let mut state = self.shared.state();
        state.output_allocated = count;
        state.output_queued.clear();
        state.output_done.clear();
        Ok(count)
    }

    fn deallocate_buffers(&mut self) -> DeviceResult<()> {
        let mut state = self.shared.state();
        state.output_allocated = 0;
        state.output_queued.clear();
        state.output_done.clear();
        Ok(())
    }

    fn stream_on(&mut self) -> DeviceResult<()> {
        self.shared.state().output_streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> DeviceResult<()> {
        let mut state = self.shared.state();
        state.output_streaming = false;
        state.output_queued.clear();
        state.output_done.clear();
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.shared.state().output_streaming
    }

    fn num_allocated(&self) -> usize {
        self.shared.state().output_allocated
    }

    fn num_free(&self) -> usize {
        let state = self.shared.state();
        state.output_allocated - state.output_queued.len() - state.output_done.len()
    }

    fn num_queued(&self) -> usize {
        let state = self.shared.state();
        state.output_queued.len() + state.output_done.len()
    }

    fn queue_frame(&mut self, slot: usize, _frame: &VideoFrame) -> DeviceResult<()> {
        let mut state = self.shared.state();
        if slot >= state.output_allocated {
            return Err(DeviceError::Ioctl("QBUF"));
        }
        if state.output_queued.contains(&slot)
            || state.output_done.iter().any(|d| d.slot == slot)
        {
            return Err(DeviceError::Ioctl("QBUF"));
        }
        state.output_queued.push_back(slot);
        Ok(())
    }

    fn try_dequeue(&mut self) -> DeviceResult<Option<DequeuedOutputBuffer>> {
        Ok(self.shared.state().output_done.pop_front())
    }
}

#[derive(Default)]
struct PoolState {
    supply: VecDeque<VideoFrame>,
    ready: VecDeque<VideoFrame>,
    request_pending: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    event: EventFd,
}

/// A frame pool whose supply is fed by the test.
pub(crate) struct DummyFramePool {
    shared: Arc<PoolShared>,
}

#[derive(Clone)]
pub(crate) struct DummyPoolHandle {
    shared: Arc<PoolShared>,
}

impl DummyFramePool {
    pub(crate) fn new() -> (DummyFramePool, DummyPoolHandle) {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            event: EventFd::from_flags(EfdFlags::EFD_NONBLOCK).unwrap(),
        });
        (DummyFramePool { shared: Arc::clone(&shared) }, DummyPoolHandle { shared })
    }
}

impl DummyPoolHandle {
    pub(crate) fn add_frame(&self, frame: VideoFrame) {
        let mut state = self.shared.state.lock().unwrap();
        state.supply.push_back(frame);
        if state.request_pending {
            state.request_pending = false;
            let frame = state.supply.pop_front().unwrap();
            state.ready.push_back(frame);
            self.shared.event.write(1).unwrap();
        }
    }
}

impl VideoFramePool for DummyFramePool {
    fn request_frame(&mut self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.request_pending || !state.ready.is_empty() {
            return false;
        }
        if let Some(frame) = state.supply.pop_front() {
            state.ready.push_back(frame);
            self.shared.event.write(1).unwrap();
        } else {
            state.request_pending = true;
        }
        true
    }

    fn take_frame(&mut self) -> Option<VideoFrame> {
        let mut buf = [0u8; 8];
        let _ = nix::unistd::read(self.shared.event.as_fd().as_raw_fd(), &mut buf);
        self.shared.state.lock().unwrap().ready.pop_front()
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.shared.event.as_fd()
    }
}

/// A frame whose planes point at a placeholder fd; good enough for a device
/// that never maps them.
pub(crate) fn make_frame(block_id: u32, coded_size: Resolution) -> VideoFrame {
    let fd = OwnedFd::from(File::open("/dev/null").unwrap());
    VideoFrame::new(block_id, vec![Arc::new(fd)], coded_size)
}
