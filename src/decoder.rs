// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder state machine driving the device queues.
//!
//! [`StatefulDecoder`] feeds compressed buffers to the device's input
//! queue, keeps the output queue primed with frames from the pool, and
//! handles the drain handshake and mid-stream resolution changes.
//! Completions surface as [`DecoderEvent`]s collected through
//! [`VideoDecoder::next_event`]; exactly one `DecodeDone` fires for every
//! `decode` call, with `Aborted` only ever produced by `flush`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use anyhow::anyhow;
use nix::poll::PollFlags;

use crate::device::{DecoderDevice, DeviceError, InputQueue, OutputQueue, WaitTarget};
use crate::video_frame::{GetVideoFramePoolFn, VideoFrame, VideoFramePool};
use crate::{Fourcc, HalPixelFormat, Rect, Resolution, VideoCodec};

const NUM_INPUT_BUFFERS: usize = 16;
// Extra buffers for transmitting through the whole video pipeline.
const NUM_EXTRA_OUTPUT_BUFFERS: usize = 4;

// The flexible 4:2:0 layouts the frame pool can satisfy: planar and
// semi-planar, single- and multi-buffer variants.
const SUPPORTED_OUTPUT_FOURCCS: [Fourcc; 8] = [
    Fourcc::from_bytes(b"YU12"),
    Fourcc::from_bytes(b"YV12"),
    Fourcc::from_bytes(b"YM12"),
    Fourcc::from_bytes(b"YM21"),
    Fourcc::from_bytes(b"NV12"),
    Fourcc::from_bytes(b"NV21"),
    Fourcc::from_bytes(b"NM12"),
    Fourcc::from_bytes(b"NM21"),
];

/// How a decode or drain request ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecodeStatus {
    Ok,
    /// Canceled by a flush.
    Aborted,
    Error,
}

/// Completions and outputs reported back to the component, in order.
#[derive(Debug)]
pub enum DecoderEvent {
    DecodeDone {
        bitstream_id: i32,
        status: DecodeStatus,
    },
    DrainDone(DecodeStatus),
    FrameReady(VideoFrame),
    /// The decoder entered its terminal error state.
    Error,
}

/// An owned reference to compressed bitstream bytes to decode.
#[derive(Debug)]
pub struct BitstreamBuffer {
    pub bitstream_id: i32,
    pub dmabuf: Arc<OwnedFd>,
    pub offset: usize,
    pub size: usize,
}

/// The decoding service consumed by the component. Implemented by
/// [`StatefulDecoder`]; the indirection keeps the component testable
/// against scripted decoders.
pub trait VideoDecoder {
    fn decode(&mut self, buffer: BitstreamBuffer);
    fn drain(&mut self);
    /// Cancels all in-flight work. Every pending decode and drain
    /// completes with `Aborted` before this returns.
    fn flush(&mut self);
    /// Processes whatever the device has ready. Cheap when idle.
    fn service(&mut self);
    fn next_event(&mut self) -> Option<DecoderEvent>;
    /// What the caller should sleep on until there is more to service.
    fn wait_targets(&self) -> Vec<WaitTarget<'_>>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Decoding,
    Draining,
    Error,
}

/// A queued decode request; `None` is the drain sentinel.
struct DecodeRequest(Option<BitstreamBuffer>);

pub struct StatefulDecoder<D: DecoderDevice> {
    device: D,
    input_queue: D::Input,
    output_queue: D::Output,
    state: State,

    min_num_output_buffers: usize,
    get_pool_cb: GetVideoFramePoolFn,
    video_frame_pool: Option<Box<dyn VideoFramePool>>,

    decode_requests: VecDeque<DecodeRequest>,
    /// Bitstream ids queued on the device and awaiting completion.
    pending_decode_ids: BTreeSet<i32>,
    drain_pending: bool,

    /// Frames currently owned by the device, by output slot.
    frame_at_device: BTreeMap<usize, VideoFrame>,
    /// Sticky association between pool block ids and output slots.
    block_id_to_slot: BTreeMap<u32, usize>,

    coded_size: Resolution,
    visible_rect: Rect,

    pending_events: VecDeque<DecoderEvent>,
}

impl<D: DecoderDevice> StatefulDecoder<D> {
    /// Opens the device for `codec` and brings the input queue up.
    pub fn start(
        codec: VideoCodec,
        input_buffer_size: usize,
        min_num_output_buffers: usize,
        get_pool_cb: GetVideoFramePoolFn,
    ) -> Result<Self, DeviceError> {
        let device = D::open(codec)?;
        Self::start_with_device(
            device,
            codec,
            input_buffer_size,
            min_num_output_buffers,
            get_pool_cb,
        )
    }

    pub(crate) fn start_with_device(
        mut device: D,
        codec: VideoCodec,
        input_buffer_size: usize,
        min_num_output_buffers: usize,
        get_pool_cb: GetVideoFramePoolFn,
    ) -> Result<Self, DeviceError> {
        log::debug!(
            "start(codec={}, inputBufferSize={}, minNumOutputBuffers={})",
            codec,
            input_buffer_size,
            min_num_output_buffers
        );

        // Without the stop command there is no way to flush the device.
        device.try_stop_command()?;
        device.subscribe_source_change()?;

        let (mut input_queue, output_queue) = device.take_queues()?;
        input_queue.set_format(codec.compressed_format(), input_buffer_size)?;
        if input_queue.allocate_buffers(NUM_INPUT_BUFFERS)? == 0 {
            log::error!("Failed to allocate input buffers");
            return Err(DeviceError::NoBufferAvailable);
        }
        input_queue.stream_on()?;

        Ok(StatefulDecoder {
            device,
            input_queue,
            output_queue,
            state: State::Idle,
            min_num_output_buffers,
            get_pool_cb,
            video_frame_pool: None,
            decode_requests: VecDeque::new(),
            pending_decode_ids: BTreeSet::new(),
            drain_pending: false,
            frame_at_device: BTreeMap::new(),
            block_id_to_slot: BTreeMap::new(),
            coded_size: Resolution::default(),
            visible_rect: Rect::default(),
            pending_events: VecDeque::new(),
        })
    }

    fn set_state(&mut self, new_state: State) {
        if self.state == new_state {
            return;
        }
        if self.state == State::Error {
            log::debug!("Already in Error state");
            return;
        }
        let new_state = if new_state == State::Draining && self.state != State::Decoding {
            State::Error
        } else {
            new_state
        };

        log::info!("Set state {:?} => {:?}", self.state, new_state);
        self.state = new_state;
    }

    fn on_error(&mut self) {
        self.set_state(State::Error);
        self.pending_events.push_back(DecoderEvent::Error);
    }

    fn pump_decode_requests(&mut self) {
        if self.state != State::Decoding {
            return;
        }

        while let Some(request) = self.decode_requests.front() {
            if request.0.is_none() {
                // Drain request. Only send the stop command once every
                // input buffer has been dequeued: the driver holds the
                // buffer that triggers a resolution change until new output
                // buffers arrive, and stopping before it is consumed would
                // race the LAST buffer against works that are not decoded
                // yet.
                if self.input_queue.num_queued() > 0 {
                    log::debug!("Wait for all input buffers dequeued");
                    return;
                }

                self.decode_requests.pop_front();
                if let Err(e) = self.device.send_stop_command() {
                    log::error!("Failed to send stop command: {}", e);
                    self.pending_events
                        .push_back(DecoderEvent::DrainDone(DecodeStatus::Error));
                    self.on_error();
                    return;
                }
                self.drain_pending = true;
                self.set_state(State::Draining);
                return;
            }

            // Pause if no free input buffer; decoding resumes once input
            // buffers are dequeued.
            if self.input_queue.num_free() == 0 {
                log::debug!("There is no free input buffer");
                return;
            }

            let buffer = self
                .decode_requests
                .pop_front()
                .and_then(|r| r.0)
                .expect("head request vanished");
            let bitstream_id = buffer.bitstream_id;

            let plane_size = self.input_queue.plane_size();
            if buffer.offset + buffer.size > plane_size {
                log::error!(
                    "The input size ({}) is not enough, we need {}",
                    plane_size,
                    buffer.offset + buffer.size
                );
                self.on_error();
                return;
            }

            log::debug!("QBUF to input queue, bitstreamId={}", bitstream_id);
            if let Err(e) = self.input_queue.queue(
                bitstream_id,
                buffer.dmabuf.as_fd(),
                buffer.offset,
                buffer.size,
            ) {
                log::error!(
                    "Failed to QBUF to input queue, bitstreamId={}: {}",
                    bitstream_id,
                    e
                );
                self.on_error();
                return;
            }

            self.pending_decode_ids.insert(bitstream_id);
        }
    }

    fn service_input_queue(&mut self) -> Result<bool, ()> {
        let mut input_dequeued = false;
        loop {
            match self.input_queue.try_dequeue() {
                Ok(Some(bitstream_id)) => {
                    input_dequeued = true;
                    log::debug!("DQBUF from input queue, bitstreamId={}", bitstream_id);
                    if self.pending_decode_ids.remove(&bitstream_id) {
                        self.pending_events.push_back(DecoderEvent::DecodeDone {
                            bitstream_id,
                            status: DecodeStatus::Ok,
                        });
                    } else {
                        log::warn!("Completion for {} already abandoned", bitstream_id);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to dequeue buffer from input queue: {}", e);
                    self.on_error();
                    return Err(());
                }
            }
        }
        Ok(input_dequeued)
    }

    fn service_output_queue(&mut self) -> Result<bool, ()> {
        let mut output_dequeued = false;
        loop {
            let dequeued = match self.output_queue.try_dequeue() {
                Ok(Some(dequeued)) => dequeued,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to dequeue buffer from output queue: {}", e);
                    self.on_error();
                    return Err(());
                }
            };
            output_dequeued = true;

            log::debug!(
                "DQBUF from output queue, slot={}, bitstreamId={}, bytesused={}, isLast={}",
                dequeued.slot,
                dequeued.bitstream_id,
                dequeued.bytes_used,
                dequeued.is_last
            );

            let mut frame = match self.frame_at_device.remove(&dequeued.slot) {
                Some(frame) => frame,
                None => {
                    log::error!("Slot {} is not found at the device", dequeued.slot);
                    self.on_error();
                    return Err(());
                }
            };

            if dequeued.bytes_used > 0 {
                frame.set_bitstream_id(dequeued.bitstream_id);
                frame.set_visible_rect(self.visible_rect);
                self.pending_events.push_back(DecoderEvent::FrameReady(frame));
            } else {
                // If the buffer is not enqueued before the next drain
                // completes, some drivers fail to signal LAST. Recycle it
                // immediately.
                log::debug!("Recycle empty buffer {} back to the output queue", dequeued.slot);
                if let Err(e) = self.output_queue.queue_frame(dequeued.slot, &frame) {
                    log::error!("Failed to recycle empty buffer to output queue: {}", e);
                    self.on_error();
                    return Err(());
                }
                self.frame_at_device.insert(dequeued.slot, frame);
            }

            if self.drain_pending && dequeued.is_last {
                log::debug!("All buffers are drained");
                if let Err(e) = self.device.send_start_command() {
                    log::error!("Failed to send start command: {}", e);
                }
                self.drain_pending = false;
                self.pending_events
                    .push_back(DecoderEvent::DrainDone(DecodeStatus::Ok));
                self.set_state(State::Idle);
            }
        }
        Ok(output_dequeued)
    }

    fn service_frame_pool(&mut self) {
        loop {
            if self.state == State::Error {
                return;
            }
            let frame = match self.video_frame_pool.as_mut().and_then(|p| p.take_frame()) {
                Some(frame) => frame,
                None => return,
            };
            self.on_video_frame_ready(frame);
        }
    }

    fn change_resolution(&mut self) -> anyhow::Result<()> {
        let num_output_buffers =
            (self.device.min_output_buffers()? + NUM_EXTRA_OUTPUT_BUFFERS)
                .max(self.min_num_output_buffers);

        let (_, coded_size) = self.output_queue.format()?;
        self.setup_output_format(coded_size)?;

        let (_, adjusted_size) = self.output_queue.format()?;
        self.coded_size = adjusted_size;
        self.visible_rect = self.visible_rect_for(adjusted_size);

        log::info!(
            "Need {} output buffers. coded size: {}, visible rect: {}",
            num_output_buffers,
            self.coded_size,
            self.visible_rect
        );
        if self.coded_size.is_empty() {
            return Err(anyhow!("failed to get resolution from the device"));
        }

        self.output_queue.stream_off()?;
        self.output_queue.deallocate_buffers()?;
        self.frame_at_device.clear();
        self.block_id_to_slot.clear();

        let allocated = self.output_queue.allocate_buffers(num_output_buffers)?;
        if allocated == 0 {
            return Err(anyhow!("failed to allocate output buffers"));
        }
        log::debug!("Allocated {} output buffers", allocated);
        self.output_queue.stream_on()?;

        // Release the previous pool before asking for a new one so only a
        // single pool exists at any time.
        self.video_frame_pool = None;
        self.video_frame_pool = (self.get_pool_cb)(
            self.coded_size,
            HalPixelFormat::YCbCr420Flexible,
            allocated,
        );
        if self.video_frame_pool.is_none() {
            return Err(anyhow!("failed to get frame pool of size {}", self.coded_size));
        }

        self.try_fetch_video_frame();
        Ok(())
    }

    fn setup_output_format(&mut self, size: Resolution) -> anyhow::Result<()> {
        let formats = self.output_queue.supported_formats()?;
        for format in formats {
            if !SUPPORTED_OUTPUT_FOURCCS.contains(&format) {
                log::debug!("Pixel format {} is not supported, skipping", format);
                continue;
            }
            if self.output_queue.try_set_format(format, size).is_ok() {
                return Ok(());
            }
        }

        Err(anyhow!("failed to find supported pixel format"))
    }

    fn visible_rect_for(&mut self, coded_size: Resolution) -> Rect {
        let rect = match self.output_queue.compose_rect() {
            Some(rect) => rect,
            None => {
                log::debug!("Fallback to crop");
                match self.output_queue.crop_rect() {
                    Some(rect) => rect,
                    None => {
                        log::warn!("Failed to query visible rect");
                        return Rect::from(coded_size);
                    }
                }
            }
        };

        log::debug!("Visible rectangle is {}", rect);
        if !Rect::from(coded_size).contains(&rect) {
            log::warn!("Visible rectangle {} is not inside coded size {}", rect, coded_size);
            return Rect::from(coded_size);
        }
        if rect.is_empty() {
            log::warn!("Visible size is empty");
            return Rect::from(coded_size);
        }

        rect
    }

    fn try_fetch_video_frame(&mut self) {
        if self.video_frame_pool.is_none() {
            log::error!("Frame pool is gone, failed to refresh it after resolution change?");
            self.on_error();
            return;
        }

        if self.output_queue.num_free() == 0 {
            log::debug!("No free output buffers, ignore");
            return;
        }

        if !self.video_frame_pool.as_mut().unwrap().request_frame() {
            log::debug!("Previous frame request is still running, ignore");
        }
    }

    fn on_video_frame_ready(&mut self, frame: VideoFrame) {
        let block_id = frame.block_id();

        // Find the device slot associated with this block: reuse the slot
        // of a returning block, or hand a first-seen block the next unused
        // one. The pool never yields more distinct blocks than the device
        // has slots.
        let slot = if let Some(&slot) = self.block_id_to_slot.get(&block_id) {
            slot
        } else if self.block_id_to_slot.len() < self.output_queue.num_allocated() {
            let slot = self.block_id_to_slot.len();
            self.block_id_to_slot.insert(block_id, slot);
            slot
        } else {
            log::error!("Got more different blocks than we have device slots for");
            self.on_error();
            return;
        };

        log::debug!("QBUF to output queue, blockId={}, slot={}", block_id, slot);
        if let Err(e) = self.output_queue.queue_frame(slot, &frame) {
            log::error!("Failed to QBUF to output queue, slot={}: {}", slot, e);
            self.on_error();
            return;
        }
        if self.frame_at_device.insert(slot, frame).is_some() {
            log::error!("Output slot {} was already enqueued", slot);
            self.on_error();
            return;
        }

        self.try_fetch_video_frame();
    }
}

impl<D: DecoderDevice> VideoDecoder for StatefulDecoder<D> {
    fn decode(&mut self, buffer: BitstreamBuffer) {
        log::debug!("decode(id={})", buffer.bitstream_id);

        if self.state == State::Error {
            log::error!("Ignore decode due to error state");
            self.pending_events.push_back(DecoderEvent::DecodeDone {
                bitstream_id: buffer.bitstream_id,
                status: DecodeStatus::Error,
            });
            return;
        }

        if self.state == State::Idle {
            self.set_state(State::Decoding);
        }

        self.decode_requests.push_back(DecodeRequest(Some(buffer)));
        self.pump_decode_requests();
    }

    fn drain(&mut self) {
        match self.state {
            State::Idle => {
                log::debug!("Nothing to drain, ignore");
                self.pending_events
                    .push_back(DecoderEvent::DrainDone(DecodeStatus::Ok));
            }
            State::Decoding => {
                self.decode_requests.push_back(DecodeRequest(None));
                self.pump_decode_requests();
            }
            State::Draining | State::Error => {
                log::error!("Ignore drain due to wrong state: {:?}", self.state);
                self.pending_events
                    .push_back(DecoderEvent::DrainDone(DecodeStatus::Error));
            }
        }
    }

    fn flush(&mut self) {
        if self.state == State::Idle {
            log::debug!("Nothing to flush, ignore");
            return;
        }
        if self.state == State::Error {
            log::error!("Ignore flush due to error state");
            return;
        }

        // Every outstanding completion fires with Aborted, including
        // requests that never reached the device.
        for request in self.decode_requests.drain(..) {
            match request.0 {
                Some(buffer) => self.pending_events.push_back(DecoderEvent::DecodeDone {
                    bitstream_id: buffer.bitstream_id,
                    status: DecodeStatus::Aborted,
                }),
                None => self
                    .pending_events
                    .push_back(DecoderEvent::DrainDone(DecodeStatus::Aborted)),
            }
        }
        for bitstream_id in std::mem::take(&mut self.pending_decode_ids) {
            self.pending_events.push_back(DecoderEvent::DecodeDone {
                bitstream_id,
                status: DecodeStatus::Aborted,
            });
        }
        if self.drain_pending {
            self.drain_pending = false;
            self.pending_events
                .push_back(DecoderEvent::DrainDone(DecodeStatus::Aborted));
        }

        // Stream off both queues to drop every in-flight buffer, then
        // restart the input queue (and the output queue if it was live).
        let was_streaming = self.output_queue.is_streaming();
        let restart = |this: &mut Self| -> crate::device::DeviceResult<()> {
            this.output_queue.stream_off()?;
            this.frame_at_device.clear();
            this.input_queue.stream_off()?;
            this.input_queue.stream_on()?;
            if was_streaming {
                this.output_queue.stream_on()?;
            }
            Ok(())
        };
        if let Err(e) = restart(self) {
            log::error!("Failed to restart queues on flush: {}", e);
            self.on_error();
            return;
        }

        // All device-held frames were just dropped, so a previously full
        // output queue will never dequeue again; re-arm the fetch loop.
        if self.video_frame_pool.is_some() {
            self.try_fetch_video_frame();
        }

        self.set_state(State::Idle);
    }

    fn service(&mut self) {
        if self.state == State::Error {
            return;
        }

        let input_dequeued = match self.service_input_queue() {
            Ok(dequeued) => dequeued,
            Err(()) => return,
        };
        let output_dequeued = match self.service_output_queue() {
            Ok(dequeued) => dequeued,
            Err(()) => return,
        };

        match self.device.dequeue_source_change() {
            Ok(true) => {
                if let Err(e) = self.change_resolution() {
                    log::error!("Failed to change resolution: {:#}", e);
                    self.on_error();
                    return;
                }
            }
            Ok(false) => (),
            Err(e) => log::warn!("Failed to dequeue event: {}", e),
        }

        // Freed input buffers let us submit more requests; freed output
        // buffers let us import more frames.
        if input_dequeued {
            self.pump_decode_requests();
        }
        if output_dequeued {
            self.try_fetch_video_frame();
        }

        self.service_frame_pool();
    }

    fn next_event(&mut self) -> Option<DecoderEvent> {
        self.pending_events.pop_front()
    }

    fn wait_targets(&self) -> Vec<WaitTarget<'_>> {
        // Nothing will be serviced once the error state is latched.
        if self.state == State::Error {
            return Vec::new();
        }

        let mut targets = Vec::new();
        if let Some(target) = self
            .device
            .wait_target(self.input_queue.num_queued() > 0, self.output_queue.num_queued() > 0)
        {
            targets.push(target);
        }
        if let Some(pool) = &self.video_frame_pool {
            targets.push(WaitTarget { fd: pool.poll_fd(), events: PollFlags::POLLIN });
        }
        targets
    }
}
