// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The work-item coordinator bridging the client framework to the decoder.
//!
//! [`DecodeComponent`] accepts works from arbitrary client threads and runs
//! everything else on a single worker thread, the decoder sequence.
//! Submission follows client queue order; completed works are reported in
//! the order their outputs arrive, which is display order for the
//! supported codecs, with the no-show-frame detector injecting drops for
//! VP8/VP9 frames that decode but never display. The EOS work always
//! terminates its drain cycle.

use std::collections::{BTreeMap, VecDeque};
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::c2::{
    C2Status, ColorAspects, ComponentState, DrainMode, FlushMode, FrameFlags, GraphicBuffer,
    Listener, Work, WorkOrdinal,
};
use crate::decoder::{BitstreamBuffer, DecodeStatus, DecoderEvent, VideoDecoder};
use crate::interface::DecodeInterface;
use crate::nalu;
use crate::video_frame::{GetVideoFramePoolFn, VideoFrame, VideoFramePool};
use crate::{HalPixelFormat, Resolution, VideoCodec};

// CCodec pauses submitting input once every output slot is filled by a
// pending decoded buffer. The pipeline must own enough output buffers that
// they are not exhausted before that pause, or the framework times out
// waiting for one.
const SMOOTHNESS_FACTOR: usize = 4;
const RENDERING_DEPTH: usize = 3;
const EXTRA_OUTPUT_BUFFERS_FOR_DECODER: usize = 2;

// Bounds frame-pool requests so a malicious mid-stream resolution change
// cannot exhaust system memory.
const MAX_SUPPORTED_AREA: u64 = 4096 * 4096;

static CONCURRENT_INSTANCES: AtomicI32 = AtomicI32::new(0);

/// Builds the decoder the worker drives: codec, input buffer size, minimum
/// output buffer count, frame-pool hook. Invoked on the decoder sequence at
/// every start.
pub type DecoderFactoryFn = Box<
    dyn FnMut(
            VideoCodec,
            usize,
            usize,
            GetVideoFramePoolFn,
        ) -> Result<Box<dyn VideoDecoder>, String>
        + Send,
>;

/// Produces output frame pools out of the client's block pool: block pool
/// id, coded size, pixel format, buffer count.
pub type FramePoolSourceFn = Box<
    dyn FnMut(u64, Resolution, HalPixelFormat, usize) -> Option<Box<dyn VideoFramePool>> + Send,
>;

#[derive(Debug, Clone)]
pub struct ComponentOptions {
    pub block_pool_id: u64,
    /// Cap on concurrent component instances in this process; -1 means
    /// unlimited.
    pub max_concurrent_instances: i32,
}

impl Default for ComponentOptions {
    fn default() -> Self {
        ComponentOptions { block_pool_id: 0, max_concurrent_instances: -1 }
    }
}

fn min_num_output_buffers(interface: &DecodeInterface) -> usize {
    interface.output_delay() + SMOOTHNESS_FACTOR + RENDERING_DEPTH + EXTRA_OUTPUT_BUFFERS_FOR_DECODER
}

// The EOS work is reported by report_eos_work, never here.
fn is_work_done(work: &Work) -> bool {
    if work.is_eos() {
        return false;
    }

    // A work is done once the decoder released its input buffer and either
    // returned its output buffer, or no output is expected (CSD, dropped
    // frame).
    let input_released = work.input_released();
    let output_returned = !work.worklets[0].output.buffers.is_empty();
    let ignore_output =
        work.is_csd() || work.worklets[0].output.flags.contains(FrameFlags::DROP_FRAME);
    input_released && (output_returned || ignore_output)
}

// A work holds a no-show frame when its ordinal precedes the current one,
// no output was returned, and it is not EOS, CSD or already dropped.
fn is_no_show_frame_work(work: &Work, curr_ordinal: &WorkOrdinal) -> bool {
    let small_ordinal = work.input.ordinal.timestamp < curr_ordinal.timestamp
        && work.input.ordinal.frame_index < curr_ordinal.frame_index;
    let output_returned = !work.worklets[0].output.buffers.is_empty();
    let special_work = work.is_eos()
        || work.is_csd()
        || work.worklets[0].output.flags.contains(FrameFlags::DROP_FRAME);
    small_ordinal && !output_returned && !special_work
}

enum Command {
    Queue(Vec<Work>),
    Drain,
    Flush,
    Stop,
}

struct Shared {
    state: Mutex<ComponentState>,
    listener: Mutex<Option<Arc<dyn Listener>>>,
}

impl Shared {
    fn state(&self) -> ComponentState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ComponentState) {
        *self.state.lock().unwrap() = state;
    }

    /// Latches the error state and tells the listener, once.
    fn report_error(&self, status: C2Status) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ComponentState::Error || *state == ComponentState::Released {
                return;
            }
            *state = ComponentState::Error;
        }
        log::error!("Reporting error: {:?}", status);
        match self.listener.lock().unwrap().as_ref() {
            Some(listener) => listener.on_error(status),
            None => log::error!("No listener, set_listener() not called?"),
        }
    }

    fn report_works(&self, works: Vec<Work>) -> bool {
        match self.listener.lock().unwrap().as_ref() {
            Some(listener) => {
                listener.on_work_done(works);
                true
            }
            None => {
                log::error!("No listener, set_listener() not called?");
                false
            }
        }
    }
}

struct Factories {
    decoder: DecoderFactoryFn,
    pool_source: FramePoolSourceFn,
}

/// A Codec2-style video decode component.
pub struct DecodeComponent {
    interface: Arc<DecodeInterface>,
    shared: Arc<Shared>,
    commands: Arc<Mutex<VecDeque<Command>>>,
    job_event: Arc<EventFd>,
    factories: Arc<Mutex<Factories>>,
    /// The worker handle doubles as the start/stop/release gate.
    worker_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DecodeComponent {
    /// Creates a component for `name`, honoring the per-process instance
    /// cap. The component owns no device until `start`.
    pub fn create(
        name: &str,
        options: ComponentOptions,
        pool_source: FramePoolSourceFn,
        decoder_factory: DecoderFactoryFn,
    ) -> Result<DecodeComponent, C2Status> {
        static CREATE_LOCK: Mutex<()> = Mutex::new(());
        let _lock = CREATE_LOCK.lock().unwrap();

        if options.max_concurrent_instances >= 0
            && CONCURRENT_INSTANCES.load(Ordering::Relaxed) >= options.max_concurrent_instances
        {
            log::warn!(
                "Reject to create due to too many instances: {}",
                CONCURRENT_INSTANCES.load(Ordering::Relaxed)
            );
            return Err(C2Status::C2NoMemory);
        }

        let interface = Arc::new(DecodeInterface::new(name, options.block_pool_id)?);
        let job_event = EventFd::from_flags(EfdFlags::EFD_NONBLOCK).map_err(|e| {
            log::error!("Failed to create job eventfd: {}", e);
            C2Status::C2Corrupted
        })?;

        CONCURRENT_INSTANCES.fetch_add(1, Ordering::Relaxed);
        Ok(DecodeComponent {
            interface,
            shared: Arc::new(Shared {
                state: Mutex::new(ComponentState::Stopped),
                listener: Mutex::new(None),
            }),
            commands: Arc::new(Mutex::new(VecDeque::new())),
            job_event: Arc::new(job_event),
            factories: Arc::new(Mutex::new(Factories {
                decoder: decoder_factory,
                pool_source,
            })),
            worker_thread: Mutex::new(None),
        })
    }

    /// Starts the decoder sequence. Synchronous: returns once the decoder
    /// is running or failed to come up.
    pub fn start(&self) -> C2Status {
        let mut worker_guard = self.worker_thread.lock().unwrap();

        let state = self.shared.state();
        if state != ComponentState::Stopped {
            log::error!("Could not start at {:?} state", state);
            return C2Status::C2BadState;
        }

        let (started_tx, started_rx) = mpsc::channel();
        let interface = Arc::clone(&self.interface);
        let shared = Arc::clone(&self.shared);
        let commands = Arc::clone(&self.commands);
        let job_event = Arc::clone(&self.job_event);
        let factories = Arc::clone(&self.factories);

        let spawned = std::thread::Builder::new().name("c2-decoder".into()).spawn(move || {
            let decoder = match start_task(&interface, &shared, &factories) {
                Ok(decoder) => decoder,
                Err(status) => {
                    let _ = started_tx.send(Err(status));
                    return;
                }
            };
            let _ = started_tx.send(Ok(()));

            // Default colour aspects become available once the interface is
            // queryable; only parseable codecs track them.
            let current_color_aspects =
                if !interface.is_secure() && interface.video_codec() == VideoCodec::H264 {
                    Some(interface.query_color_aspects())
                } else {
                    None
                };

            Worker {
                interface,
                shared,
                commands,
                job_event,
                decoder,
                pending_works: VecDeque::new(),
                works_at_decoder: BTreeMap::new(),
                output_bitstream_ids: VecDeque::new(),
                is_draining: false,
                current_color_aspects,
                pending_color_aspects_change: None,
            }
            .run();
        });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Decoder thread failed to start: {}", e);
                return C2Status::C2Corrupted;
            }
        };

        match started_rx.recv() {
            Ok(Ok(())) => {
                *worker_guard = Some(handle);
                self.shared.set_state(ComponentState::Running);
                C2Status::C2Ok
            }
            Ok(Err(status)) => {
                let _ = handle.join();
                status
            }
            Err(_) => {
                let _ = handle.join();
                C2Status::C2Corrupted
            }
        }
    }

    /// Stops the decoder sequence and abandons in-flight works. Legal from
    /// both Running and Error; clears the error state.
    pub fn stop(&self) -> C2Status {
        let mut worker_guard = self.worker_thread.lock().unwrap();

        let state = self.shared.state();
        if state != ComponentState::Running && state != ComponentState::Error {
            log::error!("Could not stop at {:?} state", state);
            return C2Status::C2BadState;
        }

        if let Some(handle) = worker_guard.take() {
            self.commands.lock().unwrap().push_back(Command::Stop);
            let _ = self.job_event.write(1);
            let _ = handle.join();
        }
        self.commands.lock().unwrap().clear();

        self.shared.set_state(ComponentState::Stopped);
        C2Status::C2Ok
    }

    /// Equivalent to `stop` for this component.
    pub fn reset(&self) -> C2Status {
        self.stop()
    }

    /// Tears the component down for good.
    pub fn release(&self) -> C2Status {
        let mut worker_guard = self.worker_thread.lock().unwrap();

        if let Some(handle) = worker_guard.take() {
            self.commands.lock().unwrap().push_back(Command::Stop);
            let _ = self.job_event.write(1);
            let _ = handle.join();
        }
        self.commands.lock().unwrap().clear();

        self.shared.set_state(ComponentState::Released);
        C2Status::C2Ok
    }

    pub fn set_listener(
        &self,
        listener: Option<Arc<dyn Listener>>,
        may_block: bool,
    ) -> C2Status {
        let state = self.shared.state();
        if state == ComponentState::Released
            || (state == ComponentState::Running && listener.is_some())
        {
            log::error!("Could not set listener at {:?} state", state);
            return C2Status::C2BadState;
        }
        if state == ComponentState::Running && !may_block {
            log::error!("Could not set listener at {:?} state non-blocking", state);
            return C2Status::C2Blocking;
        }

        *self.shared.listener.lock().unwrap() = listener;
        C2Status::C2Ok
    }

    /// Queues works for decode. Asynchronous.
    pub fn queue(&self, works: Vec<Work>) -> C2Status {
        let state = self.shared.state();
        if state != ComponentState::Running {
            log::error!("Could not queue at state: {:?}", state);
            return C2Status::C2BadState;
        }

        self.commands.lock().unwrap().push_back(Command::Queue(works));
        let _ = self.job_event.write(1);
        C2Status::C2Ok
    }

    /// Requests a drain. Asynchronous; completion surfaces as the EOS work
    /// report.
    pub fn drain(&self, mode: DrainMode) -> C2Status {
        let state = self.shared.state();
        if state != ComponentState::Running {
            log::error!("Could not drain at state: {:?}", state);
            return C2Status::C2BadState;
        }

        match mode {
            // Tunneling is not supported.
            DrainMode::Chain => C2Status::C2Omitted,
            DrainMode::ComponentNoEos => C2Status::C2Ok,
            DrainMode::ComponentWithEos => {
                self.commands.lock().unwrap().push_back(Command::Drain);
                let _ = self.job_event.write(1);
                C2Status::C2Ok
            }
        }
    }

    /// Flushes all in-flight works. Abandoned works are reported through
    /// the listener, not returned in `flushed_works`.
    pub fn flush(&self, mode: FlushMode, _flushed_works: &mut Vec<Work>) -> C2Status {
        let state = self.shared.state();
        if state != ComponentState::Running {
            log::error!("Could not flush at state: {:?}", state);
            return C2Status::C2BadState;
        }
        if mode != FlushMode::Component {
            // Tunneling is not supported.
            return C2Status::C2Omitted;
        }

        self.commands.lock().unwrap().push_back(Command::Flush);
        let _ = self.job_event.write(1);
        C2Status::C2Ok
    }

    /// Work announcement belongs to tunneling, which is not supported.
    pub fn announce(&self) -> C2Status {
        C2Status::C2Omitted
    }

    pub fn state(&self) -> ComponentState {
        self.shared.state()
    }

    pub fn intf(&self) -> Arc<DecodeInterface> {
        Arc::clone(&self.interface)
    }
}

impl Drop for DecodeComponent {
    fn drop(&mut self) {
        self.release();
        CONCURRENT_INSTANCES.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Creates the decoder on the worker thread.
fn start_task(
    interface: &Arc<DecodeInterface>,
    shared: &Arc<Shared>,
    factories: &Arc<Mutex<Factories>>,
) -> Result<Box<dyn VideoDecoder>, C2Status> {
    let codec = interface.video_codec();
    let get_pool_cb = make_get_pool_cb(interface, shared, factories);

    let mut factories_guard = factories.lock().unwrap();
    let result = (factories_guard.decoder)(
        codec,
        interface.input_buffer_size(),
        min_num_output_buffers(interface),
        get_pool_cb,
    );
    drop(factories_guard);
    match result {
        Ok(decoder) => Ok(decoder),
        Err(msg) => {
            log::error!("Failed to create decoder for {}: {}", codec, msg);
            Err(C2Status::C2Corrupted)
        }
    }
}

fn make_get_pool_cb(
    interface: &Arc<DecodeInterface>,
    shared: &Arc<Shared>,
    factories: &Arc<Mutex<Factories>>,
) -> GetVideoFramePoolFn {
    let interface = Arc::clone(interface);
    let shared = Arc::clone(shared);
    let factories = Arc::clone(factories);

    Box::new(move |size, pixel_format, num_buffers| {
        if size.area() > MAX_SUPPORTED_AREA {
            log::error!(
                "The output size ({}) is larger than the supported size (4096x4096)",
                size
            );
            shared.report_error(C2Status::C2BadValue);
            return None;
        }

        let pool_id = interface.block_pool_id();
        log::info!("Using block pool id={} for allocating output buffers", pool_id);
        let mut factories_guard = factories.lock().unwrap();
        (factories_guard.pool_source)(pool_id, size, pixel_format, num_buffers)
    })
}

/// All decode-side state, owned by the worker thread.
struct Worker {
    interface: Arc<DecodeInterface>,
    shared: Arc<Shared>,
    commands: Arc<Mutex<VecDeque<Command>>>,
    job_event: Arc<EventFd>,
    decoder: Box<dyn VideoDecoder>,

    /// Works not yet submitted, e.g. held back while draining.
    pending_works: VecDeque<Work>,
    /// Works handed to the decoder, by bitstream id.
    works_at_decoder: BTreeMap<i32, Work>,
    /// Ids whose output arrived (or was dropped/CSD), in arrival order.
    /// Works are reported strictly in this order.
    output_bitstream_ids: VecDeque<i32>,
    is_draining: bool,

    current_color_aspects: Option<ColorAspects>,
    /// Frame index from which re-queried colour aspects apply.
    pending_color_aspects_change: Option<u64>,
}

impl Worker {
    fn run(mut self) {
        loop {
            self.drain_job_event();

            loop {
                let command = self.commands.lock().unwrap().pop_front();
                match command {
                    Some(Command::Queue(works)) => {
                        for work in works {
                            self.queue_task(work);
                        }
                    }
                    Some(Command::Drain) => self.drain_task(),
                    Some(Command::Flush) => self.flush_task(),
                    Some(Command::Stop) => {
                        self.stop_task();
                        return;
                    }
                    None => break,
                }
                self.process_decoder_events();
            }

            self.decoder.service();
            self.process_decoder_events();

            self.wait_for_work();
        }
    }

    fn drain_job_event(&self) {
        let mut buf = [0u8; 8];
        let _ = nix::unistd::read(self.job_event.as_fd().as_raw_fd(), &mut buf);
    }

    fn wait_for_work(&self) {
        let targets = self.decoder.wait_targets();
        let mut poll_fds = Vec::with_capacity(targets.len() + 1);
        poll_fds.push(PollFd::new(self.job_event.as_fd(), PollFlags::POLLIN));
        for target in &targets {
            poll_fds.push(PollFd::new(target.fd, target.events));
        }

        if let Err(e) = poll(&mut poll_fds, PollTimeout::NONE) {
            log::error!("Failed to poll for work: {}", e);
        }
    }

    fn process_decoder_events(&mut self) {
        while let Some(event) = self.decoder.next_event() {
            match event {
                DecoderEvent::DecodeDone { bitstream_id, status } => {
                    self.on_decode_done(bitstream_id, status)
                }
                DecoderEvent::DrainDone(status) => self.on_drain_done(status),
                DecoderEvent::FrameReady(frame) => self.on_output_frame_ready(frame),
                DecoderEvent::Error => self.report_error(C2Status::C2Corrupted),
            }
        }
    }

    fn queue_task(&mut self, mut work: Work) {
        log::debug!(
            "queue_task(): flags={:#x}, index={}, timestamp={}",
            work.input.flags.bits(),
            work.input.ordinal.frame_index,
            work.input.ordinal.timestamp
        );

        if work.worklets.len() != 1 || work.input.buffers.len() > 1 {
            log::error!(
                "Invalid work: worklets={}, input buffers={}",
                work.worklets.len(),
                work.input.buffers.len()
            );
            work.result = C2Status::C2Corrupted;
            self.report_work(work);
            return;
        }

        let worklet = &mut work.worklets[0];
        worklet.output.flags = FrameFlags::empty();
        worklet.output.buffers.clear();
        worklet.output.ordinal = work.input.ordinal;

        if work.input.buffers.is_empty() {
            // A work with no input buffer must be EOS or an empty CSD.
            if !work.is_eos() && !work.is_csd() {
                log::error!("Invalid work: work with no input buffer should be EOS or CSD");
                self.report_error(C2Status::C2BadValue);
                return;
            }

            // Keep the done-check uniform across all works.
            log::debug!("Got a work with no input buffer, emplace a placeholder inside");
            work.input.buffers.push(None);
        }

        self.pending_works.push_back(work);
        self.pump_pending_works();
    }

    fn pump_pending_works(&mut self) {
        let state = self.shared.state();
        if state != ComponentState::Running {
            log::warn!("Could not pump works at state: {:?}", state);
            return;
        }

        while !self.pending_works.is_empty() && !self.is_draining {
            let work = self.pending_works.pop_front().unwrap();
            let bitstream_id = work.bitstream_id();
            let is_csd_work = work.is_csd();
            let is_eos_work = work.is_eos();
            let is_empty_work = work.input.buffers.first().map_or(true, |b| b.is_none());
            log::debug!(
                "Process work bitstreamId={} isCSDWork={} isEmptyWork={}",
                bitstream_id,
                is_csd_work,
                is_empty_work
            );

            let input_block = if is_empty_work {
                None
            } else {
                work.input.buffers[0].clone()
            };

            if is_csd_work && !is_empty_work {
                // Color aspects live in the SPS of the CSD; only parseable
                // on non-secure H.264 instances.
                if !self.interface.is_secure()
                    && self.interface.video_codec() == VideoCodec::H264
                {
                    let payload = input_block.as_ref().unwrap().payload().to_vec();
                    if let Some(aspects) = nalu::parse_coded_color_aspects(&payload) {
                        self.interface.config_coded_color_aspects(aspects);
                        // Aspects apply to outputs from this frame onward.
                        self.pending_color_aspects_change =
                            Some(work.input.ordinal.frame_index);
                    }
                }
            }

            if self.works_at_decoder.insert(bitstream_id, work).is_some() {
                log::warn!("We already inserted bitstreamId {} to decoder?", bitstream_id);
            }

            if let Some(block) = input_block {
                self.decoder.decode(BitstreamBuffer {
                    bitstream_id,
                    dmabuf: Arc::clone(&block.dmabuf),
                    offset: block.offset,
                    size: block.size,
                });
            }

            if is_eos_work {
                self.decoder.drain();
                self.is_draining = true;
            }

            // An empty CSD work needs no decode and no output; report it
            // right away.
            if is_csd_work && is_empty_work {
                self.report_work_if_finished(bitstream_id);
            }
        }
    }

    fn on_decode_done(&mut self, bitstream_id: i32, status: DecodeStatus) {
        log::debug!("on_decode_done(bitstreamId={}, status={:?})", bitstream_id, status);

        match status {
            DecodeStatus::Aborted => {
                let Some(work) = self.works_at_decoder.get_mut(&bitstream_id) else {
                    log::warn!("Decode completion for unknown work {}", bitstream_id);
                    return;
                };
                work.release_input();
                // Keep at most the drop marker; the work surfaces through
                // the abandon path unless it was already droppable.
                let output = &mut work.worklets[0].output;
                output.flags &= FrameFlags::DROP_FRAME;
                self.output_bitstream_ids.push_back(bitstream_id);
                self.pump_report_works();
            }
            DecodeStatus::Error => self.report_error(C2Status::C2Corrupted),
            DecodeStatus::Ok => {
                let Some(work) = self.works_at_decoder.get_mut(&bitstream_id) else {
                    log::warn!("Decode completion for unknown work {}", bitstream_id);
                    return;
                };
                work.release_input();

                // A CSD work has no output frame, so no output-ready will
                // ever push its id.
                if work.is_csd() {
                    self.output_bitstream_ids.push_back(bitstream_id);
                }
                self.pump_report_works();
            }
        }
    }

    fn on_output_frame_ready(&mut self, frame: VideoFrame) {
        let bitstream_id = frame.bitstream_id();
        log::debug!("on_output_frame_ready(bitstreamId={})", bitstream_id);

        let Some(work) = self.works_at_decoder.get_mut(&bitstream_id) else {
            log::error!("Work with bitstreamId={} not found, already abandoned?", bitstream_id);
            self.report_error(C2Status::C2Corrupted);
            return;
        };

        if let Some(change_from) = self.pending_color_aspects_change {
            if work.input.ordinal.frame_index >= change_from {
                self.current_color_aspects = Some(self.interface.query_color_aspects());
                self.pending_color_aspects_change = None;
            }
        }
        work.worklets[0].output.buffers.push(GraphicBuffer {
            frame,
            color_aspects: self.current_color_aspects,
        });
        let curr_ordinal = work.input.ordinal;

        // Decoded output arrives in display order, so an older work without
        // an output by now holds a no-show frame (e.g. a VP9 alt-ref).
        let codec = self.interface.video_codec();
        if codec == VideoCodec::VP8 || codec == VideoCodec::VP9 {
            self.detect_no_show_frame_works(curr_ordinal);
        }

        self.output_bitstream_ids.push_back(bitstream_id);
        self.pump_report_works();
    }

    fn detect_no_show_frame_works(&mut self, curr_ordinal: WorkOrdinal) {
        let mut no_show_frame_ids = Vec::new();
        for (&bitstream_id, work) in self.works_at_decoder.iter_mut() {
            if is_no_show_frame_work(work, &curr_ordinal) {
                work.worklets[0].output.flags |= FrameFlags::DROP_FRAME;
                no_show_frame_ids.push(bitstream_id);
                log::debug!(
                    "Detected no-show frame work index={} timestamp={}",
                    work.input.ordinal.frame_index,
                    work.input.ordinal.timestamp
                );
            }
        }

        // Report after the scan; reporting erases entries under our feet.
        for bitstream_id in no_show_frame_ids {
            self.report_work_if_finished(bitstream_id);
        }
    }

    fn pump_report_works(&mut self) {
        while let Some(&bitstream_id) = self.output_bitstream_ids.front() {
            if !self.report_work_if_finished(bitstream_id) {
                break;
            }
            self.output_bitstream_ids.pop_front();
        }
    }

    fn report_work_if_finished(&mut self, bitstream_id: i32) -> bool {
        // While draining, the only remaining work is the EOS work, which
        // report_eos_work handles.
        if self.is_draining && self.works_at_decoder.len() == 1 {
            log::debug!("work(bitstreamId={}) is the EOS work", bitstream_id);
            return false;
        }

        let Some(work) = self.works_at_decoder.get(&bitstream_id) else {
            log::info!("work(bitstreamId={}) is dropped, skip", bitstream_id);
            return true;
        };

        if !is_work_done(work) {
            log::debug!("work(bitstreamId={}) is not done yet", bitstream_id);
            return false;
        }

        let mut work = self.works_at_decoder.remove(&bitstream_id).unwrap();
        work.result = C2Status::C2Ok;
        work.worklets_processed = work.worklets.len() as u32;
        // A work with neither flags nor output buffer counts as
        // no-corresponding-output for the framework and returns pipeline
        // capacity immediately, so shed the drop marker before reporting.
        if work.worklets[0].output.flags.contains(FrameFlags::DROP_FRAME) {
            work.worklets[0].output.flags -= FrameFlags::DROP_FRAME;
        }

        self.report_work(work)
    }

    fn report_eos_work(&mut self) -> bool {
        let eos_id = self
            .works_at_decoder
            .iter()
            .find(|(_, work)| work.is_eos())
            .map(|(&id, _)| id);
        let Some(eos_id) = eos_id else {
            log::error!("Failed to find EOS work");
            return false;
        };
        let mut eos_work = self.works_at_decoder.remove(&eos_id).unwrap();

        eos_work.result = C2Status::C2Ok;
        eos_work.worklets_processed = eos_work.worklets.len() as u32;
        eos_work.worklets[0].output.flags = FrameFlags::END_OF_STREAM;
        eos_work.release_input();

        if !self.works_at_decoder.is_empty() {
            log::warn!("There are remaining works except the EOS work, abandon them");
            self.report_abandoned_works();
        }

        self.report_work(eos_work)
    }

    fn report_work(&mut self, work: Work) -> bool {
        log::debug!("report_work(index={})", work.input.ordinal.frame_index);
        self.shared.report_works(vec![work])
    }

    fn report_abandoned_works(&mut self) {
        let mut abandoned_works: Vec<Work> = self.pending_works.drain(..).collect();
        abandoned_works.extend(std::mem::take(&mut self.works_at_decoder).into_values());

        for work in &mut abandoned_works {
            work.result = C2Status::C2NotFound;
            // The component drops the input buffer of an abandoned work.
            work.release_input();
        }

        if !abandoned_works.is_empty() {
            self.shared.report_works(abandoned_works);
        }
    }

    fn drain_task(&mut self) {
        if !self.pending_works.is_empty() {
            log::debug!("Set EOS flag at the last queued work");
            let last = self.pending_works.back_mut().unwrap();
            last.input.flags |= FrameFlags::END_OF_STREAM;
            return;
        }

        if !self.works_at_decoder.is_empty() {
            log::debug!("Drain the pending works at the decoder");
            self.decoder.drain();
            self.is_draining = true;
        }
    }

    fn on_drain_done(&mut self, status: DecodeStatus) {
        log::debug!("on_drain_done(status={:?})", status);

        match status {
            // The flush that canceled the drain already abandoned the EOS
            // work.
            DecodeStatus::Aborted => (),
            DecodeStatus::Error => self.report_error(C2Status::C2Corrupted),
            DecodeStatus::Ok => {
                self.is_draining = false;
                if !self.report_eos_work() {
                    self.report_error(C2Status::C2Corrupted);
                    return;
                }
                // Works queued during the drain resume decoding now.
                self.pump_pending_works();
            }
        }
    }

    fn flush_task(&mut self) {
        self.decoder.flush();
        // Aborted completions fired during the flush; fold them into the
        // works before abandoning everything outstanding.
        self.process_decoder_events();
        self.report_abandoned_works();

        // A pending EOS work was abandoned with the rest.
        self.is_draining = false;
    }

    fn stop_task(&mut self) {
        self.report_abandoned_works();
        self.is_draining = false;
    }

    fn report_error(&mut self, status: C2Status) {
        self.shared.report_error(status);
    }
}
