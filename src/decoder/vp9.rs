// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VP9 decoding on the HEVC core.
//!
//! The firmware is fed one frame at a time. For each frame it stops twice: once the header is
//! parsed ([`STATUS_HEADER_DONE`]), so the driver can pick an output frame and program the
//! references, and once the frame is decoded ([`STATUS_FRAME_DECODED`]). When it runs out of
//! input it reports [`STATUS_INPUT_CONSUMED`] and is stopped until the next frame is fed.
//!
//! Sessions can give up the core after a frame was produced or while waiting for input.

mod loop_filter;
mod params;
mod program;

use anyhow::anyhow;
use bytes::Bytes;

use crate::canvas::Nv12Canvases;
use crate::codec::vp9::push_aml_frame;
use crate::codec::vp9::split_superframe;
use crate::codec::vp9::FrameInfo;
use crate::codec::vp9::FrameType;
use crate::codec::vp9::AML_HEADER_SIZE;
use crate::codec::vp9::NUM_REF_FRAMES;
use crate::decoder::DecodeError;
use crate::decoder::DecoderClient;
use crate::decoder::DecoderContext;
use crate::decoder::DecoderStateMachine;
use crate::decoder::Feed;
use crate::decoder::FrameAllocation;
use crate::decoder::FrameRequest;
use crate::decoder::InputItem;
use crate::decoder::InputQueue;
use crate::firmware::FirmwareType;
use crate::frame::DecodedFrame;
use crate::frame::FrameHandle;
use crate::frame::FramePool;
use crate::memory::Buffer;
use crate::mmio::Register;
use crate::registers::hevc::*;
use crate::secure::ProtectedUnit;
use crate::CodecKind;
use crate::Resolution;

pub use loop_filter::LoopFilterTables;
pub use params::HardwareRenderParams;
pub use params::RPM_BUFFER_SIZE;
pub use program::FrameProgram;

/// Firmware status, and command register of the driver.
pub const DEC_STATUS: Register = HEVC_ASSIST_SCRATCH_0;
pub const RPM_BUFFER: Register = HEVC_ASSIST_SCRATCH_0.at(1);
pub const FIRMWARE_SWAP_BUFFER: Register = HEVC_ASSIST_SCRATCH_0.at(3);
pub const PROB_SWAP_BUFFER: Register = HEVC_ASSIST_SCRATCH_0.at(6);
pub const COUNT_SWAP_BUFFER: Register = HEVC_ASSIST_SCRATCH_0.at(7);
pub const SEG_MAP_BUFFER: Register = HEVC_ASSIST_SCRATCH_0.at(8);
pub const LMEM_DUMP_ADDR: Register = HEVC_ASSIST_SCRATCH_0.at(9);
pub const DECODE_MODE: Register = HEVC_ASSIST_SCRATCH_0.at(0xd);

pub const STATUS_INPUT_STARVED: u32 = 0x20;
pub const STATUS_INPUT_CONSUMED: u32 = 0x0e;
pub const STATUS_FRAME_DECODED: u32 = 0x11;
pub const STATUS_HEADER_DONE: u32 = 0xf0;
pub const COMMAND_DECODE_SLICE: u32 = 0x05;
pub const COMMAND_ACTION_DONE: u32 = 0xff;

/// Decode the frames fed one by one, stopping when the input is consumed.
const DECODE_MODE_SINGLE_FRAME: u32 = 0x01;

/// Output frames allocated per session by default.
pub const FRAME_COUNT: usize = 16;
const MV_BUFFER_COUNT: usize = 2;
/// Motion vector storage per 64x64 superblock.
const MV_BYTES_PER_SUPERBLOCK: usize = 0x240;
const LMEM_SIZE: usize = 0x400;
const PROB_SIZE: usize = 0x5000;
const COUNT_SIZE: usize = 0x3000;
const SEG_MAP_SIZE: usize = 0x8000;
const FIRMWARE_SWAP_SIZE: usize = 0x800;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecoderState {
    SwappedOut,
    InitialWaitingForInput,
    Running,
    StoppedWaitingForInput,
    /// A header was parsed but the frame can not be decoded until the client returns a frame or
    /// provides the frame buffers.
    PausedAtHeader,
    FrameJustProduced,
    Failed,
}

pub struct Vp9Frame {
    pub buffer: Buffer,
    pub canvases: Nv12Canvases,
    pub resolution: Resolution,
    pub stride: u32,
}

struct WorkingBuffers {
    rpm: Buffer,
    lmem: Buffer,
    prob: Buffer,
    count: Buffer,
    seg_map: Buffer,
    firmware_swap: Buffer,
}

/// A parsed header waiting for an output frame.
struct PendingFrame {
    params: HardwareRenderParams,
    pts: Option<u64>,
}

/// The frame the hardware is decoding.
struct CurrentFrame {
    index: usize,
    show: bool,
    refresh: u8,
    pts: Option<u64>,
    resolution: Resolution,
}

struct LastFrame {
    resolution: Resolution,
    show: bool,
}

fn with_aml_header(frame: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(frame.len() + AML_HEADER_SIZE);
    push_aml_frame(&mut framed, frame);
    framed
}

pub struct Vp9Decoder {
    frame_count: usize,
    state: DecoderState,
    /// State to go back to when swapped in.
    saved_state: DecoderState,
    working: Option<WorkingBuffers>,
    frames: FramePool<Vp9Frame>,
    /// The request the current frames were allocated for.
    frame_layout: Option<FrameRequest>,
    /// Set while the client is allocating frames for this request.
    waiting_for_frames: Option<FrameRequest>,
    mv_buffers: Vec<Buffer>,
    mv_index: usize,
    /// Frame held by each reference slot.
    slots: [Option<usize>; NUM_REF_FRAMES],
    pending: Option<PendingFrame>,
    current: Option<CurrentFrame>,
    last: Option<LastFrame>,
    /// Input was fed that the firmware has not reported consumed yet.
    unconsumed: bool,
}

impl Default for Vp9Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Vp9Decoder {
    pub fn new() -> Self {
        Self::with_frame_count(FRAME_COUNT)
    }

    /// A decoder allocating `frame_count` output frames per geometry.
    pub fn with_frame_count(frame_count: usize) -> Self {
        Self {
            frame_count,
            state: DecoderState::SwappedOut,
            saved_state: DecoderState::InitialWaitingForInput,
            working: None,
            frames: FramePool::new(),
            frame_layout: None,
            waiting_for_frames: None,
            mv_buffers: Vec::new(),
            mv_index: 0,
            slots: [None; NUM_REF_FRAMES],
            pending: None,
            current: None,
            last: None,
            unconsumed: false,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    fn set_state(&mut self, state: DecoderState) {
        if self.state != state {
            log::debug!("VP9 {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn fail(&mut self, cx: &mut DecoderContext, error: DecodeError) {
        self.set_state(DecoderState::Failed);
        cx.fail(error);
    }

    /// Feeds the next frame if the firmware has nothing left, and starts decoding.
    fn try_start(&mut self, cx: &mut DecoderContext) {
        if !matches!(
            self.state,
            DecoderState::InitialWaitingForInput | DecoderState::StoppedWaitingForInput
        ) || cx.hw.is_none()
        {
            return;
        }

        if !self.unconsumed {
            match cx.feed_next(with_aml_header) {
                Ok(Feed::Fed) => self.unconsumed = true,
                Ok(Feed::EndOfStream) => cx.io.client.on_end_of_stream(),
                Ok(Feed::Empty) | Ok(Feed::Full) => (),
                Err(e) => return self.fail(cx, e),
            }
        }

        if self.unconsumed {
            if let Some(hw) = cx.hw.as_mut() {
                hw.core.start_decoding();
            }
            self.set_state(DecoderState::Running);
        }
    }

    fn read_rpm(&self) -> Result<Vec<u8>, DecodeError> {
        let working = self
            .working
            .as_ref()
            .ok_or_else(|| anyhow!("VP9 working buffers are missing"))?;
        let mut rpm = vec![0u8; RPM_BUFFER_SIZE];
        working.rpm.cache_invalidate(0, RPM_BUFFER_SIZE);
        working.rpm.read(0, &mut rpm)?;
        Ok(rpm)
    }

    fn deliver(&mut self, cx: &mut DecoderContext, index: usize, pts: Option<u64>) {
        let handle = self.frames.deliver(index);
        let frame = self.frames.get(index);
        cx.io.client.on_frame_ready(DecodedFrame {
            handle,
            resolution: frame.resolution,
            stride: frame.stride,
            buffer: frame.buffer.clone(),
            pts,
        });
    }

    fn header_done(&mut self, cx: &mut DecoderContext) {
        let Some(hw) = cx.hw.as_ref() else {
            return;
        };
        let offset = hw.regs.read(HEVC_SHIFT_BYTE_COUNT);
        let params = match self
            .read_rpm()
            .and_then(|rpm| HardwareRenderParams::parse(&rpm).map_err(DecodeError::from))
        {
            Ok(params) => params,
            Err(e) => return self.fail(cx, e),
        };
        let pts = cx.io.pts.lookup_hw(offset);

        if params.show_existing_frame {
            match self.slots[params.frame_to_show as usize] {
                Some(index) => self.deliver(cx, index, pts),
                None => log::warn!("frame to show in empty slot {}", params.frame_to_show),
            }
            if let Some(hw) = cx.hw.as_ref() {
                hw.regs.write(DEC_STATUS, COMMAND_ACTION_DONE);
            }
            return;
        }

        self.pending = Some(PendingFrame { params, pts });
        self.prepare_frame(cx);
    }

    /// Finds an output frame for the pending header and starts decoding it.
    fn prepare_frame(&mut self, cx: &mut DecoderContext) {
        if self.waiting_for_frames.is_some() {
            return;
        }
        let Some(pending) = &self.pending else {
            return;
        };

        let resolution = pending.params.resolution();
        let stride = resolution.width.div_ceil(32) * 32;
        let request = FrameRequest {
            count: self.frame_count,
            resolution,
            stride,
            size: resolution.nv12_size(stride),
            protected: cx.io.stream.is_secure(),
        };
        if self.frame_layout.as_ref() != Some(&request) {
            log::debug!("requesting {} frames of {:?}", self.frame_count, resolution);
            match cx.io.client.initialize_frames(&request) {
                FrameAllocation::Ready(buffers) => {
                    if let Err(e) = self.install_frames(cx, &request, buffers) {
                        return self.fail(cx, e);
                    }
                }
                FrameAllocation::Deferred => {
                    self.waiting_for_frames = Some(request);
                    self.set_state(DecoderState::PausedAtHeader);
                    return;
                }
                FrameAllocation::Failed => return self.fail(cx, DecodeError::FrameAllocation),
            }
        }

        let Some(index) = self.frames.find_free() else {
            log::debug!("no free frame, pausing at header");
            self.set_state(DecoderState::PausedAtHeader);
            return;
        };
        self.program_frame(cx, index);
    }

    fn install_frames(
        &mut self,
        cx: &mut DecoderContext,
        request: &FrameRequest,
        buffers: Vec<Buffer>,
    ) -> Result<(), DecodeError> {
        if buffers.len() < request.count || buffers.iter().any(|b| b.size() < request.size) {
            return Err(DecodeError::BadFrames {
                got: buffers.len(),
                size: buffers.iter().map(|b| b.size()).min().unwrap_or(0),
                count: request.count,
                needed: request.size,
            });
        }

        let mut frames = Vec::with_capacity(request.count);
        for buffer in buffers.into_iter().take(request.count) {
            let canvases = Nv12Canvases::new(
                cx.res.canvas,
                &buffer,
                request.stride,
                request.resolution.height,
            )?;
            frames.push(Vp9Frame {
                buffer,
                canvases,
                resolution: request.resolution,
                stride: request.stride,
            });
        }

        let superblocks = request.resolution.width.div_ceil(64) as usize
            * request.resolution.height.div_ceil(64) as usize;
        let mv_size = superblocks * MV_BYTES_PER_SUPERBLOCK;
        self.mv_buffers = (0..MV_BUFFER_COUNT)
            .map(|_| {
                cx.res
                    .allocate("vp9 motion vectors", mv_size, request.protected, ProtectedUnit::Hevc)
            })
            .collect::<Result<_, _>>()?;
        self.mv_index = 0;
        self.last = None;

        // Handles of the previous frames become stale, and the references are gone with them.
        self.frames.reset(frames);
        self.slots = [None; NUM_REF_FRAMES];
        self.frame_layout = Some(request.clone());
        log::info!(
            "VP9 frames allocated: {} x {:?}, stride {}",
            request.count,
            request.resolution,
            request.stride
        );
        Ok(())
    }

    fn program_frame(&mut self, cx: &mut DecoderContext, index: usize) {
        let Some(hw) = cx.hw.as_mut() else {
            return;
        };
        let Some(pending) = self.pending.take() else {
            return;
        };
        let params = &pending.params;

        // Held as the decode target until the frame is decoded.
        self.frames.add_ref(index);

        let refs = if params.is_intra() {
            [None; 3]
        } else {
            params.ref_frame_idx.map(|slot| {
                let frame = self.slots[slot as usize];
                if frame.is_none() {
                    log::warn!("inter frame references empty slot {}", slot);
                }
                frame.map(|i| self.frames.get(i))
            })
        };
        let resolution = params.resolution();
        let use_previous_mvs = !params.is_intra()
            && !params.error_resilient
            && self
                .last
                .as_ref()
                .is_some_and(|last| last.resolution == resolution && last.show);
        let previous_mvs = use_previous_mvs.then(|| &self.mv_buffers[self.mv_index ^ 1]);
        let tables = LoopFilterTables::new(&params.loop_filter);
        let target = self.frames.get(index);

        let mut program = FrameProgram::new(hw.regs);
        program
            .references(target, &refs)
            .motion_prediction(&self.mv_buffers[self.mv_index], previous_mvs)
            .loop_filter(&tables)
            .output(target);
        program.commit();

        self.current = Some(CurrentFrame {
            index,
            show: params.show_frame,
            refresh: match params.frame_type {
                FrameType::KeyFrame => 0xff,
                FrameType::InterFrame => params.refresh_frame_flags,
            },
            pts: pending.pts,
            resolution,
        });
        self.set_state(DecoderState::Running);
    }

    fn frame_decoded(&mut self, cx: &mut DecoderContext) {
        let Some(current) = self.current.take() else {
            log::warn!("frame decoded without a frame in flight");
            return;
        };

        if current.show {
            self.deliver(cx, current.index, current.pts);
        }
        for slot in 0..NUM_REF_FRAMES {
            if current.refresh & (1 << slot) != 0 {
                if let Some(old) = self.slots[slot].replace(current.index) {
                    self.frames.release(old);
                }
                self.frames.add_ref(current.index);
            }
        }
        self.frames.release(current.index);

        // Frames are fed one at a time, so the FIFO holds nothing more.
        self.unconsumed = false;
        self.mv_index ^= 1;
        self.last = Some(LastFrame {
            resolution: current.resolution,
            show: current.show,
        });
        self.set_state(DecoderState::FrameJustProduced);
    }

    fn input_consumed(&mut self, cx: &mut DecoderContext) {
        if let Some(hw) = cx.hw.as_mut() {
            hw.core.stop_decoding();
        }
        self.unconsumed = false;
        self.set_state(DecoderState::StoppedWaitingForInput);

        if cx.io.input.is_empty() {
            cx.io.client.on_input_needed();
            return;
        }
        match cx.feed_next(with_aml_header) {
            // Decoding restarts once the scheduler has had a chance to switch sessions.
            Ok(Feed::Fed) => self.unconsumed = true,
            Ok(Feed::EndOfStream) => cx.io.client.on_end_of_stream(),
            Ok(Feed::Empty) | Ok(Feed::Full) => (),
            Err(e) => self.fail(cx, e),
        }
    }
}

impl DecoderStateMachine for Vp9Decoder {
    fn codec(&self) -> CodecKind {
        CodecKind::Vp9
    }

    fn initialize(&mut self, cx: &mut DecoderContext) -> Result<(), DecodeError> {
        let secure = cx.io.stream.is_secure();
        let res = &cx.res;
        // The CPU reads the parsed parameters back, so rpm and lmem are never protected.
        self.working = Some(WorkingBuffers {
            rpm: res.allocate("vp9 rpm", RPM_BUFFER_SIZE, false, ProtectedUnit::Hevc)?,
            lmem: res.allocate("vp9 lmem", LMEM_SIZE, false, ProtectedUnit::Hevc)?,
            prob: res.allocate("vp9 probabilities", PROB_SIZE, secure, ProtectedUnit::Hevc)?,
            count: res.allocate("vp9 counts", COUNT_SIZE, secure, ProtectedUnit::Hevc)?,
            seg_map: res.allocate("vp9 segment map", SEG_MAP_SIZE, secure, ProtectedUnit::Hevc)?,
            firmware_swap: res.allocate(
                "vp9 firmware swap",
                FIRMWARE_SWAP_SIZE,
                secure,
                ProtectedUnit::Hevc,
            )?,
        });
        Ok(())
    }

    fn initialize_hardware(&mut self, cx: &mut DecoderContext) -> Result<(), DecodeError> {
        let hw = cx
            .hw
            .as_mut()
            .ok_or_else(|| anyhow!("VP9 hardware initialized without the core"))?;
        hw.load_firmware(FirmwareType::Vp9Mmu)?;

        let working = self
            .working
            .as_ref()
            .ok_or_else(|| anyhow!("VP9 working buffers are missing"))?;
        let regs = hw.regs;
        regs.write(RPM_BUFFER, working.rpm.phys_base());
        regs.write(LMEM_DUMP_ADDR, working.lmem.phys_base());
        regs.write(PROB_SWAP_BUFFER, working.prob.phys_base());
        regs.write(COUNT_SWAP_BUFFER, working.count.phys_base());
        regs.write(SEG_MAP_BUFFER, working.seg_map.phys_base());
        regs.write(FIRMWARE_SWAP_BUFFER, working.firmware_swap.phys_base());
        regs.write(DECODE_MODE, DECODE_MODE_SINGLE_FRAME);
        regs.write(HEVC_SHIFT_STARTCODE, 0x0000_0001);
        regs.write(HEVC_SHIFT_EMULATECODE, 0x0000_0300);
        regs.write(HEVC_ASSIST_MBOX0_CLR_REG, 1);
        regs.write(HEVC_ASSIST_MBOX0_MASK, 1);
        Ok(())
    }

    fn handle_interrupt(&mut self, cx: &mut DecoderContext) {
        let Some(hw) = cx.hw.as_ref() else {
            return;
        };
        let status = hw.regs.read(DEC_STATUS);
        hw.regs.write(HEVC_ASSIST_MBOX0_CLR_REG, 1);
        log::trace!("VP9 interrupt, status {:#x}", status);

        match status {
            STATUS_HEADER_DONE => self.header_done(cx),
            STATUS_FRAME_DECODED => self.frame_decoded(cx),
            STATUS_INPUT_CONSUMED => self.input_consumed(cx),
            STATUS_INPUT_STARVED => log::debug!("VP9 firmware starved for input"),
            other => log::warn!("unexpected VP9 firmware status {:#x}", other),
        }
    }

    fn resume(&mut self, cx: &mut DecoderContext) {
        match self.state {
            DecoderState::FrameJustProduced => {
                if let Some(hw) = cx.hw.as_ref() {
                    hw.regs.write(DEC_STATUS, COMMAND_ACTION_DONE);
                }
                self.set_state(DecoderState::Running);
            }
            DecoderState::InitialWaitingForInput | DecoderState::StoppedWaitingForInput => {
                self.try_start(cx)
            }
            _ => (),
        }
    }

    fn queue_input(
        &mut self,
        cx: &mut DecoderContext,
        data: Bytes,
        pts: Option<u64>,
        _truncate: bool,
    ) -> Result<usize, DecodeError> {
        match split_superframe(&data) {
            Ok(frames) => {
                for frame in frames {
                    cx.io.input.push_data(data.slice_ref(frame), pts);
                }
            }
            Err(e) => {
                log::warn!("queuing chunk as a single frame: {:#}", e);
                cx.io.input.push_data(data.clone(), pts);
            }
        }
        self.try_start(cx);
        Ok(data.len())
    }

    fn end_of_stream(&mut self, cx: &mut DecoderContext) {
        cx.io.input.push_end_of_stream();
        self.try_start(cx);
    }

    fn return_frame(&mut self, cx: &mut DecoderContext, handle: FrameHandle) {
        if !self.frames.release_handle(handle) {
            return;
        }
        if self.state == DecoderState::PausedAtHeader {
            self.prepare_frame(cx);
        }
    }

    fn frames_provided(&mut self, cx: &mut DecoderContext, buffers: Vec<Buffer>) {
        let Some(request) = self.waiting_for_frames.take() else {
            log::warn!("ignoring frames that were not requested");
            return;
        };
        if let Err(e) = self.install_frames(cx, &request, buffers) {
            return self.fail(cx, e);
        }
        self.prepare_frame(cx);
    }

    fn can_be_swapped_in(&self, input: &InputQueue, client: &dyn DecoderClient) -> bool {
        if self.state != DecoderState::SwappedOut || self.saved_state == DecoderState::Failed {
            return false;
        }
        if !self.unconsumed {
            match input.front() {
                None => return false,
                // Reporting the end of the stream needs no output frame.
                Some(InputItem::EndOfStream) => return true,
                Some(InputItem::Data { .. }) => (),
            }
        }
        if !client.has_free_output() {
            return false;
        }
        if self.frames.is_empty() || self.frames.find_free().is_some() {
            return true;
        }
        // Without a free frame, only a frame showing an existing one can be decoded.
        match input.front() {
            Some(InputItem::Data { data, .. }) if !self.unconsumed => FrameInfo::peek(data)
                .map(|info| !info.needs_output_frame())
                .unwrap_or(false),
            _ => false,
        }
    }

    fn can_be_swapped_out(&self) -> bool {
        matches!(
            self.state,
            DecoderState::InitialWaitingForInput
                | DecoderState::StoppedWaitingForInput
                | DecoderState::FrameJustProduced
                | DecoderState::Failed
        )
    }

    fn set_swapped_out(&mut self) {
        self.saved_state = self.state;
        self.set_state(DecoderState::SwappedOut);
    }

    fn swapped_in(&mut self, cx: &mut DecoderContext) {
        let Some(hw) = cx.hw.as_ref() else {
            return;
        };
        self.unconsumed = !hw.fifo_empty();
        // The firmware was reloaded: a session swapped out after producing a frame just
        // carries on with the next one.
        let state = match self.saved_state {
            DecoderState::InitialWaitingForInput => DecoderState::InitialWaitingForInput,
            DecoderState::Failed => DecoderState::Failed,
            _ => DecoderState::StoppedWaitingForInput,
        };
        self.set_state(state);
        self.try_start(cx);
    }

    fn is_decoding(&self) -> bool {
        self.state == DecoderState::Running
    }

    fn is_failed(&self) -> bool {
        self.state == DecoderState::Failed
    }

    fn on_watchdog(&mut self, cx: &mut DecoderContext) {
        self.current = None;
        self.pending = None;
        self.fail(cx, DecodeError::WatchdogExpired);
    }

    fn teardown(&mut self, cx: &mut DecoderContext) {
        if let Some(hw) = cx.hw.as_mut() {
            hw.core.stop_decoding();
        }
        self.current = None;
        self.pending = None;
    }
}
