// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 decoding on the VDEC1 core.
//!
//! The firmware parses the stream on its own and talks to the driver through the AV scratch
//! mailbox: it announces the stream geometry, waits for the frame buffers, then reports decoded
//! frames in batches. Frames come back to the firmware through two release registers.
//!
//! The single-stream firmware keeps the core for the whole session and takes its input as it
//! comes. The multi-stream firmware takes one chunk at a time, like VP9, and gives the core up
//! between frames.

use anyhow::anyhow;
use bytes::Bytes;
use std::collections::VecDeque;

use crate::canvas::Nv12Canvases;
use crate::decoder::DecodeError;
use crate::decoder::DecoderClient;
use crate::decoder::DecoderContext;
use crate::decoder::DecoderStateMachine;
use crate::decoder::Feed;
use crate::decoder::FrameAllocation;
use crate::decoder::FrameRequest;
use crate::decoder::HwContext;
use crate::decoder::InputItem;
use crate::decoder::InputQueue;
use crate::firmware::FirmwareType;
use crate::frame::DecodedFrame;
use crate::frame::FrameHandle;
use crate::frame::FramePool;
use crate::memory::Buffer;
use crate::mmio::Register;
use crate::registers::vdec1::*;
use crate::secure::ProtectedUnit;
use crate::CodecKind;
use crate::Resolution;

pub const MAILBOX_COMMAND: Register = AV_SCRATCH_0;
pub const MAILBOX_ARG: Register = AV_SCRATCH_0.at(1);
/// Buffer index of the reported frames, one register per frame.
pub const FRAME_INDEX: Register = AV_SCRATCH_0.at(2);
pub const FRAME_RELEASE_A: Register = AV_SCRATCH_0.at(7);
pub const FRAME_RELEASE_B: Register = AV_SCRATCH_0.at(8);
/// Frame count the reloaded multi-stream firmware resumes with, 0 to start anew.
pub const RESTORE_FRAME_COUNT: Register = AV_SCRATCH_0.at(9);
/// Frames still held outside the firmware when it resumes, one bit each.
pub const RESTORE_BUSY_MASK: Register = AV_SCRATCH_0.at(0xa);
pub const WORKSPACE_ADDR: Register = AV_SCRATCH_0.at(0xb);
/// Stream offset of the reported frames, one register per frame.
pub const FRAME_OFFSET: Register = AV_SCRATCH_0.at(0xc);

pub const CMD_INITIALIZE_STREAM: u32 = 0x01;
pub const CMD_NEW_FRAMES: u32 = 0x02;
pub const CMD_FATAL_ERROR: u32 = 0x06;
pub const CMD_INPUT_CONSUMED: u32 = 0x10;

/// `FRAME_INDEX` flag of a frame decoded with errors.
pub const FRAME_ERROR: u32 = 1 << 15;
pub const MAX_FRAMES_PER_INTERRUPT: u32 = 4;
pub const MAX_FRAMES: usize = 24;
const WORKSPACE_SIZE: usize = 0x4_0000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecoderState {
    SwappedOut,
    WaitingForInput,
    /// The geometry is known and the client is allocating frames.
    WaitingForFrames,
    Running,
    /// A batch of frames was delivered and the firmware waits for the acknowledgement.
    FrameJustProduced,
    Failed,
}

/// Geometry reported by the firmware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub mb_width: u32,
    pub mb_height: u32,
    pub max_dpb: u32,
}

impl StreamInfo {
    pub fn from_register(value: u32) -> Self {
        Self {
            mb_width: value & 0xff,
            mb_height: (value >> 8) & 0xff,
            max_dpb: (value >> 16) & 0xff,
        }
    }

    pub fn to_register(&self) -> u32 {
        (self.mb_width & 0xff) | ((self.mb_height & 0xff) << 8) | ((self.max_dpb & 0xff) << 16)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.mb_width * 16,
            height: self.mb_height * 16,
        }
    }

    /// Frames needed: the reference frames, the frame being decoded and one held by the client.
    pub fn frame_count(&self) -> usize {
        (self.max_dpb as usize + 2).min(MAX_FRAMES)
    }
}

/// Reply to [`CMD_INITIALIZE_STREAM`] once the frames are in place.
pub fn stream_reply(max_ref: u32, count: usize) -> u32 {
    let count = count as u32 & 0xff;
    ((max_ref & 0xff) << 24) | (count << 16) | (count << 8)
}

pub struct H264Frame {
    pub buffer: Buffer,
    pub canvases: Nv12Canvases,
}

pub struct H264Decoder {
    multi_stream: bool,
    state: DecoderState,
    saved_state: DecoderState,
    workspace: Option<Buffer>,
    frames: FramePool<H264Frame>,
    info: Option<StreamInfo>,
    frame_layout: Option<FrameRequest>,
    waiting_for_frames: Option<FrameRequest>,
    /// Frames returned by the client that the firmware was not told about yet.
    pending_releases: VecDeque<usize>,
    /// Input was fed that the firmware has not reported consumed yet.
    unconsumed: bool,
    /// Input was written since the last reported frames.
    awaiting_output: bool,
}

impl H264Decoder {
    pub fn new(multi_stream: bool) -> Self {
        Self {
            multi_stream,
            state: DecoderState::SwappedOut,
            saved_state: DecoderState::WaitingForInput,
            workspace: None,
            frames: FramePool::new(),
            info: None,
            frame_layout: None,
            waiting_for_frames: None,
            pending_releases: VecDeque::new(),
            unconsumed: false,
            awaiting_output: false,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    fn set_state(&mut self, state: DecoderState) {
        if self.state != state {
            log::debug!("H.264 {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn fail(&mut self, cx: &mut DecoderContext, error: DecodeError) {
        self.set_state(DecoderState::Failed);
        cx.fail(error);
    }

    fn firmware(&self) -> FirmwareType {
        if self.multi_stream {
            FirmwareType::H264Multi
        } else {
            FirmwareType::H264
        }
    }

    fn program_canvases(&self, hw: &HwContext) {
        for i in 0..self.frames.len() {
            let canvases = &self.frames.get(i).canvases;
            let y = canvases.y.index() as u32;
            let uv = canvases.uv.index() as u32;
            hw.regs
                .write(ANC0_CANVAS_ADDR.at(i as u32), (uv << 16) | (uv << 8) | y);
        }
    }

    /// Hands the frames to the firmware and lets it go on.
    fn reply_stream_info(&mut self, cx: &mut DecoderContext) {
        let (Some(hw), Some(info)) = (cx.hw.as_ref(), self.info) else {
            return;
        };
        self.program_canvases(hw);
        hw.regs
            .write(MAILBOX_COMMAND, stream_reply(info.max_dpb, self.frames.len()));
        self.set_state(DecoderState::Running);
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
            frames.push(H264Frame { buffer, canvases });
        }
        self.frames.reset(frames);
        self.pending_releases.clear();
        self.frame_layout = Some(request.clone());
        log::info!(
            "H.264 frames allocated: {} x {:?}, stride {}",
            request.count,
            request.resolution,
            request.stride
        );
        Ok(())
    }

    fn initialize_stream(&mut self, cx: &mut DecoderContext) {
        let Some(hw) = cx.hw.as_ref() else {
            return;
        };
        let info = StreamInfo::from_register(hw.regs.read(MAILBOX_ARG));
        let resolution = info.resolution();
        if resolution.width == 0 || resolution.height == 0 {
            return self.fail(cx, anyhow!("invalid stream geometry {:?}", info).into());
        }
        log::debug!("H.264 stream {:?}, {} reference frames", resolution, info.max_dpb);
        self.info = Some(info);

        let stride = resolution.width.div_ceil(32) * 32;
        let request = FrameRequest {
            count: info.frame_count(),
            resolution,
            stride,
            size: resolution.nv12_size(stride),
            protected: cx.io.stream.is_secure(),
        };
        if self.frame_layout.as_ref() == Some(&request) {
            return self.reply_stream_info(cx);
        }
        match cx.io.client.initialize_frames(&request) {
            FrameAllocation::Ready(buffers) => match self.install_frames(cx, &request, buffers) {
                Ok(()) => self.reply_stream_info(cx),
                Err(e) => self.fail(cx, e),
            },
            FrameAllocation::Deferred => {
                self.waiting_for_frames = Some(request);
                self.set_state(DecoderState::WaitingForFrames);
            }
            FrameAllocation::Failed => self.fail(cx, DecodeError::FrameAllocation),
        }
    }

    fn new_frames(&mut self, cx: &mut DecoderContext) {
        let Some(hw) = cx.hw.as_ref() else {
            return;
        };
        let regs = hw.regs;
        let count = regs.read(MAILBOX_ARG).min(MAX_FRAMES_PER_INTERRUPT);
        let mut reported = Vec::with_capacity(count as usize);
        for i in 0..count {
            let index = regs.read(FRAME_INDEX.at(i));
            let offset = regs.read(FRAME_OFFSET.at(i));
            reported.push((index, offset));
        }

        for (value, offset) in reported {
            let index = (value & 0xff) as usize;
            if index >= self.frames.len() {
                log::warn!("firmware reported unknown frame {}", index);
                continue;
            }
            if value & FRAME_ERROR != 0 {
                log::warn!("frame {} decoded with errors", index);
            }
            let pts = cx.io.pts.lookup_hw(offset);
            let resolution = self
                .frame_layout
                .as_ref()
                .map(|l| (l.resolution, l.stride))
                .unwrap_or_default();
            let handle = self.frames.deliver(index);
            let frame = self.frames.get(index);
            cx.io.client.on_frame_ready(DecodedFrame {
                handle,
                resolution: resolution.0,
                stride: resolution.1,
                buffer: frame.buffer.clone(),
                pts,
            });
        }
        self.awaiting_output = false;

        if self.multi_stream {
            self.set_state(DecoderState::FrameJustProduced);
        } else if let Some(hw) = cx.hw.as_ref() {
            hw.regs.write(MAILBOX_COMMAND, 0);
            self.flush_queued(cx);
        }
    }

    fn input_consumed(&mut self, cx: &mut DecoderContext) {
        if !self.multi_stream {
            log::warn!("input consumed reported by the single-stream firmware");
            return;
        }
        if let Some(hw) = cx.hw.as_mut() {
            hw.core.stop_decoding();
        }
        self.unconsumed = false;
        self.set_state(DecoderState::WaitingForInput);

        if cx.io.input.is_empty() {
            cx.io.client.on_input_needed();
            return;
        }
        match cx.feed_next(<[u8]>::to_vec) {
            Ok(Feed::Fed) => self.unconsumed = true,
            Ok(Feed::EndOfStream) => cx.io.client.on_end_of_stream(),
            Ok(Feed::Empty) | Ok(Feed::Full) => (),
            Err(e) => self.fail(cx, e),
        }
    }

    /// Multi-stream: feeds the next chunk if the firmware has nothing left, and starts it.
    fn try_start(&mut self, cx: &mut DecoderContext) {
        if self.state != DecoderState::WaitingForInput || cx.hw.is_none() {
            return;
        }
        if !self.unconsumed {
            match cx.feed_next(<[u8]>::to_vec) {
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
            self.awaiting_output = true;
            self.set_state(DecoderState::Running);
        }
    }

    /// Single-stream: writes the input queued while the session was not current.
    fn flush_queued(&mut self, cx: &mut DecoderContext) {
        loop {
            match cx.feed_next(<[u8]>::to_vec) {
                Ok(Feed::Fed) => self.awaiting_output = true,
                Ok(Feed::EndOfStream) => self.finish_stream(cx),
                Ok(Feed::Empty) | Ok(Feed::Full) => return,
                Err(e) => return self.fail(cx, e),
            }
        }
    }

    /// Single-stream: pads the stream so the firmware flushes its last frames.
    fn finish_stream(&mut self, cx: &mut DecoderContext) {
        if let Some(hw) = cx.hw.as_mut() {
            if !cx.io.stream.is_secure() {
                if let Err(e) = cx.io.stream.pad_end_of_stream(hw.core) {
                    log::warn!("failed to pad the end of the stream: {}", e);
                }
            }
        }
        cx.io.client.on_end_of_stream();
    }

    fn flush_releases(&mut self, hw: &HwContext) {
        while let Some(&index) = self.pending_releases.front() {
            let register = if hw.regs.read(FRAME_RELEASE_A) == 0 {
                FRAME_RELEASE_A
            } else if hw.regs.read(FRAME_RELEASE_B) == 0 {
                FRAME_RELEASE_B
            } else {
                log::trace!("release registers busy, {} queued", self.pending_releases.len());
                return;
            };
            hw.regs.write(register, index as u32 + 1);
            self.pending_releases.pop_front();
        }
    }

    fn busy_mask(&self) -> u32 {
        (0..self.frames.len())
            .filter(|&i| self.frames.refcount(i) > 0)
            .fold(0, |mask, i| mask | (1 << i))
    }
}

impl DecoderStateMachine for H264Decoder {
    fn codec(&self) -> CodecKind {
        if self.multi_stream {
            CodecKind::H264Multi
        } else {
            CodecKind::H264
        }
    }

    fn initialize(&mut self, cx: &mut DecoderContext) -> Result<(), DecodeError> {
        let secure = cx.io.stream.is_secure();
        self.workspace = Some(cx.res.allocate(
            "h264 workspace",
            WORKSPACE_SIZE,
            secure,
            ProtectedUnit::Vdec,
        )?);
        Ok(())
    }

    fn initialize_hardware(&mut self, cx: &mut DecoderContext) -> Result<(), DecodeError> {
        let firmware = self.firmware();
        let hw = cx
            .hw
            .as_mut()
            .ok_or_else(|| anyhow!("H.264 hardware initialized without the core"))?;
        hw.load_firmware(firmware)?;

        let workspace = self
            .workspace
            .as_ref()
            .ok_or_else(|| anyhow!("H.264 workspace is missing"))?;
        let regs = hw.regs;
        regs.write(PSCALE_CTRL, 0);
        regs.write(MDEC_PIC_DC_CTRL, 0);
        regs.write(WORKSPACE_ADDR, workspace.phys_base());
        regs.write(MAILBOX_COMMAND, 0);
        regs.write(FRAME_RELEASE_A, 0);
        regs.write(FRAME_RELEASE_B, 0);
        if self.multi_stream && self.info.is_some() && !self.frames.is_empty() {
            self.program_canvases(hw);
            regs.write(RESTORE_FRAME_COUNT, self.frames.len() as u32);
            regs.write(RESTORE_BUSY_MASK, self.busy_mask());
        } else {
            regs.write(RESTORE_FRAME_COUNT, 0);
            regs.write(RESTORE_BUSY_MASK, 0);
        }
        regs.write(VDEC_ASSIST_MBOX1_CLR_REG, 1);
        regs.write(VDEC_ASSIST_MBOX1_MASK, 1);
        Ok(())
    }

    fn handle_interrupt(&mut self, cx: &mut DecoderContext) {
        let Some(hw) = cx.hw.as_ref() else {
            return;
        };
        let command = hw.regs.read(MAILBOX_COMMAND);
        hw.regs.write(VDEC_ASSIST_MBOX1_CLR_REG, 1);
        log::trace!("H.264 interrupt, command {:#x}", command);

        match command {
            CMD_INITIALIZE_STREAM => self.initialize_stream(cx),
            CMD_NEW_FRAMES => self.new_frames(cx),
            CMD_INPUT_CONSUMED => self.input_consumed(cx),
            CMD_FATAL_ERROR => self.fail(cx, DecodeError::FirmwareFatal),
            other => log::warn!("unexpected H.264 firmware command {:#x}", other),
        }

        if let Some(hw) = cx.hw.as_ref() {
            self.flush_releases(hw);
        }
    }

    fn resume(&mut self, cx: &mut DecoderContext) {
        match self.state {
            DecoderState::FrameJustProduced => {
                if let Some(hw) = cx.hw.as_ref() {
                    hw.regs.write(MAILBOX_COMMAND, 0);
                }
                self.set_state(DecoderState::Running);
            }
            DecoderState::WaitingForInput => self.try_start(cx),
            _ => (),
        }
    }

    fn queue_input(
        &mut self,
        cx: &mut DecoderContext,
        data: Bytes,
        pts: Option<u64>,
        truncate: bool,
    ) -> Result<usize, DecodeError> {
        if self.multi_stream {
            cx.io.input.push_data(data.clone(), pts);
            self.try_start(cx);
            return Ok(data.len());
        }

        let current = self.state != DecoderState::SwappedOut;
        if !current || !cx.io.input.is_empty() {
            // Earlier chunks still wait for stream space, and go first.
            let len = data.len();
            cx.io.input.push_data(data, pts);
            if current {
                self.flush_queued(cx);
            }
            return Ok(len);
        }
        let Some(hw) = cx.hw.as_mut() else {
            cx.io.input.push_data(data.clone(), pts);
            return Ok(data.len());
        };
        let io = &mut cx.io;
        let offset = io.stream.data_size();
        let written = if io.stream.is_secure() {
            hw.write_stream(io.stream, &data)?;
            data.len()
        } else {
            io.stream.write(hw.core, &data, truncate)?
        };
        if written > 0 {
            io.pts.insert(offset, pts);
            self.awaiting_output = true;
        }
        Ok(written)
    }

    fn end_of_stream(&mut self, cx: &mut DecoderContext) {
        cx.io.input.push_end_of_stream();
        if self.multi_stream {
            self.try_start(cx);
        } else if self.state != DecoderState::SwappedOut {
            self.flush_queued(cx);
        }
    }

    fn return_frame(&mut self, cx: &mut DecoderContext, handle: FrameHandle) {
        if !self.frames.release_handle(handle) {
            return;
        }
        if self.frames.refcount(handle.index) == 0 {
            self.pending_releases.push_back(handle.index);
        }
        if self.state != DecoderState::SwappedOut {
            if let Some(hw) = cx.hw.as_ref() {
                self.flush_releases(hw);
            }
        }
    }

    fn frames_provided(&mut self, cx: &mut DecoderContext, buffers: Vec<Buffer>) {
        let Some(request) = self.waiting_for_frames.take() else {
            log::warn!("ignoring frames that were not requested");
            return;
        };
        match self.install_frames(cx, &request, buffers) {
            Ok(()) => self.reply_stream_info(cx),
            Err(e) => self.fail(cx, e),
        }
    }

    fn can_be_swapped_in(&self, input: &InputQueue, client: &dyn DecoderClient) -> bool {
        if self.state != DecoderState::SwappedOut || self.saved_state == DecoderState::Failed {
            return false;
        }
        if !self.multi_stream {
            // Takes the core for good, input or not.
            return true;
        }
        if !self.unconsumed {
            match input.front() {
                None => return false,
                Some(InputItem::EndOfStream) => return true,
                Some(InputItem::Data { .. }) => (),
            }
        }
        client.has_free_output()
    }

    fn can_be_swapped_out(&self) -> bool {
        match self.state {
            DecoderState::Failed => true,
            DecoderState::WaitingForInput | DecoderState::FrameJustProduced => self.multi_stream,
            _ => false,
        }
    }

    fn set_swapped_out(&mut self) {
        self.saved_state = self.state;
        self.set_state(DecoderState::SwappedOut);
    }

    fn swapped_in(&mut self, cx: &mut DecoderContext) {
        let Some(hw) = cx.hw.as_ref() else {
            return;
        };
        if self.saved_state == DecoderState::Failed {
            return self.set_state(DecoderState::Failed);
        }
        // The reloaded firmware learned the held frames from the restore mask.
        self.pending_releases.clear();

        if self.multi_stream {
            self.unconsumed = !hw.fifo_empty();
            self.set_state(DecoderState::WaitingForInput);
            self.try_start(cx);
        } else {
            self.set_state(DecoderState::Running);
            self.flush_queued(cx);
            if let Some(hw) = cx.hw.as_mut() {
                hw.core.start_decoding();
            }
        }
    }

    fn is_decoding(&self) -> bool {
        self.state == DecoderState::Running && (self.multi_stream || self.awaiting_output)
    }

    fn is_failed(&self) -> bool {
        self.state == DecoderState::Failed
    }

    fn on_watchdog(&mut self, cx: &mut DecoderContext) {
        self.fail(cx, DecodeError::WatchdogExpired);
    }

    fn teardown(&mut self, cx: &mut DecoderContext) {
        if let Some(hw) = cx.hw.as_mut() {
            hw.core.stop_decoding();
        }
        self.pending_releases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::TestClient;

    #[test]
    fn stream_info_fields() {
        let info = StreamInfo::from_register(0x0004_2d50);
        assert_eq!(
            info,
            StreamInfo {
                mb_width: 0x50,
                mb_height: 0x2d,
                max_dpb: 4
            }
        );
        assert_eq!(info.resolution(), Resolution::from((1280, 720)));
        assert_eq!(info.frame_count(), 6);
        assert_eq!(info.to_register(), 0x0004_2d50);

        let big = StreamInfo {
            max_dpb: 30,
            ..info
        };
        assert_eq!(big.frame_count(), MAX_FRAMES);
    }

    #[test]
    fn reply_layout() {
        assert_eq!(stream_reply(4, 6), 0x0406_0600);
    }

    #[test]
    fn single_stream_keeps_its_core() {
        let mut decoder = H264Decoder::new(false);
        let client = TestClient::default();
        assert!(decoder.can_be_swapped_in(&InputQueue::default(), &client));
        decoder.state = DecoderState::Running;
        assert!(!decoder.can_be_swapped_out());
        decoder.state = DecoderState::Failed;
        assert!(decoder.can_be_swapped_out());
    }

    #[test]
    fn multi_stream_swap_points() {
        let mut decoder = H264Decoder::new(true);
        let client = TestClient::default();
        let mut input = InputQueue::default();
        assert!(!decoder.can_be_swapped_in(&input, &client));
        input.push_data(Bytes::from_static(&[0, 0, 1, 0x65]), None);
        assert!(decoder.can_be_swapped_in(&input, &client));

        decoder.state = DecoderState::FrameJustProduced;
        assert!(decoder.can_be_swapped_out());
        decoder.state = DecoderState::WaitingForFrames;
        assert!(!decoder.can_be_swapped_out());
    }
}
