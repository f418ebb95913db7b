// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec state machines.
//!
//! A [`DecoderStateMachine`] drives one session's codec on its core: it feeds the stream
//! buffer, reacts to the firmware's interrupts and hands decoded frames to the session's
//! [`DecoderClient`]. State machines never own hardware. Every call receives a
//! [`DecoderContext`] carrying what the session may touch at that moment, with the core only
//! present while the session is current on it.

pub mod h264;
pub mod vp9;

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::canvas::CanvasAllocator;
use crate::canvas::CanvasError;
use crate::engine::CoreError;
use crate::engine::HardwareEngine;
use crate::firmware::FirmwareBlob;
use crate::firmware::FirmwareError;
use crate::firmware::FirmwareType;
use crate::frame::DecodedFrame;
use crate::frame::FrameHandle;
use crate::memory::AllocError;
use crate::memory::AllocationRequest;
use crate::memory::Buffer;
use crate::memory::BufferAllocator;
use crate::mmio::RegisterBanks;
use crate::parser::EsParser;
use crate::parser::ParserError;
use crate::pts::PtsManager;
use crate::secure::ProtectedUnit;
use crate::secure::ProtectionState;
use crate::secure::SecureError;
use crate::secure::TeeClient;
use crate::stream_buffer::StreamBuffer;
use crate::stream_buffer::StreamBufferError;
use crate::CodecKind;
use crate::Resolution;
use crate::SocKind;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no decoder interrupt within the watchdog period")]
    WatchdogExpired,
    #[error("firmware reported a fatal decode error")]
    FirmwareFatal,
    #[error("the client could not allocate output frames")]
    FrameAllocation,
    #[error("got {got} frame buffers of at least {size:#x} bytes, {count} of {needed:#x} needed")]
    BadFrames {
        got: usize,
        size: usize,
        count: usize,
        needed: usize,
    },
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Canvas(#[from] CanvasError),
    #[error(transparent)]
    StreamBuffer(#[from] StreamBufferError),
    #[error(transparent)]
    Parser(#[from] ParserError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Secure(#[from] SecureError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Output frames a decoder needs before it can continue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameRequest {
    pub count: usize,
    pub resolution: Resolution,
    /// Bytes per row of both NV12 planes.
    pub stride: u32,
    /// Minimum size of each buffer.
    pub size: usize,
    /// Whether the buffers must be protected.
    pub protected: bool,
}

/// Answer of the client to a [`FrameRequest`].
pub enum FrameAllocation {
    /// The buffers, in the order frames will be indexed.
    Ready(Vec<Buffer>),
    /// The buffers will be given later through `VideoEngine::provide_frames`.
    Deferred,
    Failed,
}

/// Receiver of a session's output. Called with the engine lock held: implementations must not
/// call back into the engine.
pub trait DecoderClient: Send {
    fn on_frame_ready(&mut self, frame: DecodedFrame);
    fn on_error(&mut self, error: DecodeError);
    /// The decoder ran out of queued input.
    fn on_input_needed(&mut self) {}
    fn on_end_of_stream(&mut self) {}
    /// Whether the client can take another frame right now.
    fn has_free_output(&self) -> bool {
        true
    }
    fn initialize_frames(&mut self, request: &FrameRequest) -> FrameAllocation;
}

pub enum InputItem {
    Data { data: Bytes, pts: Option<u64> },
    EndOfStream,
}

/// Input accepted from the client that is not in the stream buffer yet.
#[derive(Default)]
pub struct InputQueue {
    items: VecDeque<InputItem>,
}

impl InputQueue {
    pub fn push_data(&mut self, data: Bytes, pts: Option<u64>) {
        self.items.push_back(InputItem::Data { data, pts });
    }

    pub fn push_end_of_stream(&mut self) {
        self.items.push_back(InputItem::EndOfStream);
    }

    /// Puts an item taken by [`InputQueue::pop`] back at the head.
    pub fn push_front(&mut self, item: InputItem) {
        self.items.push_front(item);
    }

    pub fn pop(&mut self) -> Option<InputItem> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&InputItem> {
        self.items.front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the head of the queue is data, as opposed to nothing or end of stream.
    pub fn has_data(&self) -> bool {
        matches!(self.items.front(), Some(InputItem::Data { .. }))
    }
}

/// Source of the firmware images loaded into the cores.
pub struct FirmwareLoader {
    blob: FirmwareBlob,
    soc: SocKind,
    tee: Option<Arc<dyn TeeClient>>,
    /// Have the secure world load the images instead of the CPU.
    secure_loading: bool,
}

impl FirmwareLoader {
    pub fn new(
        blob: FirmwareBlob,
        soc: SocKind,
        tee: Option<Arc<dyn TeeClient>>,
        secure_loading: bool,
    ) -> Self {
        Self {
            blob,
            soc,
            tee,
            secure_loading,
        }
    }

    pub fn blob(&self) -> &FirmwareBlob {
        &self.blob
    }

    pub fn load(
        &self,
        core: &mut dyn HardwareEngine,
        firmware: FirmwareType,
    ) -> Result<(), DecodeError> {
        if self.secure_loading {
            let tee = self.tee.as_ref().ok_or(SecureError::NoTee)?;
            tee.load_video_firmware(firmware, self.soc)
                .map_err(|e| SecureError::Load(firmware, e))?;
            log::debug!("{:?} firmware loaded by the TEE", firmware);
            return Ok(());
        }

        let code = self.blob.get_firmware_data(firmware, self.soc)?;
        core.load_firmware(code)?;
        log::debug!(
            "loaded {} for {:?}",
            firmware.name(self.soc),
            core.kind()
        );
        Ok(())
    }
}

/// Engine-wide resources available to a session at any time.
pub struct Resources<'a> {
    pub allocator: &'a dyn BufferAllocator,
    pub protection: &'a ProtectionState,
    pub canvas: &'a CanvasAllocator,
    pub soc: SocKind,
}

impl Resources<'_> {
    /// Allocates a working buffer, protected for `unit` when `secure`.
    pub fn allocate(
        &self,
        name: &'static str,
        size: usize,
        secure: bool,
        unit: ProtectedUnit,
    ) -> Result<Buffer, AllocError> {
        let request = AllocationRequest::new(name, size).protected(secure.then_some(unit));
        self.protection.allocate(self.allocator, &request)
    }
}

/// The core and its satellites, lent to the session that is current on the core.
pub struct HwContext<'a> {
    pub core: &'a mut dyn HardwareEngine,
    pub regs: &'a RegisterBanks,
    pub parser: &'a mut EsParser,
    pub firmware: &'a FirmwareLoader,
}

impl HwContext<'_> {
    pub fn load_firmware(&mut self, firmware: FirmwareType) -> Result<(), DecodeError> {
        self.firmware.load(self.core, firmware)
    }

    /// Appends `data` to `stream`, through the parser for protected streams.
    pub fn write_stream(
        &mut self,
        stream: &mut StreamBuffer,
        data: &[u8],
    ) -> Result<(), DecodeError> {
        if stream.is_secure() {
            self.parser.parse_video(self.core, stream, data)?;
        } else {
            stream.write_all(self.core, data)?;
        }
        Ok(())
    }

    /// Whether the core consumed everything written to its FIFO.
    pub fn fifo_empty(&self) -> bool {
        self.core.get_read_offset() == self.core.get_stream_input_offset()
    }
}

/// Per-session state owned by the instance.
pub struct SessionIo<'a> {
    pub stream: &'a mut StreamBuffer,
    pub pts: &'a mut PtsManager,
    pub input: &'a mut InputQueue,
    pub client: &'a mut dyn DecoderClient,
}

pub struct DecoderContext<'a> {
    pub res: Resources<'a>,
    /// Only present while the session is current on its core.
    pub hw: Option<HwContext<'a>>,
    pub io: SessionIo<'a>,
}

/// Outcome of writing one queued input item to the stream buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
    Fed,
    /// Nothing was written: the ring is too full. The item stays queued.
    Full,
    EndOfStream,
    Empty,
}

impl DecoderContext<'_> {
    /// Moves the input item at the head of the queue into the stream buffer, framing its data
    /// with `frame`.
    ///
    /// The timestamp of the item is recorded at the stream offset it lands at.
    pub fn feed_next<F>(&mut self, frame: F) -> Result<Feed, DecodeError>
    where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        let Some(hw) = self.hw.as_mut() else {
            return Ok(Feed::Full);
        };
        let io = &mut self.io;
        let (data, pts) = match io.input.pop() {
            None => return Ok(Feed::Empty),
            Some(InputItem::EndOfStream) => return Ok(Feed::EndOfStream),
            Some(InputItem::Data { data, pts }) => (data, pts),
        };

        let framed = frame(&data);
        let offset = io.stream.data_size();
        match hw.write_stream(io.stream, &framed) {
            Ok(()) => {
                io.pts.insert(offset, pts);
                Ok(Feed::Fed)
            }
            Err(
                DecodeError::StreamBuffer(StreamBufferError::OutOfRange { .. })
                | DecodeError::Parser(ParserError::OutOfRange { .. }),
            ) if !hw.fifo_empty() => {
                io.input.push_front(InputItem::Data { data, pts });
                Ok(Feed::Full)
            }
            Err(e) => Err(e),
        }
    }

    /// Stops the core if the session holds it and reports `error`.
    pub fn fail(&mut self, error: DecodeError) {
        log::error!("decoding failed: {}", error);
        if let Some(hw) = self.hw.as_mut() {
            hw.core.stop_decoding();
        }
        self.io.client.on_error(error);
    }
}

/// One session's codec logic.
///
/// Methods taking a context that may lack the core must only queue work when it does.
pub trait DecoderStateMachine: Send {
    fn codec(&self) -> CodecKind;

    /// Allocates the session's working buffers. Runs once, before the session has ever been
    /// current.
    fn initialize(&mut self, cx: &mut DecoderContext) -> Result<(), DecodeError>;

    /// Loads the firmware and programs the core after it was powered up for this session.
    fn initialize_hardware(&mut self, cx: &mut DecoderContext) -> Result<(), DecodeError>;

    /// Services an interrupt of the core. Always called with the core present.
    fn handle_interrupt(&mut self, cx: &mut DecoderContext);

    /// Called after the scheduler declined to swap the session out. Continues the work the
    /// last interrupt paused at a swap point.
    fn resume(&mut self, _cx: &mut DecoderContext) {}

    /// Accepts input from the client. Returns the number of bytes accepted, which is less than
    /// `data.len()` only with `truncate`.
    fn queue_input(
        &mut self,
        cx: &mut DecoderContext,
        data: Bytes,
        pts: Option<u64>,
        truncate: bool,
    ) -> Result<usize, DecodeError>;

    fn end_of_stream(&mut self, cx: &mut DecoderContext);

    /// The client gave back a delivered frame.
    fn return_frame(&mut self, cx: &mut DecoderContext, handle: FrameHandle);

    /// Buffers for a [`FrameAllocation::Deferred`] request.
    fn frames_provided(&mut self, cx: &mut DecoderContext, buffers: Vec<Buffer>);

    fn can_be_swapped_in(&self, input: &InputQueue, client: &dyn DecoderClient) -> bool;
    fn can_be_swapped_out(&self) -> bool;

    /// The session is about to lose its core.
    fn set_swapped_out(&mut self);

    /// The session got its core back, with firmware loaded and input restored.
    fn swapped_in(&mut self, cx: &mut DecoderContext);

    /// Whether the core is expected to raise an interrupt, so the watchdog must run.
    fn is_decoding(&self) -> bool;

    fn is_failed(&self) -> bool;

    /// The watchdog expired while decoding.
    fn on_watchdog(&mut self, cx: &mut DecoderContext);

    /// Stops all hardware activity of the session, which is being destroyed.
    fn teardown(&mut self, cx: &mut DecoderContext);
}

/// Creates the state machine of `codec`. VP9 sessions allocate `vp9_frame_count` frames.
pub fn new_decoder(codec: CodecKind, vp9_frame_count: usize) -> Box<dyn DecoderStateMachine> {
    match codec {
        CodecKind::H264 => Box::new(h264::H264Decoder::new(false)),
        CodecKind::H264Multi => Box::new(h264::H264Decoder::new(true)),
        CodecKind::Vp9 => Box::new(vp9::Vp9Decoder::with_frame_count(vp9_frame_count)),
    }
}
