// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The physical decoder cores.
//!
//! A [`HardwareEngine`] wraps the register-level control of one core: power, microcode load,
//! stream input FIFO and the swap engine that saves and restores the FIFO state of a session.

pub mod hevc;
pub mod vdec1;

use std::time::Duration;

use thiserror::Error;

use crate::memory::AllocError;
use crate::memory::AllocationRequest;
use crate::memory::Buffer;
use crate::mmio::PollTimeout;
use crate::mmio::Register;
use crate::mmio::RegisterBanks;
use crate::CoreKind;

pub use hevc::HevcDec;
pub use vdec1::Vdec1;

/// Size of the buffer the swap engine saves the input state to.
pub const INPUT_CONTEXT_SIZE: usize = 4096;

const FIRMWARE_LOAD_TIMEOUT: Duration = Duration::from_secs(1);
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);
const SWAP_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("core timed out: {0}")]
    Timeout(#[from] PollTimeout),
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
    #[error("{0:?} is powered off")]
    PoweredOff(CoreKind),
    #[error("empty firmware image")]
    EmptyFirmware,
}

/// Saved hardware input state of a session that is not current on its core.
pub struct InputContext {
    pub buffer: Buffer,
    /// Read offset of the stream FIFO when the context was last saved.
    pub processed_video: u32,
}

/// One physical decoder core.
pub trait HardwareEngine: Send {
    fn kind(&self) -> CoreKind;
    fn is_powered(&self) -> bool;
    /// Ungates the clocks and powers the core up. Does nothing if already powered.
    fn power_on(&mut self);
    /// Gates the clocks and powers the core down. Does nothing if already off.
    fn power_off(&mut self);

    /// Loads `code` into the instruction memory of the core's firmware processor.
    fn load_firmware(&mut self, code: &[u8]) -> Result<(), CoreError>;

    /// Points the input FIFO at a stream buffer. With `use_parser` the FIFO is filled by the ES
    /// parser rather than by CPU write pointer updates.
    fn initialize_stream_input(&mut self, use_parser: bool, addr: u32, size: u32);
    /// Sets the FIFO up for input pushed by CPU write pointer updates, right after
    /// [`HardwareEngine::initialize_stream_input`] on a session's first run.
    fn initialize_direct_input(&mut self);
    /// Makes the bytes up to bus address `addr` available to the core.
    fn update_write_pointer(&mut self, addr: u32);
    /// Current write offset in the stream buffer.
    fn get_stream_input_offset(&self) -> u32;
    /// Offset in the stream buffer of the next byte the core will read.
    fn get_read_offset(&self) -> u32;

    fn start_decoding(&mut self);
    fn stop_decoding(&mut self);
    /// Waits until the core's DMA engines are idle.
    fn wait_for_idle(&mut self) -> Result<(), CoreError>;

    /// Allocates the buffer backing a new input context.
    fn initialize_input_context(&mut self, is_secure: bool) -> Result<InputContext, CoreError>;
    fn save_input_context(&mut self, context: &mut InputContext) -> Result<(), CoreError>;
    fn restore_input_context(&mut self, context: &InputContext) -> Result<(), CoreError>;
}

/// Registers through which a core's swap engine transfers the input state.
pub(crate) struct SwapRegisters {
    pub addr: Register,
    pub ctrl: Register,
    pub enable: u32,
    pub save: u32,
    pub busy: u32,
}

impl SwapRegisters {
    fn run(&self, regs: &RegisterBanks, buffer: &Buffer, save: bool) -> Result<(), CoreError> {
        if save {
            buffer.cache_flush(0, INPUT_CONTEXT_SIZE);
        }
        regs.write(self.ctrl, 0);
        regs.write(self.addr, buffer.phys_base());
        regs.write(
            self.ctrl,
            if save {
                self.enable | self.save
            } else {
                self.enable
            },
        );
        let busy = self.busy;
        regs.poll(self.ctrl, SWAP_TIMEOUT, |v| v & busy == 0)?;
        regs.write(self.ctrl, 0);
        if save {
            buffer.cache_invalidate(0, INPUT_CONTEXT_SIZE);
        }
        Ok(())
    }

    pub fn save(&self, regs: &RegisterBanks, buffer: &Buffer) -> Result<(), CoreError> {
        self.run(regs, buffer, true)
    }

    pub fn restore(&self, regs: &RegisterBanks, buffer: &Buffer) -> Result<(), CoreError> {
        self.run(regs, buffer, false)
    }
}

/// Microcode load through a core's IMEM DMA.
pub(crate) struct ImemDma {
    pub ctrl: Register,
    pub addr: Register,
    pub count: Register,
    pub start: u32,
    pub busy: u32,
}

impl ImemDma {
    pub fn load(
        &self,
        regs: &RegisterBanks,
        allocator: &dyn crate::memory::BufferAllocator,
        code: &[u8],
    ) -> Result<(), CoreError> {
        if code.is_empty() {
            return Err(CoreError::EmptyFirmware);
        }

        // The DMA moves whole words.
        let words = code.len().div_ceil(4);
        let buffer = allocator.allocate(&AllocationRequest::new("firmware", words * 4))?;
        buffer.write(0, code)?;
        buffer.cache_flush(0, words * 4);

        regs.write(self.addr, buffer.phys_base());
        regs.write(self.count, words as u32);
        regs.write(self.ctrl, self.start);
        let busy = self.busy;
        regs.poll(self.ctrl, FIRMWARE_LOAD_TIMEOUT, |v| v & busy == 0)?;

        log::debug!("loaded {} bytes of firmware", code.len());
        Ok(())
    }
}

fn wait_dma_idle(regs: &RegisterBanks, registers: &[(Register, u32)]) -> Result<(), CoreError> {
    for &(reg, busy) in registers {
        regs.poll(reg, IDLE_TIMEOUT, |v| v & busy == 0)?;
    }
    Ok(())
}

fn new_input_context(
    allocator: &dyn crate::memory::BufferAllocator,
    is_secure: bool,
    unit: crate::secure::ProtectedUnit,
) -> Result<InputContext, CoreError> {
    // The context only holds FIFO cursors; it shares the protection of the stream buffer.
    let request = AllocationRequest::new("input context", INPUT_CONTEXT_SIZE)
        .protected(is_secure.then_some(unit));
    let buffer = allocator.allocate(&request)?;
    Ok(InputContext {
        buffer,
        processed_video: 0,
    })
}
