// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Access to the memory-mapped register banks of the video decoder block.
//!
//! Registers are addressed by bank and word index, the byte offset into the bank being the index
//! multiplied by 4. Everything above this module goes through [`RegisterBanks`], which lets the
//! banks be backed either by a real mapping ([`MmioRegion`]) or by any other [`RegisterIo`]
//! implementation.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use thiserror::Error;

/// A bank of 32-bit registers.
pub trait RegisterIo: Send + Sync {
    /// Reads the register at byte `offset`.
    fn read32(&self, offset: u32) -> u32;
    /// Writes `value` to the register at byte `offset`.
    fn write32(&self, offset: u32, value: u32);
}

#[derive(Debug, Error)]
pub enum MmioError {
    #[error("cannot map an empty register region")]
    EmptyRegion,
    #[error("failed to map register region: {0}")]
    Map(nix::Error),
}

/// A register bank mapped from a device file.
pub struct MmioRegion {
    base: NonNull<c_void>,
    len: usize,
}

// SAFETY: the mapping is only accessed through volatile 32-bit loads and stores, which the
// hardware serializes.
unsafe impl Send for MmioRegion {}
// SAFETY: see above.
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Maps `len` bytes of `fd` starting at `offset`.
    pub fn map<F: AsFd>(fd: F, offset: i64, len: usize) -> Result<Self, MmioError> {
        let length = NonZeroUsize::new(len).ok_or(MmioError::EmptyRegion)?;

        // SAFETY: we map a fresh region whose lifetime is bound to the returned object, and
        // never hand out references into it.
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset,
            )
        }
        .map_err(MmioError::Map)?;

        Ok(Self { base, len })
    }

    fn register_ptr(&self, offset: u32) -> *mut u32 {
        let offset = offset as usize;
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len,
            "register offset {:#x} outside of a {:#x} bytes bank",
            offset,
            self.len
        );
        // SAFETY: the offset has been checked against the mapping size just above.
        unsafe { self.base.as_ptr().cast::<u8>().add(offset).cast::<u32>() }
    }
}

impl RegisterIo for MmioRegion {
    fn read32(&self, offset: u32) -> u32 {
        // SAFETY: `register_ptr` returns an aligned pointer inside the mapping.
        unsafe { std::ptr::read_volatile(self.register_ptr(offset)) }
    }

    fn write32(&self, offset: u32, value: u32) {
        // SAFETY: `register_ptr` returns an aligned pointer inside the mapping.
        unsafe { std::ptr::write_volatile(self.register_ptr(offset), value) }
    }
}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        // SAFETY: `base` and `len` describe the mapping created in `map`.
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            log::error!("failed to unmap register region: {}", e);
        }
    }
}

/// The register banks used by the video decoder block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Bank {
    /// Legacy bus, hosting the ES parser.
    Cbus,
    /// Decoder bus: VDEC1, HEVC and their assist/mailbox blocks.
    Dosbus,
    /// Always-on domain: power switches and isolation.
    Aobus,
    /// Clock controller.
    Hiubus,
    /// Memory controller: canvas table and DMA request gating.
    Dmc,
}

/// A register described by its bank and word index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Register {
    pub bank: Bank,
    pub index: u32,
}

impl Register {
    pub const fn new(bank: Bank, index: u32) -> Self {
        Self { bank, index }
    }

    /// Byte offset of the register inside its bank.
    pub const fn offset(&self) -> u32 {
        self.index * 4
    }

    /// The register `n` words after this one, for register arrays.
    pub const fn at(&self, n: u32) -> Self {
        Self {
            bank: self.bank,
            index: self.index + n,
        }
    }
}

#[derive(Debug, Error)]
#[error("register {register:?} did not reach the expected state within {timeout:?}")]
pub struct PollTimeout {
    pub register: Register,
    pub timeout: Duration,
}

/// All the register banks of the video decoder block.
#[derive(Clone)]
pub struct RegisterBanks {
    cbus: Arc<dyn RegisterIo>,
    dosbus: Arc<dyn RegisterIo>,
    aobus: Arc<dyn RegisterIo>,
    hiubus: Arc<dyn RegisterIo>,
    dmc: Arc<dyn RegisterIo>,
}

impl RegisterBanks {
    pub fn new(
        cbus: Arc<dyn RegisterIo>,
        dosbus: Arc<dyn RegisterIo>,
        aobus: Arc<dyn RegisterIo>,
        hiubus: Arc<dyn RegisterIo>,
        dmc: Arc<dyn RegisterIo>,
    ) -> Self {
        Self {
            cbus,
            dosbus,
            aobus,
            hiubus,
            dmc,
        }
    }

    fn bank(&self, bank: Bank) -> &dyn RegisterIo {
        match bank {
            Bank::Cbus => self.cbus.as_ref(),
            Bank::Dosbus => self.dosbus.as_ref(),
            Bank::Aobus => self.aobus.as_ref(),
            Bank::Hiubus => self.hiubus.as_ref(),
            Bank::Dmc => self.dmc.as_ref(),
        }
    }

    pub fn read(&self, reg: Register) -> u32 {
        self.bank(reg.bank).read32(reg.offset())
    }

    pub fn write(&self, reg: Register, value: u32) {
        self.bank(reg.bank).write32(reg.offset(), value)
    }

    pub fn set_bits(&self, reg: Register, mask: u32) {
        self.write(reg, self.read(reg) | mask)
    }

    pub fn clear_bits(&self, reg: Register, mask: u32) {
        self.write(reg, self.read(reg) & !mask)
    }

    /// Replaces the bits of `reg` selected by `mask` with those of `value`.
    pub fn update(&self, reg: Register, mask: u32, value: u32) {
        self.write(reg, (self.read(reg) & !mask) | (value & mask))
    }

    /// Spins until `cond` holds for the value of `reg`, for at most `timeout`.
    ///
    /// Returns the last value read.
    pub fn poll<F>(&self, reg: Register, timeout: Duration, cond: F) -> Result<u32, PollTimeout>
    where
        F: Fn(u32) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let value = self.read(reg);
            if cond(value) {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(PollTimeout {
                    register: reg,
                    timeout,
                });
            }
            std::thread::yield_now();
        }
    }
}
