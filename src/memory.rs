// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Physically contiguous DMA memory used by the decoder cores.
//!
//! The engine never allocates such memory itself: every buffer comes from a [`BufferAllocator`]
//! provided by the platform integration. [`HeapAllocator`] is a host-memory implementation that
//! hands out regions from a private bus address space, for integrations without a DMA heap and
//! for simulation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use thiserror::Error;

use crate::secure::ProtectedUnit;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("cannot allocate {size:#x} bytes for {name}")]
    Exhausted { name: &'static str, size: usize },
    #[error("protected buffers cannot be accessed by the CPU")]
    Protected,
    #[error("access of {len:#x} bytes at {offset:#x} outside of a {size:#x} bytes buffer")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A physically contiguous memory region visible to the decoder cores.
pub trait DmaRegion: Send + Sync {
    /// Bus address of the first byte of the region.
    fn phys_base(&self) -> u32;
    fn size(&self) -> usize;
    /// Whether the region lives in protected memory. Protected regions cannot be read or written
    /// by the CPU.
    fn is_secure(&self) -> bool;
    fn write(&self, offset: usize, data: &[u8]) -> Result<(), AllocError>;
    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), AllocError>;
    /// Makes CPU writes to `len` bytes at `offset` visible to the hardware.
    fn cache_flush(&self, offset: usize, len: usize);
    /// Discards CPU cache lines so that hardware writes to the range become visible.
    fn cache_invalidate(&self, offset: usize, len: usize);

    /// Bus address of the byte past the end of the region.
    fn phys_end(&self) -> u32 {
        self.phys_base() + self.size() as u32
    }
}

pub type Buffer = Arc<dyn DmaRegion>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Short name used in logs.
    pub name: &'static str,
    pub size: usize,
    pub alignment: usize,
    /// Hardware unit the buffer is protected for, if it must live in protected memory.
    pub protected: Option<ProtectedUnit>,
}

impl AllocationRequest {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            size,
            alignment: 4096,
            protected: None,
        }
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn protected(mut self, unit: Option<ProtectedUnit>) -> Self {
        self.protected = unit;
        self
    }
}

/// Source of DMA buffers.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, request: &AllocationRequest) -> Result<Buffer, AllocError>;
}

fn check_bounds(offset: usize, len: usize, size: usize) -> Result<(), AllocError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(AllocError::OutOfBounds { offset, len, size }),
    }
}

struct HeapRegion {
    phys_base: u32,
    secure: bool,
    data: Mutex<Vec<u8>>,
}

impl DmaRegion for HeapRegion {
    fn phys_base(&self) -> u32 {
        self.phys_base
    }

    fn size(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<(), AllocError> {
        if self.secure {
            return Err(AllocError::Protected);
        }
        let mut mem = self.data.lock().unwrap();
        check_bounds(offset, data.len(), mem.len())?;
        mem[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), AllocError> {
        if self.secure {
            return Err(AllocError::Protected);
        }
        let mem = self.data.lock().unwrap();
        check_bounds(offset, out.len(), mem.len())?;
        out.copy_from_slice(&mem[offset..offset + out.len()]);
        Ok(())
    }

    // Host memory is coherent with itself.
    fn cache_flush(&self, _offset: usize, _len: usize) {}

    fn cache_invalidate(&self, _offset: usize, _len: usize) {}
}

struct HeapState {
    next_phys: u64,
    limit: u64,
    regions: BTreeMap<u32, Weak<HeapRegion>>,
}

/// Allocator of host memory regions laid out in a private bus address space.
///
/// Bus addresses are never reused, so a stale address can not alias a newer buffer.
pub struct HeapAllocator {
    state: Mutex<HeapState>,
}

impl HeapAllocator {
    pub const DEFAULT_BASE: u32 = 0x1000_0000;

    pub fn new() -> Self {
        Self::with_address_space(Self::DEFAULT_BASE, 0xf000_0000)
    }

    /// Creates an allocator whose bus addresses start at `base` and stay below `limit`.
    pub fn with_address_space(base: u32, limit: u32) -> Self {
        Self {
            state: Mutex::new(HeapState {
                next_phys: base as u64,
                limit: limit as u64,
                regions: Default::default(),
            }),
        }
    }

    fn region_at(&self, phys: u32, len: usize) -> Result<(Arc<HeapRegion>, usize), AllocError> {
        let state = self.state.lock().unwrap();
        let region = state
            .regions
            .range(..=phys)
            .next_back()
            .and_then(|(_, region)| region.upgrade())
            .ok_or(AllocError::OutOfBounds {
                offset: phys as usize,
                len,
                size: 0,
            })?;
        let offset = (phys - region.phys_base) as usize;
        check_bounds(offset, len, region.size())?;
        Ok((region, offset))
    }

    /// Reads memory by bus address, the way the hardware does. Works on protected regions.
    pub fn read_phys(&self, phys: u32, out: &mut [u8]) -> Result<(), AllocError> {
        let (region, offset) = self.region_at(phys, out.len())?;
        let mem = region.data.lock().unwrap();
        out.copy_from_slice(&mem[offset..offset + out.len()]);
        Ok(())
    }

    /// Writes memory by bus address, the way the hardware does. Works on protected regions.
    pub fn write_phys(&self, phys: u32, data: &[u8]) -> Result<(), AllocError> {
        let (region, offset) = self.region_at(phys, data.len())?;
        let mut mem = region.data.lock().unwrap();
        mem[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Number of regions still alive.
    pub fn live_regions(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .regions
            .values()
            .filter(|r| r.strong_count() > 0)
            .count()
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, request: &AllocationRequest) -> Result<Buffer, AllocError> {
        let exhausted = AllocError::Exhausted {
            name: request.name,
            size: request.size,
        };
        if request.size == 0 {
            return Err(exhausted);
        }

        let mut state = self.state.lock().unwrap();
        let alignment = request.alignment.max(1) as u64;
        let phys_base = state.next_phys.div_ceil(alignment) * alignment;
        let end = phys_base + request.size as u64;
        if end > state.limit {
            return Err(exhausted);
        }
        state.next_phys = end;
        state.regions.retain(|_, r| r.strong_count() > 0);

        let region = Arc::new(HeapRegion {
            phys_base: phys_base as u32,
            secure: request.protected.is_some(),
            data: Mutex::new(vec![0; request.size]),
        });
        state
            .regions
            .insert(phys_base as u32, Arc::downgrade(&region));

        log::debug!(
            "allocated {} ({:#x} bytes) at {:#010x}{}",
            request.name,
            request.size,
            phys_base,
            if region.secure { ", protected" } else { "" }
        );

        Ok(region)
    }
}
