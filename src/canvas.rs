// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Canvas table entries.
//!
//! The decoder cores address frame planes through entries of the memory controller's canvas
//! lookup table, each describing a 2D plane (address, stride, height).

use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use crate::memory::Buffer;
use crate::mmio::RegisterBanks;
use crate::registers::dmc_regs::*;

pub const CANVAS_COUNT: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanvasError {
    #[error("no free canvas entry")]
    Exhausted,
    #[error("plane at {offset:#x} of {len:#x} bytes exceeds its {size:#x} bytes buffer")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("canvas addresses and strides must be 8-byte aligned")]
    Unaligned,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlockMode {
    #[default]
    Linear = 0,
    Block32x32 = 1,
    Block64x32 = 2,
}

/// Layout of a plane described by a canvas.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Offset of the plane in its buffer.
    pub offset: usize,
    /// Bytes per row.
    pub stride: u32,
    /// Number of rows.
    pub height: u32,
    pub block_mode: BlockMode,
}

struct CanvasTable {
    used: Vec<bool>,
}

/// Allocator of canvas table entries.
#[derive(Clone)]
pub struct CanvasAllocator {
    regs: RegisterBanks,
    table: Arc<Mutex<CanvasTable>>,
    first: usize,
}

impl CanvasAllocator {
    /// Entries below `first` are left to other users of the table, such as the display.
    pub fn new(regs: RegisterBanks, first: usize) -> Self {
        Self {
            regs,
            table: Arc::new(Mutex::new(CanvasTable {
                used: vec![false; CANVAS_COUNT],
            })),
            first,
        }
    }

    /// Programs a free canvas entry with `layout` inside `buffer`.
    pub fn configure(&self, buffer: &Buffer, layout: PlaneLayout) -> Result<Canvas, CanvasError> {
        let len = layout.stride as usize * layout.height as usize;
        if layout.offset + len > buffer.size() {
            return Err(CanvasError::OutOfBounds {
                offset: layout.offset,
                len,
                size: buffer.size(),
            });
        }
        let addr = buffer.phys_base() + layout.offset as u32;
        if addr % 8 != 0 || layout.stride % 8 != 0 {
            return Err(CanvasError::Unaligned);
        }

        let index = {
            let mut table = self.table.lock().unwrap();
            let index = (self.first..CANVAS_COUNT)
                .find(|&i| !table.used[i])
                .ok_or(CanvasError::Exhausted)?;
            table.used[index] = true;
            index
        };

        let width = layout.stride >> 3;
        let datal = ((addr >> 3) & 0x1fff_ffff) | ((width & 0x7) << 29);
        let datah = ((width >> 3) & 0x1ff)
            | ((layout.height & 0x1fff) << 9)
            | ((layout.block_mode as u32) << 24);
        self.regs.write(DMC_CAV_LUT_DATAL, datal);
        self.regs.write(DMC_CAV_LUT_DATAH, datah);
        self.regs.write(DMC_CAV_LUT_ADDR, CAV_LUT_WRITE | index as u32);
        // Read back to make sure the table update landed before the entry is used.
        self.regs.read(DMC_CAV_LUT_RDATAL);

        Ok(Canvas {
            index: index as u8,
            table: self.table.clone(),
        })
    }

    pub fn free_count(&self) -> usize {
        let table = self.table.lock().unwrap();
        table.used[self.first..].iter().filter(|u| !**u).count()
    }
}

/// A programmed canvas entry, released when dropped.
pub struct Canvas {
    index: u8,
    table: Arc<Mutex<CanvasTable>>,
}

impl Canvas {
    pub fn index(&self) -> u8 {
        self.index
    }
}

impl std::fmt::Debug for Canvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Canvas({})", self.index)
    }
}

impl Drop for Canvas {
    fn drop(&mut self) {
        self.table.lock().unwrap().used[self.index as usize] = false;
    }
}

/// Luma and chroma canvases of an NV12 frame.
#[derive(Debug)]
pub struct Nv12Canvases {
    pub y: Canvas,
    pub uv: Canvas,
}

impl Nv12Canvases {
    pub fn new(
        allocator: &CanvasAllocator,
        buffer: &Buffer,
        stride: u32,
        height: u32,
    ) -> Result<Self, CanvasError> {
        let y = allocator.configure(
            buffer,
            PlaneLayout {
                offset: 0,
                stride,
                height,
                block_mode: BlockMode::Linear,
            },
        )?;
        let uv = allocator.configure(
            buffer,
            PlaneLayout {
                offset: stride as usize * height as usize,
                stride,
                height: height / 2,
                block_mode: BlockMode::Linear,
            },
        )?;
        Ok(Self { y, uv })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::FakeSoc;
    use crate::memory::AllocationRequest;

    #[test]
    fn entries_are_programmed_and_released() {
        let soc = FakeSoc::new();
        let allocator = CanvasAllocator::new(soc.banks(), 128);
        let buffer = soc
            .allocator()
            .allocate(&AllocationRequest::new("frame", 64 * 48 * 3 / 2))
            .unwrap();

        let canvases = Nv12Canvases::new(&allocator, &buffer, 64, 48).unwrap();
        assert_eq!(canvases.y.index(), 128);
        assert_eq!(canvases.uv.index(), 129);
        assert_eq!(allocator.free_count(), 126);

        let entry = soc.canvas_entry(129).unwrap();
        assert_eq!(entry.addr, buffer.phys_base() + 64 * 48);
        assert_eq!(entry.stride, 64);
        assert_eq!(entry.height, 24);

        drop(canvases);
        assert_eq!(allocator.free_count(), 128);
    }

    #[test]
    fn rejects_planes_outside_the_buffer() {
        let soc = FakeSoc::new();
        let allocator = CanvasAllocator::new(soc.banks(), 0);
        let buffer = soc
            .allocator()
            .allocate(&AllocationRequest::new("small", 64))
            .unwrap();

        assert!(matches!(
            Nv12Canvases::new(&allocator, &buffer, 64, 2),
            Err(CanvasError::OutOfBounds { .. })
        ));
        assert_eq!(allocator.free_count(), CANVAS_COUNT);
    }

    #[test]
    fn exhaustion() {
        let soc = FakeSoc::new();
        let allocator = CanvasAllocator::new(soc.banks(), CANVAS_COUNT - 1);
        let buffer = soc
            .allocator()
            .allocate(&AllocationRequest::new("frame", 64))
            .unwrap();
        let layout = PlaneLayout {
            offset: 0,
            stride: 8,
            height: 8,
            block_mode: BlockMode::Linear,
        };

        let _canvas = allocator.configure(&buffer, layout).unwrap();
        assert_eq!(
            allocator.configure(&buffer, layout).unwrap_err(),
            CanvasError::Exhausted
        );
    }
}
