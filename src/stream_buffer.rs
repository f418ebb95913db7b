// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The ring buffer input FIFOs read from.

use std::sync::atomic::fence;
use std::sync::atomic::Ordering;

use thiserror::Error;

use crate::engine::HardwareEngine;
use crate::memory::AllocError;
use crate::memory::AllocationRequest;
use crate::memory::Buffer;
use crate::memory::BufferAllocator;
use crate::secure::ProtectedUnit;
use crate::secure::ProtectionState;

/// Minimum distance kept between the write and the read cursors, so that a full ring can be
/// told apart from an empty one.
pub const WRITE_GAP: u32 = 8;

#[derive(Debug, Error)]
pub enum StreamBufferError {
    #[error("{requested} bytes do not fit in the {available} bytes available")]
    OutOfRange { requested: usize, available: usize },
    #[error("protected stream buffers can only be fed by the parser")]
    Protected,
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// A stream buffer owned by one session.
pub struct StreamBuffer {
    buffer: Buffer,
    data_size: u64,
    padding_size: usize,
}

impl StreamBuffer {
    pub fn new(
        allocator: &dyn BufferAllocator,
        protection: &ProtectionState,
        size: usize,
        padding_size: usize,
        protected: Option<ProtectedUnit>,
    ) -> Result<Self, StreamBufferError> {
        let request = AllocationRequest::new("stream buffer", size).protected(protected);
        let buffer = protection.allocate(allocator, &request)?;
        Ok(Self {
            buffer,
            data_size: 0,
            padding_size,
        })
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn size(&self) -> u32 {
        self.buffer.size() as u32
    }

    pub fn is_secure(&self) -> bool {
        self.buffer.is_secure()
    }

    /// Total number of bytes accepted since creation.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn padding_size(&self) -> usize {
        self.padding_size
    }

    /// Accounts for `len` bytes written into the ring by another agent.
    pub(crate) fn add_data_size(&mut self, len: usize) {
        self.data_size += len as u64;
    }

    /// Bytes that can currently be written, given the cursors of `core`.
    pub fn available(&self, core: &dyn HardwareEngine) -> u32 {
        let read = core.get_read_offset();
        let write = core.get_stream_input_offset();
        let free = if read > write {
            read - write
        } else {
            self.size() - write + read
        };
        free.saturating_sub(WRITE_GAP)
    }

    /// Copies `data` into the ring at the core's write cursor, then moves the cursor.
    ///
    /// Without `truncate`, data that does not fit fails with [`StreamBufferError::OutOfRange`]
    /// and nothing is written. With it, only what fits is written. Returns the number of bytes
    /// accepted.
    pub fn write(
        &mut self,
        core: &mut dyn HardwareEngine,
        data: &[u8],
        truncate: bool,
    ) -> Result<usize, StreamBufferError> {
        if self.is_secure() {
            return Err(StreamBufferError::Protected);
        }

        let available = self.available(core) as usize;
        let len = if data.len() > available {
            if !truncate {
                return Err(StreamBufferError::OutOfRange {
                    requested: data.len(),
                    available,
                });
            }
            available
        } else {
            data.len()
        };
        if len == 0 {
            return Ok(0);
        }

        let size = self.size() as usize;
        let write = core.get_stream_input_offset() as usize;
        let first = len.min(size - write);
        self.buffer.write(write, &data[..first])?;
        self.buffer.cache_flush(write, first);
        if first < len {
            self.buffer.write(0, &data[first..len])?;
            self.buffer.cache_flush(0, len - first);
        }

        // The data must be visible before the hardware learns about it.
        fence(Ordering::SeqCst);
        let new_write = ((write + len) % size) as u32;
        core.update_write_pointer(self.buffer.phys_base() + new_write);
        self.data_size += len as u64;

        Ok(len)
    }

    pub fn write_all(
        &mut self,
        core: &mut dyn HardwareEngine,
        data: &[u8],
    ) -> Result<(), StreamBufferError> {
        self.write(core, data, false).map(|_| ())
    }

    pub fn write_partial(
        &mut self,
        core: &mut dyn HardwareEngine,
        data: &[u8],
    ) -> Result<usize, StreamBufferError> {
        self.write(core, data, true)
    }

    /// Appends zero padding so the hardware flushes the last frame of the stream.
    pub fn pad_end_of_stream(
        &mut self,
        core: &mut dyn HardwareEngine,
    ) -> Result<usize, StreamBufferError> {
        let padding = vec![0u8; self.padding_size];
        self.write(core, &padding, true)
    }
}
