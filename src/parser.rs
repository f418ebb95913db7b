// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The hardware elementary stream parser.
//!
//! The parser DMAs input from a staging buffer into a stream buffer. It is the only way to feed
//! a protected stream buffer, which the CPU cannot write.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::engine::HardwareEngine;
use crate::irq::IrqError;
use crate::irq::IrqEvent;
use crate::memory::AllocError;
use crate::memory::AllocationRequest;
use crate::memory::Buffer;
use crate::memory::BufferAllocator;
use crate::mmio::RegisterBanks;
use crate::registers::parser::*;
use crate::stream_buffer::StreamBuffer;
use crate::CoreKind;

const PARSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("parser did not finish within {0:?}")]
    Timeout(Duration),
    #[error("{requested} bytes do not fit in the {available} bytes available")]
    OutOfRange { requested: usize, available: usize },
    #[error(transparent)]
    Irq(#[from] IrqError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

pub struct EsParser {
    regs: RegisterBanks,
    irq: Arc<IrqEvent>,
    allocator: Arc<dyn BufferAllocator>,
    staging: Option<Buffer>,
    /// Bus address of the stream buffer the parser currently outputs to.
    target: Option<u32>,
    busy: bool,
}

impl EsParser {
    pub fn new(regs: RegisterBanks, irq: Arc<IrqEvent>, allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            regs,
            irq,
            allocator,
            staging: None,
            target: None,
            busy: false,
        }
    }

    /// Points the parser video output at `stream`, continuing from `core`'s write cursor.
    pub fn initialize(&mut self, core: &dyn HardwareEngine, stream: &StreamBuffer) {
        let regs = &self.regs;
        let base = stream.buffer().phys_base();

        regs.write(PARSER_CONTROL, CONTROL_RESET);
        regs.write(PARSER_CONTROL, CONTROL_WRITE_ENDIAN | CONTROL_AUTOSEARCH);
        regs.write(PARSER_VIDEO_START_PTR, base);
        regs.write(PARSER_VIDEO_END_PTR, base + stream.size() - 8);
        regs.write(PARSER_VIDEO_WP, base + core.get_stream_input_offset());
        regs.write(PARSER_VIDEO_RP, base + core.get_read_offset());
        let destination = match core.kind() {
            CoreKind::Vdec1 => ES_VIDEO_TO_VDEC1,
            CoreKind::Hevc => ES_VIDEO_TO_HEVC,
        };
        regs.write(PARSER_ES_CONTROL, destination);
        regs.write(PARSER_CONFIG, CONFIG_PFIFO_EMPTY_CNT);
        regs.write(PARSER_INT_STATUS, 0xffff);
        regs.write(PARSER_INT_ENABLE, INT_FETCH_DONE);

        self.target = Some(base);
    }

    fn staging(&mut self, len: usize) -> Result<Buffer, ParserError> {
        match &self.staging {
            Some(buffer) if buffer.size() >= len => Ok(buffer.clone()),
            _ => {
                let size = len.next_power_of_two().max(4096);
                let buffer = self
                    .allocator
                    .allocate(&AllocationRequest::new("parser staging", size))?;
                self.staging = Some(buffer.clone());
                Ok(buffer)
            }
        }
    }

    /// Feeds `data` into `stream` through the parser, then makes it available to `core`.
    pub fn parse_video(
        &mut self,
        core: &mut dyn HardwareEngine,
        stream: &mut StreamBuffer,
        data: &[u8],
    ) -> Result<(), ParserError> {
        if data.is_empty() {
            return Ok(());
        }
        let available = stream.available(core) as usize;
        if data.len() > available {
            return Err(ParserError::OutOfRange {
                requested: data.len(),
                available,
            });
        }
        if self.target != Some(stream.buffer().phys_base()) {
            self.initialize(core, stream);
        }
        // Keep the parser's view of the read cursor current so it never overruns the core.
        self.regs.write(
            PARSER_VIDEO_RP,
            stream.buffer().phys_base() + core.get_read_offset(),
        );

        let staging = self.staging(data.len())?;
        staging.write(0, data)?;
        staging.cache_flush(0, data.len());

        // Discard a stale signal from a cancelled fetch.
        self.irq.clear()?;
        self.busy = true;
        self.regs.write(PARSER_FETCH_ADDR, staging.phys_base());
        self.regs
            .write(PARSER_FETCH_CMD, FETCH_CMD_START | (data.len() as u32 & FETCH_CMD_LEN_MASK));

        let fired = self.irq.wait(PARSE_TIMEOUT)?;
        let status = self.regs.read(PARSER_INT_STATUS);
        if !fired && status & INT_FETCH_DONE == 0 {
            log::error!("parser timed out feeding {} bytes", data.len());
            self.cancel();
            return Err(ParserError::Timeout(PARSE_TIMEOUT));
        }
        self.regs.write(PARSER_INT_STATUS, INT_FETCH_DONE);
        self.busy = false;

        let write_pointer = self.regs.read(PARSER_VIDEO_WP);
        core.update_write_pointer(write_pointer);
        stream.add_data_size(data.len());
        log::debug!(
            "parser fed {} bytes, write pointer {:#010x}",
            data.len(),
            write_pointer
        );
        Ok(())
    }

    /// Aborts an in-flight fetch.
    pub fn cancel(&mut self) {
        if !self.busy {
            return;
        }
        self.regs.write(PARSER_FETCH_CMD, 0);
        self.regs.write(PARSER_CONTROL, CONTROL_RESET);
        self.regs.write(PARSER_INT_STATUS, 0xffff);
        self.busy = false;
        self.target = None;
    }

    /// Forgets the output stream buffer, so the next feed re-targets the parser.
    pub fn detach(&mut self, stream: &StreamBuffer) {
        if self.target == Some(stream.buffer().phys_base()) {
            self.cancel();
            self.target = None;
        }
    }
}
