// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use crate::engine::new_input_context;
use crate::engine::wait_dma_idle;
use crate::engine::CoreError;
use crate::engine::HardwareEngine;
use crate::engine::ImemDma;
use crate::engine::InputContext;
use crate::engine::SwapRegisters;
use crate::memory::BufferAllocator;
use crate::mmio::RegisterBanks;
use crate::registers::clock;
use crate::registers::dmc_regs;
use crate::registers::hevc::*;
use crate::registers::power;
use crate::secure::ProtectedUnit;
use crate::CoreKind;
use crate::SocKind;

const SWAP: SwapRegisters = SwapRegisters {
    addr: HEVC_STREAM_SWAP_ADDR,
    ctrl: HEVC_STREAM_SWAP_CTRL,
    enable: SWAP_ENABLE,
    save: SWAP_SAVE,
    busy: SWAP_BUSY,
};

const IMEM: ImemDma = ImemDma {
    ctrl: HEVC_IMEM_DMA_CTRL,
    addr: HEVC_IMEM_DMA_ADR,
    count: HEVC_IMEM_DMA_COUNT,
    start: IMEM_DMA_START,
    busy: IMEM_DMA_BUSY,
};

/// The HEVC core, which also decodes VP9.
pub struct HevcDec {
    regs: RegisterBanks,
    allocator: Arc<dyn BufferAllocator>,
    soc: SocKind,
    powered: bool,
}

impl HevcDec {
    pub fn new(regs: RegisterBanks, allocator: Arc<dyn BufferAllocator>, soc: SocKind) -> Self {
        Self {
            regs,
            allocator,
            soc,
            powered: false,
        }
    }

    fn fifo_start(&self) -> u32 {
        self.regs.read(HEVC_STREAM_START_ADDR)
    }
}

impl HardwareEngine for HevcDec {
    fn kind(&self) -> CoreKind {
        CoreKind::Hevc
    }

    fn is_powered(&self) -> bool {
        self.powered
    }

    fn power_on(&mut self) {
        if self.powered {
            return;
        }
        let regs = &self.regs;

        regs.clear_bits(power::AO_RTI_GEN_PWR_SLEEP0, power::SLEEP_HEVC);
        regs.write(DOS_SW_RESET3, 0xffff_ffff);
        regs.write(DOS_SW_RESET3, 0);
        regs.read(DOS_SW_RESET3);

        regs.set_bits(clock::HHI_GCLK_MPEG0, clock::GCLK_DOS);
        let divider = (clock::CLK_ENABLE | clock::CLK_SOURCE_DIV4) << clock::HEVC_CLK_SHIFT;
        regs.update(clock::HHI_VDEC2_CLK_CNTL, 0xffff << clock::HEVC_CLK_SHIFT, divider);
        regs.write(DOS_GCLK_EN3, 0xffff_ffff);
        regs.write(DOS_MEM_PD_HEVC, 0);
        regs.clear_bits(power::AO_RTI_GEN_PWR_ISO0, power::ISO_HEVC);
        regs.set_bits(dmc_regs::DMC_REQ_CTRL, dmc_regs::REQ_HEVC);

        self.powered = true;
        log::debug!("HEVC powered on ({:?})", self.soc);
    }

    fn power_off(&mut self) {
        if !self.powered {
            return;
        }
        let regs = &self.regs;

        regs.clear_bits(dmc_regs::DMC_REQ_CTRL, dmc_regs::REQ_HEVC);
        regs.set_bits(power::AO_RTI_GEN_PWR_ISO0, power::ISO_HEVC);
        regs.write(DOS_MEM_PD_HEVC, 0xffff_ffff);
        regs.clear_bits(
            clock::HHI_VDEC2_CLK_CNTL,
            clock::CLK_ENABLE << clock::HEVC_CLK_SHIFT,
        );
        regs.set_bits(power::AO_RTI_GEN_PWR_SLEEP0, power::SLEEP_HEVC);

        self.powered = false;
        log::debug!("HEVC powered off");
    }

    fn load_firmware(&mut self, code: &[u8]) -> Result<(), CoreError> {
        if !self.powered {
            return Err(CoreError::PoweredOff(CoreKind::Hevc));
        }
        self.regs.write(HEVC_MPSR, 0);
        self.regs.write(HEVC_CPSR, 0);
        IMEM.load(&self.regs, self.allocator.as_ref(), code)
    }

    fn initialize_stream_input(&mut self, use_parser: bool, addr: u32, size: u32) {
        let regs = &self.regs;

        regs.clear_bits(HEVC_STREAM_CONTROL, STREAM_FETCH_ENABLE);
        regs.write(HEVC_STREAM_START_ADDR, addr);
        regs.write(HEVC_STREAM_END_ADDR, addr + size - 8);
        regs.write(HEVC_STREAM_RD_PTR, addr);
        regs.write(HEVC_STREAM_WR_PTR, addr);

        let mut control = STREAM_ENDIAN;
        if use_parser {
            control |= STREAM_FROM_PARSER;
        }
        regs.write(HEVC_STREAM_CONTROL, control);
        regs.set_bits(HEVC_STREAM_FIFO_CTL, STREAM_FIFO_HOLE);
    }

    fn initialize_direct_input(&mut self) {
        self.regs
            .update(HEVC_STREAM_CONTROL, STREAM_FROM_PARSER | STREAM_FETCH_ENABLE, STREAM_FETCH_ENABLE);
    }

    fn update_write_pointer(&mut self, addr: u32) {
        self.regs.write(HEVC_STREAM_WR_PTR, addr);
        self.regs.set_bits(HEVC_STREAM_CONTROL, STREAM_FETCH_ENABLE);
    }

    fn get_stream_input_offset(&self) -> u32 {
        self.regs
            .read(HEVC_STREAM_WR_PTR)
            .wrapping_sub(self.fifo_start())
    }

    fn get_read_offset(&self) -> u32 {
        self.regs
            .read(HEVC_STREAM_RD_PTR)
            .wrapping_sub(self.fifo_start())
    }

    fn start_decoding(&mut self) {
        self.regs.write(HEVC_MPSR, 1);
    }

    fn stop_decoding(&mut self) {
        if !self.powered {
            return;
        }
        self.regs.write(HEVC_MPSR, 0);
        self.regs.write(HEVC_CPSR, 0);
    }

    fn wait_for_idle(&mut self) -> Result<(), CoreError> {
        wait_dma_idle(
            &self.regs,
            &[
                (HEVC_IMEM_DMA_CTRL, IMEM_DMA_BUSY),
                (HEVC_LMEM_DMA_CTRL, DMA_BUSY),
            ],
        )
    }

    fn initialize_input_context(&mut self, is_secure: bool) -> Result<InputContext, CoreError> {
        new_input_context(self.allocator.as_ref(), is_secure, ProtectedUnit::Hevc)
    }

    fn save_input_context(&mut self, context: &mut InputContext) -> Result<(), CoreError> {
        SWAP.save(&self.regs, &context.buffer)?;
        context.processed_video = self.get_read_offset();
        Ok(())
    }

    fn restore_input_context(&mut self, context: &InputContext) -> Result<(), CoreError> {
        SWAP.restore(&self.regs, &context.buffer)
    }
}
