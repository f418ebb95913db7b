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
use crate::registers::power;
use crate::registers::vdec1::*;
use crate::secure::ProtectedUnit;
use crate::CoreKind;

const SWAP: SwapRegisters = SwapRegisters {
    addr: VLD_MEM_SWAP_ADDR,
    ctrl: VLD_MEM_SWAP_CTRL,
    enable: SWAP_ENABLE,
    save: SWAP_SAVE,
    busy: SWAP_BUSY,
};

const IMEM: ImemDma = ImemDma {
    ctrl: IMEM_DMA_CTRL,
    addr: IMEM_DMA_ADR,
    count: IMEM_DMA_COUNT,
    start: IMEM_DMA_START,
    busy: IMEM_DMA_BUSY,
};

/// The general purpose decoder core.
pub struct Vdec1 {
    regs: RegisterBanks,
    allocator: Arc<dyn BufferAllocator>,
    powered: bool,
}

impl Vdec1 {
    pub fn new(regs: RegisterBanks, allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            regs,
            allocator,
            powered: false,
        }
    }

    fn fifo_start(&self) -> u32 {
        self.regs.read(VLD_MEM_VIFIFO_START_PTR)
    }
}

impl HardwareEngine for Vdec1 {
    fn kind(&self) -> CoreKind {
        CoreKind::Vdec1
    }

    fn is_powered(&self) -> bool {
        self.powered
    }

    fn power_on(&mut self) {
        if self.powered {
            return;
        }
        let regs = &self.regs;

        regs.clear_bits(power::AO_RTI_GEN_PWR_SLEEP0, power::SLEEP_VDEC1);
        regs.write(DOS_SW_RESET0, RESET_ALL);
        regs.write(DOS_SW_RESET0, 0);
        regs.read(DOS_SW_RESET0);

        regs.set_bits(clock::HHI_GCLK_MPEG0, clock::GCLK_DOS);
        regs.update(
            clock::HHI_VDEC_CLK_CNTL,
            0xffff,
            clock::CLK_ENABLE | clock::CLK_SOURCE_DIV4,
        );
        regs.write(DOS_GCLK_EN0, 0x3ff);
        regs.write(DOS_MEM_PD_VDEC, 0);
        regs.clear_bits(power::AO_RTI_GEN_PWR_ISO0, power::ISO_VDEC1);
        regs.write(DOS_VDEC_MCRCC_STALL_CTRL, 0);
        regs.set_bits(dmc_regs::DMC_REQ_CTRL, dmc_regs::REQ_VDEC);
        regs.clear_bits(MDEC_PIC_DC_CTRL, 1 << 31);

        self.powered = true;
        log::debug!("VDEC1 powered on");
    }

    fn power_off(&mut self) {
        if !self.powered {
            return;
        }
        let regs = &self.regs;

        regs.clear_bits(dmc_regs::DMC_REQ_CTRL, dmc_regs::REQ_VDEC);
        regs.set_bits(power::AO_RTI_GEN_PWR_ISO0, power::ISO_VDEC1);
        regs.write(DOS_MEM_PD_VDEC, 0xffff_ffff);
        regs.clear_bits(clock::HHI_VDEC_CLK_CNTL, clock::CLK_ENABLE);
        regs.set_bits(power::AO_RTI_GEN_PWR_SLEEP0, power::SLEEP_VDEC1);

        self.powered = false;
        log::debug!("VDEC1 powered off");
    }

    fn load_firmware(&mut self, code: &[u8]) -> Result<(), CoreError> {
        if !self.powered {
            return Err(CoreError::PoweredOff(CoreKind::Vdec1));
        }
        self.regs.write(MPSR, 0);
        self.regs.write(CPSR, 0);
        IMEM.load(&self.regs, self.allocator.as_ref(), code)
    }

    fn initialize_stream_input(&mut self, use_parser: bool, addr: u32, size: u32) {
        let regs = &self.regs;

        regs.write(VLD_MEM_VIFIFO_CONTROL, 0);
        regs.write(VLD_MEM_VIFIFO_START_PTR, addr);
        regs.write(VLD_MEM_VIFIFO_CURR_PTR, addr);
        regs.write(VLD_MEM_VIFIFO_END_PTR, addr + size - 8);
        regs.write(VLD_MEM_VIFIFO_CONTROL, VIFIFO_INIT);
        regs.write(VLD_MEM_VIFIFO_CONTROL, 0);
        regs.write(VLD_MEM_VIFIFO_BUF_CNTL, VIFIFO_BUF_MANUAL);
        regs.write(VLD_MEM_VIFIFO_WP, addr);
        regs.write(VLD_MEM_VIFIFO_RP, addr);
        regs.write(VLD_MEM_VIFIFO_BUF_CNTL, VIFIFO_BUF_MANUAL | VIFIFO_BUF_INIT);
        regs.write(VLD_MEM_VIFIFO_BUF_CNTL, VIFIFO_BUF_MANUAL);

        let mut control =
            VIFIFO_FILL_EN | VIFIFO_EMPTY_EN | VIFIFO_UPPER_ENDIAN | VIFIFO_FILL_ON_LEVEL;
        if use_parser {
            control &= !VIFIFO_FILL_ON_LEVEL;
        }
        regs.write(VLD_MEM_VIFIFO_CONTROL, control);
    }

    fn initialize_direct_input(&mut self) {
        self.regs
            .write(VLD_MEM_VIFIFO_BUF_CNTL, VIFIFO_BUF_MANUAL | VIFIFO_BUF_INIT);
        self.regs.write(VLD_MEM_VIFIFO_BUF_CNTL, VIFIFO_BUF_MANUAL);
    }

    fn update_write_pointer(&mut self, addr: u32) {
        self.regs.write(VLD_MEM_VIFIFO_WP, addr);
        self.regs
            .set_bits(VLD_MEM_VIFIFO_CONTROL, VIFIFO_FILL_EN | VIFIFO_EMPTY_EN);
    }

    fn get_stream_input_offset(&self) -> u32 {
        self.regs.read(VLD_MEM_VIFIFO_WP).wrapping_sub(self.fifo_start())
    }

    fn get_read_offset(&self) -> u32 {
        self.regs.read(VLD_MEM_VIFIFO_RP).wrapping_sub(self.fifo_start())
    }

    fn start_decoding(&mut self) {
        self.regs.write(DOS_SW_RESET0, RESET_DECODER);
        self.regs.write(DOS_SW_RESET0, 0);
        self.regs.read(DOS_SW_RESET0);
        self.regs.write(POWER_CTL_VLD, 1 << 4);
        self.regs.write(MPSR, 1);
    }

    fn stop_decoding(&mut self) {
        if !self.powered {
            return;
        }
        self.regs.write(MPSR, 0);
        self.regs.write(CPSR, 0);
    }

    fn wait_for_idle(&mut self) -> Result<(), CoreError> {
        wait_dma_idle(
            &self.regs,
            &[
                (IMEM_DMA_CTRL, IMEM_DMA_BUSY),
                (LMEM_DMA_CTRL, DMA_BUSY),
                (DCAC_DMA_CTRL, DMA_BUSY),
            ],
        )
    }

    fn initialize_input_context(&mut self, is_secure: bool) -> Result<InputContext, CoreError> {
        new_input_context(self.allocator.as_ref(), is_secure, ProtectedUnit::Vdec)
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
