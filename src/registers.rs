// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Register map of the video decoder block.

use crate::mmio::Bank;
use crate::mmio::Register;

const fn dos(index: u32) -> Register {
    Register::new(Bank::Dosbus, index)
}

const fn ao(index: u32) -> Register {
    Register::new(Bank::Aobus, index)
}

const fn hiu(index: u32) -> Register {
    Register::new(Bank::Hiubus, index)
}

const fn dmc(index: u32) -> Register {
    Register::new(Bank::Dmc, index)
}

const fn cbus(index: u32) -> Register {
    Register::new(Bank::Cbus, index)
}

/// Power domains and isolation.
pub mod power {
    use super::*;

    pub const AO_RTI_GEN_PWR_SLEEP0: Register = ao(0x3a);
    pub const AO_RTI_GEN_PWR_ISO0: Register = ao(0x3b);

    pub const SLEEP_VDEC1: u32 = 0x3 << 2;
    pub const SLEEP_HEVC: u32 = 0x3 << 6;
    pub const ISO_VDEC1: u32 = 0x3 << 6;
    pub const ISO_HEVC: u32 = 0x3 << 10;
}

/// Clock gates and dividers.
pub mod clock {
    use super::*;

    pub const HHI_GCLK_MPEG0: Register = hiu(0x50);
    pub const HHI_VDEC_CLK_CNTL: Register = hiu(0x78);
    pub const HHI_VDEC2_CLK_CNTL: Register = hiu(0x79);

    /// Gate of the whole DOS block in `HHI_GCLK_MPEG0`.
    pub const GCLK_DOS: u32 = 1 << 1;
    /// Enable bit of a clock divider, the divider and source fields sitting below it.
    pub const CLK_ENABLE: u32 = 1 << 8;
    /// fclk_div4 as source, divided by 1.
    pub const CLK_SOURCE_DIV4: u32 = 0x1 << 9;
    /// HEVC divider fields live in the high half of `HHI_VDEC2_CLK_CNTL`.
    pub const HEVC_CLK_SHIFT: u32 = 16;
}

/// Memory controller: canvas lookup table and DMA request gating.
pub mod dmc_regs {
    use super::*;

    pub const DMC_REQ_CTRL: Register = dmc(0x0);
    pub const DMC_CAV_LUT_DATAL: Register = dmc(0x12);
    pub const DMC_CAV_LUT_DATAH: Register = dmc(0x13);
    pub const DMC_CAV_LUT_ADDR: Register = dmc(0x14);
    pub const DMC_CAV_LUT_RDATAL: Register = dmc(0x15);

    pub const REQ_VDEC: u32 = 1 << 13;
    pub const REQ_HEVC: u32 = 1 << 4;
    pub const CAV_LUT_WRITE: u32 = 1 << 9;
}

/// DOS registers shared by both cores, and the VDEC1 core.
pub mod vdec1 {
    use super::*;

    pub const MPSR: Register = dos(0x301);
    pub const CPSR: Register = dos(0x321);
    pub const IMEM_DMA_CTRL: Register = dos(0x340);
    pub const IMEM_DMA_ADR: Register = dos(0x341);
    pub const IMEM_DMA_COUNT: Register = dos(0x342);
    pub const LMEM_DMA_CTRL: Register = dos(0x350);

    pub const VDEC_ASSIST_MBOX1_IRQ_REG: Register = dos(0x74);
    pub const VDEC_ASSIST_MBOX1_CLR_REG: Register = dos(0x75);
    pub const VDEC_ASSIST_MBOX1_MASK: Register = dos(0x76);

    pub const PSCALE_CTRL: Register = dos(0x911);
    pub const MDEC_PIC_DC_CTRL: Register = dos(0x98e);
    pub const MDEC_PIC_DC_STATUS: Register = dos(0x98f);
    /// First of the canvas index registers of the H.264 reference frames.
    pub const ANC0_CANVAS_ADDR: Register = dos(0x990);
    pub const AV_SCRATCH_0: Register = dos(0x9c0);
    pub const DCAC_DMA_CTRL: Register = dos(0xe12);

    pub const POWER_CTL_VLD: Register = dos(0xc08);
    pub const VLD_MEM_VIFIFO_START_PTR: Register = dos(0xc40);
    pub const VLD_MEM_VIFIFO_CURR_PTR: Register = dos(0xc41);
    pub const VLD_MEM_VIFIFO_END_PTR: Register = dos(0xc42);
    pub const VLD_MEM_VIFIFO_CONTROL: Register = dos(0xc44);
    pub const VLD_MEM_VIFIFO_WP: Register = dos(0xc45);
    pub const VLD_MEM_VIFIFO_RP: Register = dos(0xc46);
    pub const VLD_MEM_VIFIFO_LEVEL: Register = dos(0xc47);
    pub const VLD_MEM_VIFIFO_BUF_CNTL: Register = dos(0xc48);
    pub const VLD_MEM_VIFIFO_WRAP_COUNT: Register = dos(0xc51);
    pub const VLD_MEM_SWAP_ADDR: Register = dos(0xc55);
    pub const VLD_MEM_SWAP_CTRL: Register = dos(0xc56);

    pub const DOS_SW_RESET0: Register = dos(0x3f00);
    pub const DOS_GCLK_EN0: Register = dos(0x3f01);
    pub const DOS_MEM_PD_VDEC: Register = dos(0x3f30);
    pub const DOS_VDEC_MCRCC_STALL_CTRL: Register = dos(0x3f40);

    /// `IMEM_DMA_CTRL`: transfer in progress.
    pub const IMEM_DMA_BUSY: u32 = 1 << 15;
    pub const IMEM_DMA_START: u32 = IMEM_DMA_BUSY | (0x7 << 16);
    /// `LMEM_DMA_CTRL` and `DCAC_DMA_CTRL` busy bit.
    pub const DMA_BUSY: u32 = 1 << 15;

    /// `VLD_MEM_VIFIFO_CONTROL` fields.
    pub const VIFIFO_INIT: u32 = 1 << 0;
    pub const VIFIFO_FILL_EN: u32 = 1 << 1;
    pub const VIFIFO_EMPTY_EN: u32 = 1 << 2;
    pub const VIFIFO_UPPER_ENDIAN: u32 = 0x7 << 3;
    pub const VIFIFO_FILL_ON_LEVEL: u32 = 1 << 10;
    /// `VLD_MEM_VIFIFO_BUF_CNTL` fields.
    pub const VIFIFO_BUF_MANUAL: u32 = 1 << 1;
    pub const VIFIFO_BUF_INIT: u32 = 1 << 0;
    /// `VLD_MEM_SWAP_CTRL` fields.
    pub const SWAP_ENABLE: u32 = 1 << 0;
    pub const SWAP_SAVE: u32 = 1 << 1;
    pub const SWAP_BUSY: u32 = 1 << 7;

    /// `DOS_SW_RESET0` bits that reset the VLD and the firmware CPU.
    pub const RESET_DECODER: u32 = (1 << 12) | (1 << 11);
    pub const RESET_ALL: u32 = 0xffff_fffc;
}

/// The HEVC core.
pub mod hevc {
    use super::*;

    pub const HEVC_ASSIST_MBOX0_IRQ_REG: Register = dos(0x3070);
    pub const HEVC_ASSIST_MBOX0_CLR_REG: Register = dos(0x3071);
    pub const HEVC_ASSIST_MBOX0_MASK: Register = dos(0x3072);
    pub const HEVC_ASSIST_SCRATCH_0: Register = dos(0x30c0);

    pub const HEVC_STREAM_CONTROL: Register = dos(0x3101);
    pub const HEVC_STREAM_START_ADDR: Register = dos(0x3102);
    pub const HEVC_STREAM_END_ADDR: Register = dos(0x3103);
    pub const HEVC_STREAM_WR_PTR: Register = dos(0x3104);
    pub const HEVC_STREAM_RD_PTR: Register = dos(0x3105);
    pub const HEVC_STREAM_LEVEL: Register = dos(0x3106);
    pub const HEVC_STREAM_FIFO_CTL: Register = dos(0x3107);
    pub const HEVC_SHIFT_CONTROL: Register = dos(0x3108);
    pub const HEVC_SHIFT_STARTCODE: Register = dos(0x3109);
    pub const HEVC_SHIFT_EMULATECODE: Register = dos(0x310a);
    pub const HEVC_SHIFT_STATUS: Register = dos(0x310b);
    pub const HEVC_SHIFT_BYTE_COUNT: Register = dos(0x310d);
    pub const HEVC_CABAC_CONTROL: Register = dos(0x3110);
    pub const HEVC_PARSER_CORE_CONTROL: Register = dos(0x3113);
    pub const HEVC_PARSER_INT_CONTROL: Register = dos(0x3120);
    pub const HEVC_STREAM_SWAP_ADDR: Register = dos(0x3130);
    pub const HEVC_STREAM_SWAP_CTRL: Register = dos(0x3131);
    pub const HEVC_PARSER_PICTURE_SIZE: Register = dos(0x3188);
    pub const HEVC_MPSR: Register = dos(0x3301);
    pub const HEVC_CPSR: Register = dos(0x3321);
    pub const HEVC_IMEM_DMA_CTRL: Register = dos(0x3340);
    pub const HEVC_IMEM_DMA_ADR: Register = dos(0x3341);
    pub const HEVC_IMEM_DMA_COUNT: Register = dos(0x3342);
    pub const HEVC_LMEM_DMA_CTRL: Register = dos(0x3350);

    pub const HEVCD_IPP_TOP_CNTL: Register = dos(0x3400);
    pub const HEVCD_IPP_LINEBUFF_BASE: Register = dos(0x3409);
    pub const HEVCD_MPP_ANC2AXI_TBL_CONF_ADDR: Register = dos(0x3460);
    pub const HEVCD_MPP_ANC2AXI_TBL_DATA: Register = dos(0x3464);
    pub const HEVCD_MPP_ANC_CANVAS_ACCCONFIG_ADDR: Register = dos(0x34c0);
    pub const HEVCD_MPP_ANC_CANVAS_DATA_ADDR: Register = dos(0x34c1);
    pub const HEVCD_MPP_REFINFO_TBL_ACCCONFIG: Register = dos(0x34c2);
    pub const HEVCD_MPP_REFINFO_DATA: Register = dos(0x34c3);
    pub const HEVCD_MPP_DECOMP_CTL1: Register = dos(0x34c6);
    pub const HEVCD_MPP_DECOMP_CTL2: Register = dos(0x34c7);

    pub const HEVC_DBLK_CFG4: Register = dos(0x3504);
    pub const HEVC_DBLK_CFG5: Register = dos(0x3505);
    pub const HEVC_DBLK_CFG9: Register = dos(0x3509);
    pub const HEVC_DBLK_CFGA: Register = dos(0x350a);
    pub const HEVC_DBLK_CFGB: Register = dos(0x350b);

    pub const HEVC_MPRED_CTRL3: Register = dos(0x3203);
    pub const HEVC_MPRED_CTRL4: Register = dos(0x322d);
    pub const HEVC_MPRED_ABV_START_ADDR: Register = dos(0x3207);
    pub const HEVC_MPRED_MV_WR_START_ADDR: Register = dos(0x3208);
    pub const HEVC_MPRED_MV_RD_START_ADDR: Register = dos(0x3209);
    pub const HEVC_MPRED_MV_WPTR: Register = dos(0x320a);
    pub const HEVC_MPRED_MV_RPTR: Register = dos(0x320b);
    pub const HEVC_MPRED_MV_RD_END_ADDR: Register = dos(0x3221);

    pub const HEVC_SAO_CTRL1: Register = dos(0x3602);
    pub const HEVC_SAO_CTRL5: Register = dos(0x3619);
    pub const HEVC_SAO_Y_START_ADDR: Register = dos(0x360b);
    pub const HEVC_SAO_Y_LENGTH: Register = dos(0x360c);
    pub const HEVC_SAO_C_START_ADDR: Register = dos(0x360d);
    pub const HEVC_SAO_C_LENGTH: Register = dos(0x360e);
    pub const HEVC_SAO_Y_WPTR: Register = dos(0x360f);
    pub const HEVC_SAO_C_WPTR: Register = dos(0x3610);
    pub const HEVC_CM_HEADER_START_ADDR: Register = dos(0x3628);
    pub const HEVC_CM_BODY_START_ADDR: Register = dos(0x3626);
    pub const HEVC_CM_BODY_LENGTH: Register = dos(0x3627);
    pub const HEVC_CM_HEADER_LENGTH: Register = dos(0x3629);

    pub const DOS_SW_RESET3: Register = dos(0x3f34);
    pub const DOS_GCLK_EN3: Register = dos(0x3f35);
    pub const DOS_MEM_PD_HEVC: Register = dos(0x3f33);

    pub const RESET_HEVC: u32 = (1 << 3) | (1 << 4) | (1 << 8) | (1 << 11) | (1 << 12);
    /// `HEVC_STREAM_CONTROL` fields.
    pub const STREAM_FETCH_ENABLE: u32 = 1 << 0;
    pub const STREAM_ENDIAN: u32 = 0x7 << 4;
    pub const STREAM_FROM_PARSER: u32 = 1 << 3;
    /// `HEVC_STREAM_FIFO_CTL` field.
    pub const STREAM_FIFO_HOLE: u32 = 1 << 29;
    /// `HEVC_STREAM_SWAP_CTRL` fields, same layout as the VDEC1 swap engine.
    pub const SWAP_ENABLE: u32 = 1 << 0;
    pub const SWAP_SAVE: u32 = 1 << 1;
    pub const SWAP_BUSY: u32 = 1 << 7;
    pub const IMEM_DMA_BUSY: u32 = 1 << 15;
    pub const IMEM_DMA_START: u32 = IMEM_DMA_BUSY | (0x7 << 16);
    pub const DMA_BUSY: u32 = 1 << 15;
}

/// The elementary-stream parser.
pub mod parser {
    use super::*;

    pub const PARSER_CONTROL: Register = cbus(0x2960);
    pub const PARSER_FETCH_ADDR: Register = cbus(0x2961);
    pub const PARSER_FETCH_CMD: Register = cbus(0x2962);
    pub const PARSER_CONFIG: Register = cbus(0x2965);
    pub const PFIFO_WR_PTR: Register = cbus(0x2966);
    pub const PFIFO_RD_PTR: Register = cbus(0x2967);
    pub const PARSER_SEARCH_PATTERN: Register = cbus(0x2969);
    pub const PARSER_SEARCH_MASK: Register = cbus(0x296a);
    pub const PARSER_INT_ENABLE: Register = cbus(0x296b);
    pub const PARSER_INT_STATUS: Register = cbus(0x296c);
    pub const PARSER_ES_CONTROL: Register = cbus(0x2977);
    pub const PARSER_VIDEO_START_PTR: Register = cbus(0x2980);
    pub const PARSER_VIDEO_END_PTR: Register = cbus(0x2981);
    pub const PARSER_VIDEO_WP: Register = cbus(0x2982);
    pub const PARSER_VIDEO_RP: Register = cbus(0x2983);
    pub const PARSER_VIDEO_HOLE: Register = cbus(0x2990);

    pub const CONTROL_RESET: u32 = 1 << 0;
    pub const CONTROL_AUTOSEARCH: u32 = 1 << 2;
    pub const CONTROL_WRITE_ENDIAN: u32 = 0x7 << 8;
    pub const CONTROL_SEARCH_RESET: u32 = 1 << 4;
    /// Upper part of `PARSER_FETCH_CMD`; the length goes in the low 27 bits.
    pub const FETCH_CMD_START: u32 = 7 << 27;
    pub const FETCH_CMD_LEN_MASK: u32 = (1 << 27) - 1;
    pub const INT_FETCH_DONE: u32 = 1 << 6;
    pub const INT_START_CODE_FOUND: u32 = 1 << 0;
    pub const ES_VIDEO_TO_VDEC1: u32 = 0;
    pub const ES_VIDEO_TO_HEVC: u32 = 1 << 2;
    pub const CONFIG_PFIFO_EMPTY_CNT: u32 = 16 << 24;
}
