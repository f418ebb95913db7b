// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-frame programming of the HEVC core for a VP9 frame.

use crate::codec::vp9::REFS_PER_FRAME;
use crate::decoder::vp9::loop_filter::LoopFilterTables;
use crate::decoder::vp9::Vp9Frame;
use crate::decoder::vp9::COMMAND_DECODE_SLICE;
use crate::decoder::vp9::DEC_STATUS;
use crate::memory::Buffer;
use crate::mmio::RegisterBanks;
use crate::registers::hevc::*;

const REFERENCES: u8 = 1 << 0;
const MOTION_PREDICTION: u8 = 1 << 1;
const LOOP_FILTER: u8 = 1 << 2;
const OUTPUT: u8 = 1 << 3;
const ALL: u8 = REFERENCES | MOTION_PREDICTION | LOOP_FILTER | OUTPUT;

/// Fixed point precision of the reference scaling ratios.
const REF_SCALE_SHIFT: u32 = 14;

/// `HEVC_MPRED_CTRL4` bit to use the motion vectors of the previous frame.
const MPRED_USE_PREV_MVS: u32 = 1 << 6;
/// `HEVCD_MPP_ANC_CANVAS_ACCCONFIG_ADDR` auto-increment.
const CANVAS_AUTO_INCREMENT: u32 = 1 << 0;
/// `HEVCD_MPP_REFINFO_TBL_ACCCONFIG` auto-increment.
const REFINFO_AUTO_INCREMENT: u32 = 1 << 2;

/// Registers of one frame, written section by section before the decode command.
///
/// Every section must be programmed exactly once before [`FrameProgram::commit`].
pub struct FrameProgram<'a> {
    regs: &'a RegisterBanks,
    done: u8,
}

impl<'a> FrameProgram<'a> {
    pub fn new(regs: &'a RegisterBanks) -> Self {
        Self { regs, done: 0 }
    }

    fn mark(&mut self, section: u8) {
        assert!(self.done & section == 0, "section {:#x} programmed twice", section);
        self.done |= section;
    }

    /// Canvases and scaling ratios of the reference frames. `refs` is empty for intra frames.
    pub fn references(
        &mut self,
        target: &Vp9Frame,
        refs: &[Option<&Vp9Frame>; REFS_PER_FRAME],
    ) -> &mut Self {
        self.mark(REFERENCES);
        let regs = self.regs;

        regs.write(HEVCD_MPP_ANC_CANVAS_ACCCONFIG_ADDR, CANVAS_AUTO_INCREMENT);
        for reference in refs {
            let frame = reference.unwrap_or(target);
            let y = frame.canvases.y.index() as u32;
            let uv = frame.canvases.uv.index() as u32;
            regs.write(HEVCD_MPP_ANC_CANVAS_DATA_ADDR, (uv << 16) | (uv << 8) | y);
        }

        regs.write(HEVCD_MPP_REFINFO_TBL_ACCCONFIG, REFINFO_AUTO_INCREMENT);
        for reference in refs {
            let frame = reference.unwrap_or(target);
            let x_scale = (frame.resolution.width << REF_SCALE_SHIFT) / target.resolution.width;
            let y_scale = (frame.resolution.height << REF_SCALE_SHIFT) / target.resolution.height;
            regs.write(HEVCD_MPP_REFINFO_DATA, frame.resolution.width);
            regs.write(HEVCD_MPP_REFINFO_DATA, frame.resolution.height);
            regs.write(HEVCD_MPP_REFINFO_DATA, x_scale);
            regs.write(HEVCD_MPP_REFINFO_DATA, y_scale);
            regs.write(HEVCD_MPP_REFINFO_DATA, frame.stride >> 5);
        }
        self
    }

    /// Motion vector buffers: `current` receives the vectors of this frame, `previous` holds those
    /// of the last frame when they may be used for prediction.
    pub fn motion_prediction(&mut self, current: &Buffer, previous: Option<&Buffer>) -> &mut Self {
        self.mark(MOTION_PREDICTION);
        let regs = self.regs;

        regs.write(HEVC_MPRED_MV_WR_START_ADDR, current.phys_base());
        regs.write(HEVC_MPRED_MV_WPTR, current.phys_base());
        let read = previous.unwrap_or(current);
        regs.write(HEVC_MPRED_MV_RD_START_ADDR, read.phys_base());
        regs.write(HEVC_MPRED_MV_RPTR, read.phys_base());
        regs.write(HEVC_MPRED_MV_RD_END_ADDR, read.phys_end());
        if previous.is_some() {
            regs.set_bits(HEVC_MPRED_CTRL4, MPRED_USE_PREV_MVS);
        } else {
            regs.clear_bits(HEVC_MPRED_CTRL4, MPRED_USE_PREV_MVS);
        }
        self
    }

    pub fn loop_filter(&mut self, tables: &LoopFilterTables) -> &mut Self {
        self.mark(LOOP_FILTER);
        tables.program(self.regs);
        self
    }

    /// Where the SAO unit writes the decoded picture.
    pub fn output(&mut self, frame: &Vp9Frame) -> &mut Self {
        self.mark(OUTPUT);
        let regs = self.regs;

        let base = frame.buffer.phys_base();
        let luma = frame.stride * frame.resolution.height;
        regs.write(HEVC_SAO_Y_START_ADDR, base);
        regs.write(HEVC_SAO_Y_WPTR, base);
        regs.write(HEVC_SAO_Y_LENGTH, luma);
        regs.write(HEVC_SAO_C_START_ADDR, base + luma);
        regs.write(HEVC_SAO_C_WPTR, base + luma);
        regs.write(HEVC_SAO_C_LENGTH, luma / 2);
        regs.write(
            HEVC_PARSER_PICTURE_SIZE,
            (frame.resolution.height << 16) | frame.resolution.width,
        );
        self
    }

    /// Issues the decode command.
    ///
    /// # Panics
    ///
    /// Panics if a section was not programmed.
    pub fn commit(self) {
        assert_eq!(
            self.done, ALL,
            "frame programmed without all of its sections ({:#x})",
            self.done
        );
        self.regs.write(DEC_STATUS, COMMAND_DECODE_SLICE);
    }
}
