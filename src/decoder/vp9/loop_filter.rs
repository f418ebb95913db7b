// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Deblocking filter tables.
//!
//! The deblocking unit takes a table of filter limits for every filter level and a table of the
//! filter level to apply per segment, reference frame and prediction mode.

use crate::codec::vp9::LoopFilterParams;
use crate::codec::vp9::MAX_MODE_LF_DELTAS;
use crate::codec::vp9::MAX_REF_LF_DELTAS;
use crate::mmio::RegisterBanks;
use crate::registers::hevc::HEVC_DBLK_CFG9;
use crate::registers::hevc::HEVC_DBLK_CFGA;
use crate::registers::hevc::HEVC_DBLK_CFGB;

pub const MAX_LOOP_FILTER: usize = 63;
pub const MAX_SEGMENTS: usize = 8;
const INTRA_FRAME: usize = 0;

/// VP9 mode, with the filter level table in use.
const DBLK_CFGB_VP9: u32 = 0x4040_0001;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterLimits {
    pub lim: u8,
    pub mblim: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopFilterTables {
    pub limits: [FilterLimits; MAX_LOOP_FILTER + 1],
    /// Filter level by reference frame and mode delta. Segments all use the same levels as
    /// segmentation is not used.
    pub levels: [[u8; MAX_MODE_LF_DELTAS]; MAX_REF_LF_DELTAS],
}

fn limits_for(sharpness: u8) -> [FilterLimits; MAX_LOOP_FILTER + 1] {
    let mut limits = [FilterLimits::default(); MAX_LOOP_FILTER + 1];
    let shift = (sharpness > 0) as u32 + (sharpness > 4) as u32;
    for (level, limit) in limits.iter_mut().enumerate() {
        let mut inside = (level as u32) >> shift;
        if sharpness > 0 && inside > 9 - sharpness as u32 {
            inside = 9 - sharpness as u32;
        }
        let inside = inside.max(1);
        limit.lim = inside as u8;
        limit.mblim = (2 * (level as u32 + 2) + inside) as u8;
    }
    limits
}

impl LoopFilterTables {
    pub fn new(params: &LoopFilterParams) -> Self {
        let base = params.level as i32;
        let mut levels = [[params.level; MAX_MODE_LF_DELTAS]; MAX_REF_LF_DELTAS];

        if params.delta_enabled {
            let scale = 1 << (base >> 5);
            let clamp = |l: i32| l.clamp(0, MAX_LOOP_FILTER as i32) as u8;
            let intra = clamp(base + params.ref_deltas[INTRA_FRAME] as i32 * scale);
            levels[INTRA_FRAME] = [intra; MAX_MODE_LF_DELTAS];
            for (reference, modes) in levels.iter_mut().enumerate().skip(1) {
                for (mode, level) in modes.iter_mut().enumerate() {
                    *level = clamp(
                        base + params.ref_deltas[reference] as i32 * scale
                            + params.mode_deltas[mode] as i32 * scale,
                    );
                }
            }
        }

        Self {
            limits: limits_for(params.sharpness),
            levels,
        }
    }

    /// Writes both tables to the deblocking unit.
    pub fn program(&self, regs: &RegisterBanks) {
        for pair in self.limits.chunks(2) {
            let entry = |l: &FilterLimits| (((l.lim & 0x3f) as u32) << 8) | l.mblim as u32;
            regs.write(HEVC_DBLK_CFG9, (entry(&pair[1]) << 16) | entry(&pair[0]));
        }

        for _ in 0..MAX_SEGMENTS {
            for refs in self.levels.chunks(2) {
                let word = refs[0][0] as u32
                    | (refs[0][1] as u32) << 8
                    | (refs[1][0] as u32) << 16
                    | (refs[1][1] as u32) << 24;
                regs.write(HEVC_DBLK_CFGA, word);
            }
        }
        regs.write(HEVC_DBLK_CFGB, DBLK_CFGB_VP9);
    }
}
