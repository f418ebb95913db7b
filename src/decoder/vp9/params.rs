// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame parameters the firmware reports through the RPM buffer.

use anyhow::anyhow;
use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::codec::vp9::FrameType;
use crate::codec::vp9::LoopFilterParams;
use crate::codec::vp9::MAX_MODE_LF_DELTAS;
use crate::codec::vp9::MAX_REF_LF_DELTAS;
use crate::codec::vp9::NUM_REF_FRAMES;
use crate::codec::vp9::REFS_PER_FRAME;
use crate::Resolution;

/// Size of the RPM buffer the firmware dumps the parsed header to.
pub const RPM_BUFFER_SIZE: usize = 0x400;

/// Word indices in the RPM buffer. Each word is a little-endian u16.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RpmWord {
    Profile = 0,
    ShowExistingFrame = 1,
    FrameToShow = 2,
    FrameType = 3,
    ShowFrame = 4,
    ErrorResilientMode = 5,
    IntraOnly = 6,
    RefreshFrameFlags = 7,
    Width = 8,
    Height = 9,
    RenderWidth = 10,
    RenderHeight = 11,
    /// Reference slot of the three references, 4 bits each.
    RefInfo = 12,
    RefSignBias = 13,
    FilterLevel = 14,
    Sharpness = 15,
    ModeRefDeltaEnabled = 16,
    RefDeltas = 17,
    ModeDeltas = 21,
    BitDepth = 23,
}

pub const RPM_WORDS: usize = 24;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HardwareRenderParams {
    pub profile: u8,
    pub show_existing_frame: bool,
    pub frame_to_show: u8,
    pub frame_type: FrameType,
    pub show_frame: bool,
    pub error_resilient: bool,
    pub intra_only: bool,
    pub refresh_frame_flags: u8,
    pub width: u32,
    pub height: u32,
    pub render_width: u32,
    pub render_height: u32,
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    pub ref_frame_sign_bias: [bool; REFS_PER_FRAME],
    pub loop_filter: LoopFilterParams,
    pub bit_depth: u8,
}

impl HardwareRenderParams {
    pub fn parse(rpm: &[u8]) -> anyhow::Result<Self> {
        if rpm.len() < RPM_WORDS * 2 {
            return Err(anyhow!("RPM dump of {} bytes is too short", rpm.len()));
        }
        let word = |w: RpmWord| LittleEndian::read_u16(&rpm[w as usize * 2..]);
        let word_at = |w: RpmWord, i: usize| LittleEndian::read_u16(&rpm[(w as usize + i) * 2..]);

        let frame_type = FrameType::n(word(RpmWord::FrameType) as u8)
            .ok_or_else(|| anyhow!("invalid frame type {}", word(RpmWord::FrameType)))?;
        let frame_to_show = word(RpmWord::FrameToShow) as u8;
        if frame_to_show as usize >= NUM_REF_FRAMES {
            return Err(anyhow!("invalid frame to show {}", frame_to_show));
        }

        let ref_info = word(RpmWord::RefInfo);
        let sign_bias = word(RpmWord::RefSignBias);
        let mut ref_frame_idx = [0; REFS_PER_FRAME];
        let mut ref_frame_sign_bias = [false; REFS_PER_FRAME];
        for i in 0..REFS_PER_FRAME {
            ref_frame_idx[i] = ((ref_info >> (4 * i)) & 0x7) as u8;
            ref_frame_sign_bias[i] = sign_bias & (1 << i) != 0;
        }

        let mut loop_filter = LoopFilterParams {
            level: word(RpmWord::FilterLevel) as u8 & 0x3f,
            sharpness: word(RpmWord::Sharpness) as u8 & 0x7,
            delta_enabled: word(RpmWord::ModeRefDeltaEnabled) != 0,
            ..Default::default()
        };
        for i in 0..MAX_REF_LF_DELTAS {
            loop_filter.ref_deltas[i] = word_at(RpmWord::RefDeltas, i) as i16 as i8;
        }
        for i in 0..MAX_MODE_LF_DELTAS {
            loop_filter.mode_deltas[i] = word_at(RpmWord::ModeDeltas, i) as i16 as i8;
        }

        let params = Self {
            profile: word(RpmWord::Profile) as u8,
            show_existing_frame: word(RpmWord::ShowExistingFrame) != 0,
            frame_to_show,
            frame_type,
            show_frame: word(RpmWord::ShowFrame) != 0,
            error_resilient: word(RpmWord::ErrorResilientMode) != 0,
            intra_only: word(RpmWord::IntraOnly) != 0,
            refresh_frame_flags: word(RpmWord::RefreshFrameFlags) as u8,
            width: word(RpmWord::Width) as u32,
            height: word(RpmWord::Height) as u32,
            render_width: word(RpmWord::RenderWidth) as u32,
            render_height: word(RpmWord::RenderHeight) as u32,
            ref_frame_idx,
            ref_frame_sign_bias,
            loop_filter,
            bit_depth: word(RpmWord::BitDepth) as u8,
        };
        if !params.show_existing_frame && (params.width == 0 || params.height == 0) {
            return Err(anyhow!("invalid frame size {}x{}", params.width, params.height));
        }
        if params.bit_depth != 8 {
            return Err(anyhow!("unsupported bit depth {}", params.bit_depth));
        }
        Ok(params)
    }

    pub fn is_intra(&self) -> bool {
        self.frame_type == FrameType::KeyFrame || self.intra_only
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }

    /// Serializes the parameters the way the firmware lays them out.
    #[cfg(test)]
    pub fn to_rpm(&self) -> Vec<u8> {
        let mut words = [0u16; RPM_WORDS];
        words[RpmWord::Profile as usize] = self.profile as u16;
        words[RpmWord::ShowExistingFrame as usize] = self.show_existing_frame as u16;
        words[RpmWord::FrameToShow as usize] = self.frame_to_show as u16;
        words[RpmWord::FrameType as usize] = self.frame_type as u16;
        words[RpmWord::ShowFrame as usize] = self.show_frame as u16;
        words[RpmWord::ErrorResilientMode as usize] = self.error_resilient as u16;
        words[RpmWord::IntraOnly as usize] = self.intra_only as u16;
        words[RpmWord::RefreshFrameFlags as usize] = self.refresh_frame_flags as u16;
        words[RpmWord::Width as usize] = self.width as u16;
        words[RpmWord::Height as usize] = self.height as u16;
        words[RpmWord::RenderWidth as usize] = self.render_width as u16;
        words[RpmWord::RenderHeight as usize] = self.render_height as u16;
        for i in 0..REFS_PER_FRAME {
            words[RpmWord::RefInfo as usize] |= (self.ref_frame_idx[i] as u16) << (4 * i);
            words[RpmWord::RefSignBias as usize] |= (self.ref_frame_sign_bias[i] as u16) << i;
        }
        words[RpmWord::FilterLevel as usize] = self.loop_filter.level as u16;
        words[RpmWord::Sharpness as usize] = self.loop_filter.sharpness as u16;
        words[RpmWord::ModeRefDeltaEnabled as usize] = self.loop_filter.delta_enabled as u16;
        for i in 0..MAX_REF_LF_DELTAS {
            words[RpmWord::RefDeltas as usize + i] = self.loop_filter.ref_deltas[i] as i16 as u16;
        }
        for i in 0..MAX_MODE_LF_DELTAS {
            words[RpmWord::ModeDeltas as usize + i] = self.loop_filter.mode_deltas[i] as i16 as u16;
        }
        words[RpmWord::BitDepth as usize] = self.bit_depth as u16;

        let mut rpm = vec![0u8; RPM_BUFFER_SIZE];
        LittleEndian::write_u16_into(&words, &mut rpm[..RPM_WORDS * 2]);
        rpm
    }
}
