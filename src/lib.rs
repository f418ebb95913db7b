// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware video decoder engine for Amlogic-style SoCs.
//!
//! The engine owns the two physical decode pipelines of the SoC (the general purpose VDEC1 core
//! and the HEVC core) and time-multiplexes any number of decode sessions onto them. Each session
//! is backed by a codec state machine (H.264, multi-stream H.264 or VP9) that programs the
//! hardware in response to its interrupts.
//!
//! The entry point is [`device::VideoEngine`], which is built from the platform resources
//! (register banks, interrupts, secure-world channels) and a [`memory::BufferAllocator`].

pub mod canvas;
pub mod codec;
pub mod decoder;
pub mod device;
pub mod engine;
pub mod firmware;
pub mod frame;
pub mod instance;
pub mod irq;
pub mod memory;
pub mod mmio;
pub mod parser;
pub mod pts;
pub mod registers;
pub mod scheduler;
pub mod secure;
pub mod stream_buffer;

#[cfg(test)]
mod dummy;

use std::str::FromStr;

pub use device::EngineConfig;
pub use device::VideoEngine;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Size in bytes of an NV12 image of this resolution with rows of `stride` bytes.
    pub fn nv12_size(&self, stride: u32) -> usize {
        let luma = stride as usize * self.height as usize;
        luma + luma / 2
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Codec state machines this engine can run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// H.264 in single-stream mode. The session keeps its core until it is destroyed.
    H264,
    /// H.264 in multi-stream mode, which can be swapped in and out at frame boundaries.
    H264Multi,
    /// VP9, multi-stream capable.
    Vp9,
}

impl CodecKind {
    /// The physical core that decodes this codec.
    pub fn core(&self) -> CoreKind {
        match self {
            CodecKind::H264 | CodecKind::H264Multi => CoreKind::Vdec1,
            CodecKind::Vp9 => CoreKind::Hevc,
        }
    }

    /// Whether input for this codec is queued per frame and handed to the hardware only while
    /// the session is current.
    pub fn is_multi_stream(&self) -> bool {
        !matches!(self, CodecKind::H264)
    }
}

impl FromStr for CodecKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(CodecKind::H264),
            "h264-multi" | "H264Multi" => Ok(CodecKind::H264Multi),
            "vp9" | "VP9" => Ok(CodecKind::Vp9),
            _ => Err("unrecognized codec. Valid values: h264, h264-multi, vp9"),
        }
    }
}

/// The two physical decode pipelines.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoreKind {
    Vdec1,
    Hevc,
}

impl CoreKind {
    pub const ALL: [CoreKind; 2] = [CoreKind::Vdec1, CoreKind::Hevc];

    pub(crate) fn index(&self) -> usize {
        match self {
            CoreKind::Vdec1 => 0,
            CoreKind::Hevc => 1,
        }
    }
}

/// SoC families. The family selects firmware images and a few register layouts.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SocKind {
    Gxm,
    #[default]
    G12a,
    G12b,
    Sm1,
}

impl SocKind {
    /// G12 and later parts carry the newer HEVC core.
    pub fn is_g12_or_later(&self) -> bool {
        !matches!(self, SocKind::Gxm)
    }
}

impl FromStr for SocKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gxm" | "GXM" => Ok(SocKind::Gxm),
            "g12a" | "G12A" => Ok(SocKind::G12a),
            "g12b" | "G12B" => Ok(SocKind::G12b),
            "sm1" | "SM1" => Ok(SocKind::Sm1),
            _ => Err("unrecognized SoC. Valid values: gxm, g12a, g12b, sm1"),
        }
    }
}

/// Extends a 32-bit hardware counter into the 64-bit value closest to `previous`.
pub(crate) fn extend_bits(value: u32, previous: u64) -> u64 {
    let candidate = (previous & !0xffff_ffff) | value as u64;
    if candidate + (1 << 31) < previous {
        candidate + (1 << 32)
    } else if candidate > previous + (1 << 31) && candidate >= (1 << 32) {
        candidate - (1 << 32)
    } else {
        candidate
    }
}
