// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VP9 framing.
//!
//! The VP9 firmware wants one frame at a time, each prefixed with a 16-byte AML header, so
//! superframes must be split on the CPU. The decoder also peeks at the uncompressed header of
//! queued frames to know whether decoding them needs a free output frame.

use anyhow::anyhow;
use anyhow::Context;
use bitreader::BitReader;
use enumn::N;

use crate::Resolution;

pub const NUM_REF_FRAMES: usize = 8;
pub const REFS_PER_FRAME: usize = 3;
pub const MAX_REF_LF_DELTAS: usize = 4;
pub const MAX_MODE_LF_DELTAS: usize = 2;
pub const MAX_FRAMES_IN_SUPERFRAME: usize = 8;

const SUPERFRAME_MARKER: u8 = 0b110;
const FRAME_MARKER: u32 = 0x2;
const SYNC_CODE: u32 = 0x49_83_42;
const CS_RGB: u8 = 7;

/// Size of the header prepended to every frame fed to the firmware.
pub const AML_HEADER_SIZE: usize = 16;
const AML_MAGIC: &[u8; 4] = b"AMLV";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
#[repr(u8)]
pub enum FrameType {
    #[default]
    KeyFrame = 0,
    InterFrame = 1,
}

/// Where the dimensions of a frame come from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameSize {
    Explicit(Resolution),
    /// Same size as the frame in this reference slot.
    FromRef(u8),
}

impl Default for FrameSize {
    fn default() -> Self {
        FrameSize::Explicit(Default::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopFilterParams {
    pub level: u8,
    pub sharpness: u8,
    pub delta_enabled: bool,
    pub ref_deltas: [i8; MAX_REF_LF_DELTAS],
    pub mode_deltas: [i8; MAX_MODE_LF_DELTAS],
}

impl Default for LoopFilterParams {
    fn default() -> Self {
        Self {
            level: 0,
            sharpness: 0,
            delta_enabled: false,
            ref_deltas: [1, 0, -1, -1],
            mode_deltas: [0, 0],
        }
    }
}

/// The fields of a VP9 uncompressed header the engine cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub profile: u8,
    /// Slot of the frame to show again, for frames that only display an existing one.
    pub show_existing_frame: Option<u8>,
    pub frame_type: FrameType,
    pub show_frame: bool,
    pub error_resilient: bool,
    pub intra_only: bool,
    pub bit_depth: u8,
    pub refresh_frame_flags: u8,
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    pub ref_frame_sign_bias: [bool; REFS_PER_FRAME],
    pub size: FrameSize,
    pub render_size: Option<Resolution>,
    pub loop_filter: LoopFilterParams,
    pub base_q_idx: u8,
}

impl FrameInfo {
    pub fn is_intra(&self) -> bool {
        self.frame_type == FrameType::KeyFrame || self.intra_only
    }

    /// Whether decoding the frame writes a new output frame.
    pub fn needs_output_frame(&self) -> bool {
        self.show_existing_frame.is_none()
    }

    /// Parses the start of the uncompressed header of `data`, a single frame.
    pub fn peek(data: &[u8]) -> anyhow::Result<Self> {
        let mut r = BitReader::new(data);
        let mut info = FrameInfo {
            bit_depth: 8,
            ..Default::default()
        };

        let marker = r.read_u32(2)?;
        if marker != FRAME_MARKER {
            return Err(anyhow!("Broken stream: expected frame marker, found {:?}", marker));
        }
        let low = r.read_u8(1)?;
        let high = r.read_u8(1)?;
        info.profile = (high << 1) | low;
        if info.profile == 3 {
            r.skip(1)?;
        }

        if r.read_bool()? {
            info.show_existing_frame = Some(r.read_u8(3)?);
            return Ok(info);
        }

        info.frame_type =
            FrameType::n(r.read_u8(1)?).ok_or(anyhow!("Broken stream: invalid frame type"))?;
        info.show_frame = r.read_bool()?;
        info.error_resilient = r.read_bool()?;

        if info.frame_type == FrameType::KeyFrame {
            read_sync_code(&mut r)?;
            read_color_config(&mut r, &mut info)?;
            info.size = FrameSize::Explicit(read_size(&mut r)?);
            info.render_size = read_render_size(&mut r)?;
            info.refresh_frame_flags = 0xff;
        } else {
            if !info.show_frame {
                info.intra_only = r.read_bool()?;
            }
            if !info.error_resilient {
                // reset_frame_context
                r.skip(2)?;
            }

            if info.intra_only {
                read_sync_code(&mut r)?;
                if info.profile > 0 {
                    read_color_config(&mut r, &mut info)?;
                }
                info.refresh_frame_flags = r.read_u8(8)?;
                info.size = FrameSize::Explicit(read_size(&mut r)?);
                info.render_size = read_render_size(&mut r)?;
            } else {
                info.refresh_frame_flags = r.read_u8(8)?;
                for i in 0..REFS_PER_FRAME {
                    info.ref_frame_idx[i] = r.read_u8(3)?;
                    info.ref_frame_sign_bias[i] = r.read_bool()?;
                }

                info.size = FrameSize::Explicit(Default::default());
                let mut from_ref = None;
                for i in 0..REFS_PER_FRAME {
                    if r.read_bool()? {
                        from_ref = Some(info.ref_frame_idx[i]);
                        break;
                    }
                }
                info.size = match from_ref {
                    Some(slot) => FrameSize::FromRef(slot),
                    None => FrameSize::Explicit(read_size(&mut r)?),
                };
                info.render_size = read_render_size(&mut r)?;

                // allow_high_precision_mv
                r.skip(1)?;
                // interpolation filter
                if !r.read_bool()? {
                    r.skip(2)?;
                }
            }
        }

        if !info.error_resilient {
            // refresh_frame_context, frame_parallel_decoding_mode
            r.skip(2)?;
        }
        // frame_context_idx
        r.skip(2)?;

        read_loop_filter(&mut r, &mut info.loop_filter)?;
        info.base_q_idx = r.read_u8(8)?;

        Ok(info)
    }
}

fn read_sync_code(r: &mut BitReader) -> anyhow::Result<()> {
    let sync_code = r.read_u32(24)?;
    if sync_code != SYNC_CODE {
        return Err(anyhow!(
            "Broken stream: expected sync code == {:?}, found {:?}",
            SYNC_CODE,
            sync_code
        ));
    }
    Ok(())
}

fn read_color_config(r: &mut BitReader, info: &mut FrameInfo) -> anyhow::Result<()> {
    info.bit_depth = if info.profile >= 2 {
        if r.read_bool()? {
            12
        } else {
            10
        }
    } else {
        8
    };

    let color_space = r.read_u8(3)?;
    let subsampling_coded = info.profile == 1 || info.profile == 3;
    if color_space != CS_RGB {
        // color_range
        r.skip(1)?;
        if subsampling_coded {
            // subsampling_x, subsampling_y, reserved_zero
            r.skip(3)?;
        }
    } else if subsampling_coded {
        r.skip(1)?;
    } else {
        return Err(anyhow!("Broken stream: RGB is not supported in profile {}", info.profile));
    }
    Ok(())
}

fn read_size(r: &mut BitReader) -> anyhow::Result<Resolution> {
    let width = r.read_u32(16)? + 1;
    let height = r.read_u32(16)? + 1;
    Ok(Resolution { width, height })
}

fn read_render_size(r: &mut BitReader) -> anyhow::Result<Option<Resolution>> {
    if r.read_bool()? {
        Ok(Some(read_size(r)?))
    } else {
        Ok(None)
    }
}

fn read_signed(r: &mut BitReader, bits: u8) -> anyhow::Result<i8> {
    let value = r.read_u8(bits)? as i8;
    Ok(if r.read_bool()? { -value } else { value })
}

fn read_loop_filter(r: &mut BitReader, lf: &mut LoopFilterParams) -> anyhow::Result<()> {
    lf.level = r.read_u8(6)?;
    lf.sharpness = r.read_u8(3)?;
    lf.delta_enabled = r.read_bool()?;
    if lf.delta_enabled && r.read_bool()? {
        for delta in lf.ref_deltas.iter_mut() {
            if r.read_bool()? {
                *delta = read_signed(r, 6)?;
            }
        }
        for delta in lf.mode_deltas.iter_mut() {
            if r.read_bool()? {
                *delta = read_signed(r, 6)?;
            }
        }
    }
    Ok(())
}

/// Splits a chunk into its frames, following the superframe index if there is one.
///
/// A chunk without a valid index is a single frame.
pub fn split_superframe(chunk: &[u8]) -> anyhow::Result<Vec<&[u8]>> {
    let Some(&marker) = chunk.last() else {
        return Ok(vec![]);
    };
    if marker >> 5 != SUPERFRAME_MARKER {
        return Ok(vec![chunk]);
    }

    let bytes_per_size = ((marker >> 3) & 0x3) as usize + 1;
    let frames = (marker & 0x7) as usize + 1;
    let index_size = 2 + bytes_per_size * frames;
    if index_size > chunk.len() || chunk[chunk.len() - index_size] != marker {
        return Ok(vec![chunk]);
    }

    let data_len = chunk.len() - index_size;
    let sizes = &chunk[data_len + 1..chunk.len() - 1];
    let mut out = Vec::with_capacity(frames);
    let mut offset = 0;
    for size in sizes.chunks(bytes_per_size) {
        let size = size
            .iter()
            .enumerate()
            .fold(0usize, |acc, (i, &b)| acc | (b as usize) << (i * 8));
        let end = offset + size;
        if end > data_len {
            return Err(anyhow!(
                "Broken stream: superframe frame of {} bytes at {} exceeds {} bytes of data",
                size,
                offset,
                data_len
            ));
        }
        // Zero-sized frames carry nothing for the hardware.
        if size > 0 {
            out.push(&chunk[offset..end]);
        }
        offset = end;
    }

    Ok(out)
}

/// Appends `frame` to `out`, prefixed with the header the firmware expects.
pub fn push_aml_frame(out: &mut Vec<u8>, frame: &[u8]) {
    let size = frame.len() as u32;
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&(!size).to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 1]);
    out.extend_from_slice(AML_MAGIC);
    out.extend_from_slice(frame);
}

/// Size of the frame following the AML header at the start of `data`.
pub fn parse_aml_header(data: &[u8]) -> anyhow::Result<usize> {
    let header = data
        .get(..AML_HEADER_SIZE)
        .context("AML header is truncated")?;
    let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let check = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if check != !size || &header[12..16] != AML_MAGIC {
        return Err(anyhow!("invalid AML header {:x?}", header));
    }
    Ok(size as usize)
}
