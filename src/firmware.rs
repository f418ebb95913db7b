// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder firmware package.
//!
//! A package is a 256-byte signature, a 256-byte package header, then a sequence of entries. Each
//! entry is a 256-byte entry header followed by its payload, and each payload starts with a
//! 512-byte firmware header describing the microcode that follows it. All integers are
//! little-endian.

use std::collections::HashMap;
use std::fmt;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use thiserror::Error;

use crate::SocKind;

pub const SIGNATURE_SIZE: usize = 256;
pub const PACKAGE_HEADER_SIZE: usize = 256;
pub const ENTRY_HEADER_SIZE: usize = 256;
pub const FIRMWARE_HEADER_SIZE: usize = 512;

const ENTRIES_OFFSET: usize = SIGNATURE_SIZE + PACKAGE_HEADER_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("package too short for its headers ({0} bytes)")]
    TruncatedPackage(usize),
    #[error("entry header at {offset:#x} exceeds the package")]
    TruncatedEntry { offset: usize },
    #[error("entry {name} at {offset:#x} declares {length:#x} bytes, only {remaining:#x} left")]
    EntryTooLong {
        name: String,
        offset: usize,
        length: usize,
        remaining: usize,
    },
    #[error("payload of entry {name} is shorter than a firmware header")]
    PayloadTooShort { name: String },
    #[error("firmware {name} declares {data_size:#x} code bytes in a {available:#x} bytes payload")]
    DataTooLong {
        name: String,
        data_size: usize,
        available: usize,
    },
    #[error("no firmware named {0}")]
    NotFound(String),
}

/// Microcode images a decoder may request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FirmwareType {
    H264,
    H264Multi,
    Vp9Mmu,
}

impl FirmwareType {
    /// Name of the image in the package for `soc`.
    pub fn name(&self, soc: SocKind) -> &'static str {
        match (self, soc) {
            (FirmwareType::H264, SocKind::Gxm) => "gxm_h264",
            (FirmwareType::H264, _) => "g12a_h264",
            (FirmwareType::H264Multi, SocKind::Gxm) => "gxm_h264_multi",
            (FirmwareType::H264Multi, _) => "g12a_h264_multi",
            (FirmwareType::Vp9Mmu, SocKind::Gxm) => "vp9_mmu",
            (FirmwareType::Vp9Mmu, SocKind::Sm1) => "sm1_vp9_mmu",
            (FirmwareType::Vp9Mmu, _) => "g12a_vp9_mmu",
        }
    }
}

/// Metadata of one firmware image, from its payload header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub name: String,
    pub cpu: String,
    pub format: String,
    pub version: String,
    pub maker: String,
    pub date: String,
    pub commit: String,
    pub magic: u32,
    pub checksum: u32,
    pub time: u32,
    /// Offset of the code in the package.
    code_offset: usize,
    /// Size of the code.
    pub data_size: usize,
}

impl fmt::Display for FirmwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, cpu {}, format {}, version {}, {} {})",
            self.name, self.data_size, self.cpu, self.format, self.version, self.maker, self.date
        )
    }
}

fn read_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn parse_payload(
    entry_name: &str,
    payload: &[u8],
    payload_offset: usize,
) -> Result<FirmwareInfo, FirmwareError> {
    if payload.len() < FIRMWARE_HEADER_SIZE {
        return Err(FirmwareError::PayloadTooShort {
            name: entry_name.to_owned(),
        });
    }

    let name = read_string(&payload[8..40]);
    let data_size = LittleEndian::read_u32(&payload[200..204]) as usize;
    let available = payload.len() - FIRMWARE_HEADER_SIZE;
    if data_size > available {
        return Err(FirmwareError::DataTooLong {
            name,
            data_size,
            available,
        });
    }

    Ok(FirmwareInfo {
        magic: LittleEndian::read_u32(&payload[0..4]),
        checksum: LittleEndian::read_u32(&payload[4..8]),
        name,
        cpu: read_string(&payload[40..56]),
        format: read_string(&payload[56..88]),
        version: read_string(&payload[88..120]),
        maker: read_string(&payload[120..152]),
        date: read_string(&payload[152..184]),
        commit: read_string(&payload[184..200]),
        data_size,
        time: LittleEndian::read_u32(&payload[204..208]),
        code_offset: payload_offset + FIRMWARE_HEADER_SIZE,
    })
}

/// A parsed firmware package. Immutable once loaded.
pub struct FirmwareBlob {
    data: Vec<u8>,
    images: Vec<FirmwareInfo>,
    by_name: HashMap<String, usize>,
}

impl FirmwareBlob {
    /// Parses `data`. Any inconsistency fails the whole package.
    pub fn new(data: Vec<u8>) -> Result<Self, FirmwareError> {
        if data.len() < ENTRIES_OFFSET {
            return Err(FirmwareError::TruncatedPackage(data.len()));
        }

        let mut images = Vec::new();
        let mut offset = ENTRIES_OFFSET;
        while offset < data.len() {
            let remaining = data.len() - offset;
            if remaining < ENTRY_HEADER_SIZE {
                return Err(FirmwareError::TruncatedEntry { offset });
            }

            let header = &data[offset..offset + ENTRY_HEADER_SIZE];
            let name = read_string(&header[0..32]);
            let length = LittleEndian::read_u32(&header[96..100]) as usize;
            let payload_offset = offset + ENTRY_HEADER_SIZE;
            let remaining = remaining - ENTRY_HEADER_SIZE;
            if length > remaining {
                return Err(FirmwareError::EntryTooLong {
                    name,
                    offset,
                    length,
                    remaining,
                });
            }

            let payload = &data[payload_offset..payload_offset + length];
            images.push(parse_payload(&name, payload, payload_offset)?);
            offset = payload_offset + length;
        }

        let by_name = images
            .iter()
            .enumerate()
            .map(|(i, info)| (info.name.clone(), i))
            .collect();

        let package_size = LittleEndian::read_u32(&data[SIGNATURE_SIZE + 4..SIGNATURE_SIZE + 8]);
        log::debug!(
            "loaded firmware package: {} images, {} bytes (header says {}), crc32 {:#010x}",
            images.len(),
            data.len(),
            package_size,
            crc32fast::hash(&data)
        );

        Ok(Self {
            data,
            images,
            by_name,
        })
    }

    /// The raw package, as handed to the secure world.
    pub fn package(&self) -> &[u8] {
        &self.data
    }

    pub fn images(&self) -> &[FirmwareInfo] {
        &self.images
    }

    /// Looks up an image by the name in its firmware header.
    pub fn find(&self, name: &str) -> Result<(&FirmwareInfo, &[u8]), FirmwareError> {
        let info = self
            .by_name
            .get(name)
            .map(|&i| &self.images[i])
            .ok_or_else(|| FirmwareError::NotFound(name.to_owned()))?;
        Ok((info, self.code(info)))
    }

    pub fn code(&self, info: &FirmwareInfo) -> &[u8] {
        &self.data[info.code_offset..info.code_offset + info.data_size]
    }

    /// The microcode of `firmware` for `soc`.
    pub fn get_firmware_data(
        &self,
        firmware: FirmwareType,
        soc: SocKind,
    ) -> Result<&[u8], FirmwareError> {
        self.find(firmware.name(soc)).map(|(_, code)| code)
    }
}

/// Builds firmware packages, for tests and tools.
#[derive(Default)]
pub struct PackageBuilder {
    entries: Vec<u8>,
}

fn put_string(dst: &mut [u8], s: &str) {
    let len = s.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&s.as_bytes()[..len]);
}

impl PackageBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends an image. The entry name and the firmware header name are both `name`.
    pub fn add(mut self, name: &str, cpu: &str, code: &[u8]) -> Self {
        let mut payload = vec![0u8; FIRMWARE_HEADER_SIZE];
        LittleEndian::write_u32(&mut payload[0..4], 0x4657_4d41);
        LittleEndian::write_u32(&mut payload[4..8], crc32fast::hash(code));
        put_string(&mut payload[8..40], name);
        put_string(&mut payload[40..56], cpu);
        put_string(&mut payload[56..88], "bin");
        put_string(&mut payload[88..120], "0.1");
        LittleEndian::write_u32(&mut payload[200..204], code.len() as u32);
        payload.extend_from_slice(code);

        let mut header = [0u8; ENTRY_HEADER_SIZE];
        put_string(&mut header[0..32], name);
        put_string(&mut header[32..64], "bin");
        put_string(&mut header[64..96], cpu);
        LittleEndian::write_u32(&mut header[96..100], payload.len() as u32);

        self.entries.extend_from_slice(&header);
        self.entries.extend_from_slice(&payload);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut data = vec![0u8; ENTRIES_OFFSET];
        let header = &mut data[SIGNATURE_SIZE..];
        LittleEndian::write_u32(&mut header[0..4], 0x4b50_4d41);
        LittleEndian::write_u32(&mut header[4..8], self.entries.len() as u32);
        LittleEndian::write_u32(&mut header[8..12], crc32fast::hash(&self.entries));
        data.extend_from_slice(&self.entries);
        data
    }
}
