// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Secure world collaborators: the secure monitor that places hardware units in protected mode,
//! and the trusted application that loads firmware on behalf of the engine.

use thiserror::Error;

use crate::firmware::FirmwareType;
use crate::memory::AllocError;
use crate::memory::AllocationRequest;
use crate::memory::Buffer;
use crate::memory::BufferAllocator;
use crate::SocKind;

/// Hardware units whose memory accesses can be restricted to protected memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProtectedUnit {
    Parser,
    Vdec,
    Hevc,
}

impl ProtectedUnit {
    fn index(&self) -> usize {
        match self {
            ProtectedUnit::Parser => 0,
            ProtectedUnit::Vdec => 1,
            ProtectedUnit::Hevc => 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum SecureError {
    #[error("no secure monitor available")]
    NoMonitor,
    #[error("no trusted execution environment available")]
    NoTee,
    #[error("secure monitor refused to configure {unit:?}: {reason}")]
    Monitor {
        unit: ProtectedUnit,
        reason: anyhow::Error,
    },
    #[error("firmware pre-load failed: {0}")]
    Preload(anyhow::Error),
    #[error("secure load of {0:?} firmware failed: {1}")]
    Load(FirmwareType, anyhow::Error),
}

/// Secure monitor calls.
pub trait SecureMonitor: Send + Sync {
    fn set_protected(&self, unit: ProtectedUnit, enable: bool) -> anyhow::Result<()>;
}

/// Session with the trusted application in charge of video firmware.
pub trait TeeClient: Send + Sync {
    /// Hands the whole firmware package to the secure world. Must happen once before any
    /// per-codec firmware request.
    fn preload_firmware(&self, package: &[u8]) -> anyhow::Result<()>;
    /// Asks the secure world to load the firmware of `firmware` into its core.
    fn load_video_firmware(&self, firmware: FirmwareType, soc: SocKind) -> anyhow::Result<()>;
}

/// Tracks which units have been put in protected mode, and gates protected allocations on it.
#[derive(Default)]
pub struct ProtectionState {
    protected: [bool; 3],
}

impl ProtectionState {
    pub fn is_protected(&self, unit: ProtectedUnit) -> bool {
        self.protected[unit.index()]
    }

    /// Puts `unit` in or out of protected mode through `monitor`.
    pub fn set_protected(
        &mut self,
        monitor: Option<&dyn SecureMonitor>,
        unit: ProtectedUnit,
        enable: bool,
    ) -> Result<(), SecureError> {
        if self.is_protected(unit) == enable {
            return Ok(());
        }
        let monitor = monitor.ok_or(SecureError::NoMonitor)?;
        monitor
            .set_protected(unit, enable)
            .map_err(|reason| SecureError::Monitor { unit, reason })?;
        log::debug!("{:?} protected mode {}", unit, if enable { "on" } else { "off" });
        self.protected[unit.index()] = enable;
        Ok(())
    }

    /// Allocates a buffer, protected for `request.protected` if set.
    ///
    /// # Panics
    ///
    /// Panics if a protected buffer is requested for a unit that is not in protected mode.
    pub fn allocate(
        &self,
        allocator: &dyn BufferAllocator,
        request: &AllocationRequest,
    ) -> Result<Buffer, AllocError> {
        if let Some(unit) = request.protected {
            assert!(
                self.is_protected(unit),
                "protected {} allocated before {:?} was put in protected mode",
                request.name,
                unit
            );
        }
        allocator.allocate(request)
    }
}
