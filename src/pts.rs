// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Timestamps of decoded frames, associated through their position in the input stream.

use std::collections::BTreeMap;

use crate::extend_bits;

/// Maps stream offsets to the timestamps of the input chunks starting there.
#[derive(Debug, Default)]
pub struct PtsManager {
    entries: BTreeMap<u64, Option<u64>>,
    /// Last offset looked up, used to extend the hardware's 32-bit offsets.
    last_offset: u64,
}

impl PtsManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records that the input starting at `offset` carries `pts`.
    ///
    /// Chunks without a timestamp are recorded too, so that a frame starting in one does not
    /// inherit the timestamp of an earlier chunk.
    pub fn insert(&mut self, offset: u64, pts: Option<u64>) {
        self.entries.insert(offset, pts);
    }

    /// Timestamp of the chunk containing `offset`, if any.
    ///
    /// Entries of earlier chunks are dropped: lookups are expected in stream order.
    pub fn lookup(&mut self, offset: u64) -> Option<u64> {
        let (&key, &pts) = self.entries.range(..=offset).next_back()?;
        self.entries = self.entries.split_off(&key);
        self.last_offset = self.last_offset.max(offset);
        pts
    }

    /// Like [`PtsManager::lookup`], for an offset read from a 32-bit hardware register.
    pub fn lookup_hw(&mut self, offset: u32) -> Option<u64> {
        let offset = extend_bits(offset, self.last_offset);
        self.lookup(offset)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
