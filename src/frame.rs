// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Output frames.
//!
//! Decoders keep their output frames in a fixed-capacity [`FramePool`]. Each frame carries a
//! reference count covering every holder: the hardware (as decode target or reference) and the
//! client (between delivery and return). A frame is free for reuse at count 0. Client returns only
//! undo client deliveries, so they can never drop a hardware reference.
//!
//! Reallocating the pool bumps its generation. Handles from earlier generations are stale and
//! ignored when returned.

use crate::memory::Buffer;
use crate::Resolution;

/// Identifies a delivered frame when the client gives it back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    pub index: usize,
    pub generation: u32,
}

/// A decoded frame, as delivered to the client.
#[derive(Clone)]
pub struct DecodedFrame {
    pub handle: FrameHandle,
    pub resolution: Resolution,
    /// Bytes per row of the luma plane. Chroma follows the luma plane with the same stride.
    pub stride: u32,
    pub buffer: Buffer,
    pub pts: Option<u64>,
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("handle", &self.handle)
            .field("resolution", &self.resolution)
            .field("stride", &self.stride)
            .field("phys", &format_args!("{:#010x}", self.buffer.phys_base()))
            .field("pts", &self.pts)
            .finish()
    }
}

struct Slot<T> {
    frame: T,
    refcount: u32,
    /// Deliveries not yet returned by the client. Included in `refcount`.
    client_refs: u32,
}

pub struct FramePool<T> {
    slots: Vec<Slot<T>>,
    generation: u32,
}

impl<T> Default for FramePool<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            generation: 0,
        }
    }
}

impl<T> FramePool<T> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Replaces every frame of the pool. All previously issued handles become stale.
    pub fn reset(&mut self, frames: Vec<T>) {
        self.slots = frames
            .into_iter()
            .map(|frame| Slot {
                frame,
                refcount: 0,
                client_refs: 0,
            })
            .collect();
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn clear(&mut self) {
        self.reset(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn handle(&self, index: usize) -> FrameHandle {
        FrameHandle {
            index,
            generation: self.generation,
        }
    }

    pub fn is_current(&self, handle: FrameHandle) -> bool {
        handle.generation == self.generation && handle.index < self.slots.len()
    }

    pub fn get(&self, index: usize) -> &T {
        &self.slots[index].frame
    }

    pub fn get_mut(&mut self, index: usize) -> &mut T {
        &mut self.slots[index].frame
    }

    pub fn refcount(&self, index: usize) -> u32 {
        self.slots[index].refcount
    }

    /// Index of a frame nobody holds.
    pub fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.refcount == 0)
    }

    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| s.refcount == 0).count()
    }

    pub fn add_ref(&mut self, index: usize) {
        self.slots[index].refcount += 1;
    }

    /// Takes a client reference to frame `index`, about to be delivered.
    pub fn deliver(&mut self, index: usize) -> FrameHandle {
        let slot = &mut self.slots[index];
        slot.refcount += 1;
        slot.client_refs += 1;
        self.handle(index)
    }

    /// Deliveries of frame `index` the client has not returned yet.
    pub fn client_refs(&self, index: usize) -> u32 {
        self.slots[index].client_refs
    }

    /// Drops one reference to frame `index`.
    ///
    /// # Panics
    ///
    /// Panics if the frame is not referenced.
    pub fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        assert!(slot.refcount > 0, "release of unreferenced frame {}", index);
        slot.refcount -= 1;
    }

    /// Drops the reference of a frame returned by the client. Stale handles are ignored.
    ///
    /// Returns whether the handle was current.
    pub fn release_handle(&mut self, handle: FrameHandle) -> bool {
        if !self.is_current(handle) {
            log::debug!("ignoring stale frame {:?}", handle);
            return false;
        }
        let slot = &mut self.slots[handle.index];
        if slot.client_refs == 0 {
            log::warn!("frame {} returned more times than delivered", handle.index);
            return false;
        }
        slot.client_refs -= 1;
        self.release(handle.index);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcounting() {
        let mut pool = FramePool::new();
        pool.reset(vec!['a', 'b', 'c']);

        assert_eq!(pool.find_free(), Some(0));
        pool.add_ref(0);
        pool.add_ref(0);
        pool.add_ref(1);
        assert_eq!(pool.find_free(), Some(2));
        assert_eq!(pool.free_count(), 1);

        pool.release(0);
        assert_eq!(pool.refcount(0), 1);
        pool.release(0);
        let handle = pool.deliver(0);
        assert!(pool.release_handle(handle));
        assert_eq!(pool.refcount(0), 0);
        // A second return can not push the count below zero.
        assert!(!pool.release_handle(handle));
        assert_eq!(pool.refcount(0), 0);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn client_returns_keep_hardware_references() {
        let mut pool = FramePool::new();
        pool.reset(vec!['a', 'b']);
        // Held by a reference slot, then delivered once.
        pool.add_ref(0);
        let handle = pool.deliver(0);
        assert_eq!(pool.refcount(0), 2);
        assert_eq!(pool.client_refs(0), 1);

        assert!(pool.release_handle(handle));
        for _ in 0..8 {
            assert!(!pool.release_handle(handle));
        }
        assert_eq!(pool.refcount(0), 1);
        assert_eq!(pool.client_refs(0), 0);
        assert_eq!(pool.find_free(), Some(1));
    }

    #[test]
    fn stale_handles_are_ignored() {
        let mut pool = FramePool::new();
        pool.reset(vec![0u32; 4]);
        pool.add_ref(3);
        let old = pool.handle(3);

        pool.reset(vec![0u32; 2]);
        pool.add_ref(1);
        assert!(!pool.is_current(old));
        assert!(!pool.release_handle(old));
        assert!(!pool.release_handle(FrameHandle {
            index: 1,
            generation: old.generation
        }));
        assert_eq!(pool.refcount(1), 1);
    }

    #[test]
    #[should_panic(expected = "release of unreferenced frame")]
    fn release_below_zero_panics() {
        let mut pool = FramePool::new();
        pool.reset(vec![()]);
        pool.release(0);
    }
}
