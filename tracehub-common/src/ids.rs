// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Identifier spaces and the reusable bitmap allocator backing `BufferID`
//! (§3 "Identifiers").

use serde::{Deserialize, Serialize};

/// The kernel-reported uid of a connected producer, stamped onto every
/// packet the service yields to a consumer (§3 "Packet", §7, invariant 2 in
/// §8). Never influenced by producer-supplied payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TrustedUid(pub u32);

/// A reusable bitmap allocator of fixed capacity, used to mint globally
/// unique `BufferID`s (§3) from a bounded id space and return them to the
/// free pool on `FreeBuffers` (§4.K.7).
#[derive(Debug)]
pub struct BitmapAllocator {
    bits: Vec<u64>,
    capacity: usize,
}

impl BitmapAllocator {
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(64);
        Self {
            bits: vec![0u64; words],
            capacity,
        }
    }

    /// Reserves and returns the lowest free id, or `None` if the allocator
    /// is full (§8 invariant 5: every returned id is either live or freed,
    /// never both).
    pub fn allocate(&mut self) -> Option<usize> {
        for (word_idx, word) in self.bits.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                let id = word_idx * 64 + bit;
                if id >= self.capacity {
                    return None;
                }
                *word |= 1 << bit;
                return Some(id);
            }
        }
        None
    }

    /// Returns `id` to the free pool. Freeing an id that was never
    /// allocated, or double-freeing, is a programmer error.
    pub fn free(&mut self, id: usize) {
        let word_idx = id / 64;
        let bit = id % 64;
        debug_assert!(
            self.bits[word_idx] & (1 << bit) != 0,
            "freeing an id that was not allocated"
        );
        self.bits[word_idx] &= !(1 << bit);
    }

    pub fn is_allocated(&self, id: usize) -> bool {
        id < self.capacity && (self.bits[id / 64] & (1 << (id % 64))) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_id_first() {
        let mut a = BitmapAllocator::new(4);
        assert_eq!(a.allocate(), Some(0));
        assert_eq!(a.allocate(), Some(1));
        a.free(0);
        assert_eq!(a.allocate(), Some(0));
        assert_eq!(a.allocate(), Some(2));
    }

    #[test]
    fn exhausts_capacity() {
        let mut a = BitmapAllocator::new(2);
        assert!(a.allocate().is_some());
        assert!(a.allocate().is_some());
        assert_eq!(a.allocate(), None);
    }

    #[test]
    fn allocated_and_freed_sets_are_disjoint() {
        let mut a = BitmapAllocator::new(65);
        let id = a.allocate().unwrap();
        assert!(a.is_allocated(id));
        a.free(id);
        assert!(!a.is_allocated(id));
    }
}
