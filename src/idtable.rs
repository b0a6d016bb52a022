// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-capacity handle allocator, per `spec.md` §4.1.
//!
//! Capacity is rounded up to a multiple of the per-block bit width.
//! Allocation scans blocks for the lowest-indexed free bit. Handles are
//! biased by a large constant so that `0` and small integers are never valid
//! handles (a common defense in the C source against accidentally treating
//! an uninitialized `int` handle as valid).

const BLOCK_BITS: usize = 32;
const HANDLE_BIAS: u32 = 0x1000_0000;

/// A dense small-integer handle, biased away from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub const INVALID: Handle = Handle(0);

    fn from_index(index: usize) -> Self {
        Handle(HANDLE_BIAS + index as u32)
    }

    fn to_index(self) -> Option<usize> {
        self.0.checked_sub(HANDLE_BIAS).map(|i| i as usize)
    }

    pub fn is_valid(self) -> bool {
        self.0 >= HANDLE_BIAS
    }
}

/// A fixed-capacity `T`-indexed handle table.
///
/// Fatal assertion if the free-bitmap state ever diverges from the object
/// array (`spec.md` §4.1: "Fatal assertion if the bitmap state diverges from
/// the pointer array") — in safe Rust this divergence simply can't happen,
/// since the bitmap and the object slots are mutated together by the same
/// methods, but the invariant is asserted anyway at the boundary so a future
/// refactor that breaks it fails loudly instead of silently.
pub struct IdTable<T> {
    blocks: Vec<u32>,
    slots: Vec<Option<T>>,
    capacity: usize,
}

impl<T> IdTable<T> {
    /// `capacity` is rounded up to a multiple of 32.
    pub fn new(capacity: usize) -> Self {
        let rounded = (capacity + BLOCK_BITS - 1) / BLOCK_BITS * BLOCK_BITS;
        let num_blocks = rounded / BLOCK_BITS;
        let mut slots = Vec::with_capacity(rounded);
        slots.resize_with(rounded, || None);
        IdTable {
            blocks: vec![u32::MAX; num_blocks],
            slots,
            capacity: rounded,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Allocates the lowest-indexed free handle and stores `value` there.
    /// Returns `None` if the table is exhausted.
    pub fn alloc(&mut self, value: T) -> Option<Handle> {
        for (block_idx, block) in self.blocks.iter_mut().enumerate() {
            if *block == 0 {
                continue;
            }
            let bit = block.trailing_zeros() as usize;
            *block &= !(1 << bit);
            let index = block_idx * BLOCK_BITS + bit;
            assert!(
                self.slots[index].is_none(),
                "idtable bitmap/slot divergence at index {}",
                index
            );
            self.slots[index] = Some(value);
            return Some(Handle::from_index(index));
        }
        None
    }

    /// Releases a handle, returning the stored value if the handle was live.
    pub fn free(&mut self, handle: Handle) -> Option<T> {
        let index = handle.to_index()?;
        if index >= self.capacity {
            return None;
        }
        let value = self.slots[index].take()?;
        let block_idx = index / BLOCK_BITS;
        let bit = index % BLOCK_BITS;
        assert!(
            self.blocks[block_idx] & (1 << bit) == 0,
            "idtable bitmap/slot divergence freeing index {}",
            index
        );
        self.blocks[block_idx] |= 1 << bit;
        Some(value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let index = handle.to_index()?;
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let index = handle.to_index()?;
        self.slots.get_mut(index)?.as_mut()
    }
}
