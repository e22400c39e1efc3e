// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{BankData, BlockBank, Strategy, commit_split};
use crate::size::SizeType;
use alloc::vec::Vec;

/// First-fit placement over an unsorted `(size, block)` vector.
///
/// Each registered block remembers its slot index in its payload, and
/// vacated slots (size `0`) are pooled for reuse, so erasing is O(1) at the
/// cost of a linear first-fit scan.
#[derive(Debug, Default)]
pub struct GreedyPool<S: SizeType> {
    /// `(size, block)` entries; a size of zero marks a vacant slot.
    free: Vec<(S, u32)>,
    /// Vacant slot indices available for reuse.
    vacant: Vec<u32>,
}

// === impl GreedyPool ===

impl<S: SizeType> GreedyPool<S> {
    fn claim_slot(&mut self) -> u32 {
        if let Some(slot) = self.vacant.pop() {
            slot
        } else {
            let slot = self.free.len() as u32;
            self.free.push((S::ZERO, 0));
            slot
        }
    }

    fn vacate(&mut self, slot: u32) {
        self.free[slot as usize] = (S::ZERO, 0);
        self.vacant.push(slot);
    }
}

impl<S: SizeType> Strategy<S> for GreedyPool<S> {
    type Extension = u32;
    type Cursor = u32;

    fn try_allocate(&self, _bank: &BankData<S, u32>, size: S) -> Option<u32> {
        debug_assert!(size > S::ZERO);
        self.free
            .iter()
            .position(|&(slot_size, _)| slot_size >= size)
            .map(|slot| slot as u32)
    }

    fn commit(&mut self, bank: &mut BankData<S, u32>, size: S, slot: u32) -> u32 {
        let found = self.free[slot as usize].1;

        if let Some(remainder) = commit_split(bank, found, size) {
            // the slot stays live and now tracks the remainder
            let remaining = bank.blocks[remainder].size;
            self.free[slot as usize] = (remaining, remainder);
            *bank.blocks[remainder].ext_mut() = slot;
        } else {
            self.vacate(slot);
        }

        found
    }

    fn add_free(&mut self, blocks: &mut BlockBank<S, u32>, block: u32) {
        let slot = self.claim_slot();
        self.free[slot as usize] = (blocks[block].size, block);
        *blocks[block].ext_mut() = slot;
    }

    fn grow_free_node(&mut self, blocks: &mut BlockBank<S, u32>, block: u32, new_size: S) {
        let slot = *blocks[block].ext();
        debug_assert_eq!(self.free[slot as usize].1, block);
        self.free[slot as usize].0 = new_size;
        blocks[block].size = new_size;
    }

    fn replace_and_grow(
        &mut self,
        blocks: &mut BlockBank<S, u32>,
        block: u32,
        new_block: u32,
        new_size: S,
    ) {
        let slot = *blocks[block].ext();
        debug_assert_eq!(self.free[slot as usize].1, block);
        self.free[slot as usize] = (new_size, new_block);
        blocks[new_block].size = new_size;
        *blocks[new_block].ext_mut() = slot;
    }

    fn erase(&mut self, blocks: &mut BlockBank<S, u32>, block: u32) {
        let slot = *blocks[block].ext();
        debug_assert_eq!(self.free[slot as usize].1, block);
        self.vacate(slot);
    }

    fn total_free_nodes(&self, _blocks: &BlockBank<S, u32>) -> u32 {
        self.free
            .iter()
            .filter(|&&(size, _)| size != S::ZERO)
            .count() as u32
    }

    fn total_free_size(&self, _blocks: &BlockBank<S, u32>) -> S {
        let mut total = S::ZERO;
        for &(size, _) in &self.free {
            total += size;
        }
        total
    }

    fn validate_integrity(&self, blocks: &BlockBank<S, u32>) {
        for (slot, &(size, block)) in self.free.iter().enumerate() {
            if size == S::ZERO {
                continue;
            }
            let blk = &blocks[block];
            assert!(blk.is_free, "pool holds a non-free block");
            assert_eq!(blk.size, size, "stale mirrored size");
            assert_eq!(*blk.ext(), slot as u32, "stale slot back-reference");
        }
    }
}
