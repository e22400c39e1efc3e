// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::best_fit_v0::lower_bound_ids;
use super::{BankData, BlockBank, Strategy, commit_split};
use crate::size::SizeType;
use alloc::vec::Vec;
use core::marker::PhantomData;

/// [`BestFitList`](super::BestFitList) with a hand-unrolled binary search.
///
/// `ALGO` selects the inner loop: `0` runs the minimum iteration count,
/// `1` and `2` trade an extra compare for one and two unrolled halving
/// steps per iteration. All three return the same lower bound; the variants
/// exist because the search dominates this strategy's profile.
#[derive(Debug)]
pub struct BestFitUnrolled<S: SizeType, const ALGO: u8 = 0> {
    free: Vec<u32>,
    _marker: PhantomData<fn(S)>,
}

impl<S: SizeType, const ALGO: u8> Default for BestFitUnrolled<S, ALGO> {
    fn default() -> Self {
        Self {
            free: Vec::new(),
            _marker: PhantomData,
        }
    }
}

// === impl BestFitUnrolled ===

impl<S: SizeType, const ALGO: u8> BestFitUnrolled<S, ALGO> {
    /// One halving step: move the candidate to the middle when the middle
    /// still compares below the key.
    #[inline(always)]
    fn step(blocks: &BlockBank<S, ()>, ids: &[u32], key: S, it: &mut usize, len: &mut usize) {
        let middle = *it + (*len >> 1);
        *len = (*len + 1) >> 1;
        if blocks[ids[middle]].size < key {
            *it = middle;
        }
    }

    fn search(blocks: &BlockBank<S, ()>, ids: &[u32], key: S) -> usize {
        if ids.is_empty() {
            return 0;
        }

        let mut it = 0_usize;
        let mut len = ids.len();

        match ALGO {
            0 => {
                while len > 2 {
                    Self::step(blocks, ids, key, &mut it, &mut len);
                }
            }
            1 => loop {
                Self::step(blocks, ids, key, &mut it, &mut len);
                if len <= 2 {
                    break;
                }
            },
            _ => loop {
                Self::step(blocks, ids, key, &mut it, &mut len);
                Self::step(blocks, ids, key, &mut it, &mut len);
                if len <= 2 {
                    break;
                }
            },
        }

        if len > 1 && blocks[ids[it]].size < key {
            it += 1;
        }
        if it < ids.len() && blocks[ids[it]].size < key {
            it += 1;
        }
        it
    }

    fn position_of(&self, blocks: &BlockBank<S, ()>, block: u32) -> usize {
        let mut it = Self::search(blocks, &self.free, blocks[block].size);
        while self.free[it] != block {
            it += 1;
        }
        it
    }
}

impl<S: SizeType, const ALGO: u8> Strategy<S> for BestFitUnrolled<S, ALGO> {
    type Extension = ();
    type Cursor = usize;

    fn try_allocate(&self, bank: &BankData<S, ()>, size: S) -> Option<usize> {
        match self.free.last() {
            Some(&last) if bank.blocks[last].size >= size => {
                Some(Self::search(&bank.blocks, &self.free, size))
            }
            _ => None,
        }
    }

    fn commit(&mut self, bank: &mut BankData<S, ()>, size: S, cursor: usize) -> u32 {
        let found = self.free[cursor];

        if let Some(remainder) = commit_split(bank, found, size) {
            let pos = lower_bound_ids(
                &bank.blocks,
                &self.free[..cursor],
                bank.blocks[remainder].size,
            );
            self.free.copy_within(pos..cursor, pos + 1);
            self.free[pos] = remainder;
        } else {
            self.free.remove(cursor);
        }

        found
    }

    fn add_free_arena(&mut self, blocks: &mut BlockBank<S, ()>, block: u32) {
        debug_assert!(
            self.free
                .last()
                .is_none_or(|&last| blocks[last].size <= blocks[block].size)
        );
        self.free.push(block);
    }

    fn add_free(&mut self, blocks: &mut BlockBank<S, ()>, block: u32) {
        let pos = Self::search(blocks, &self.free, blocks[block].size);
        self.free.insert(pos, block);
    }

    fn grow_free_node(&mut self, blocks: &mut BlockBank<S, ()>, block: u32, new_size: S) {
        let it = self.position_of(blocks, block);
        self.free.remove(it);
        blocks[block].size = new_size;
        let pos = Self::search(blocks, &self.free, new_size);
        self.free.insert(pos, block);
    }

    fn replace_and_grow(
        &mut self,
        blocks: &mut BlockBank<S, ()>,
        block: u32,
        new_block: u32,
        new_size: S,
    ) {
        let it = self.position_of(blocks, block);
        self.free.remove(it);
        blocks[new_block].size = new_size;
        let pos = Self::search(blocks, &self.free, new_size);
        self.free.insert(pos, new_block);
    }

    fn erase(&mut self, blocks: &mut BlockBank<S, ()>, block: u32) {
        let it = self.position_of(blocks, block);
        self.free.remove(it);
    }

    fn total_free_nodes(&self, _blocks: &BlockBank<S, ()>) -> u32 {
        self.free.len() as u32
    }

    fn total_free_size(&self, blocks: &BlockBank<S, ()>) -> S {
        let mut total = S::ZERO;
        for &id in &self.free {
            total += blocks[id].size;
        }
        total
    }

    fn validate_integrity(&self, blocks: &BlockBank<S, ()>) {
        let mut prev = S::ZERO;
        for &id in &self.free {
            let blk = &blocks[id];
            assert!(blk.is_free, "sorted list holds a non-free block");
            assert!(prev <= blk.size, "sorted order violated");
            prev = blk.size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, emplace_block};

    fn bank_with(sizes: &[u32]) -> (BlockBank<u32, ()>, Vec<u32>) {
        let mut bank = BlockBank::new();
        bank.emplace(Block::new_free(0, 0, 0)); // sentinel
        let ids = sizes
            .iter()
            .map(|&size| emplace_block(&mut bank, Block::new_free(0, size, 1)))
            .collect();
        (bank, ids)
    }

    #[test]
    fn all_variants_agree_with_the_plain_lower_bound() {
        let sizes = [4u32, 4, 8, 8, 8, 12, 32, 32, 100, 100, 640];
        let (bank, ids) = bank_with(&sizes);

        for key in [1u32, 4, 5, 8, 12, 13, 32, 99, 100, 640, 641] {
            let expected = lower_bound_ids(&bank, &ids, key);
            assert_eq!(
                BestFitUnrolled::<u32, 0>::search(&bank, &ids, key),
                expected,
                "algo 0, key {key}"
            );
            assert_eq!(
                BestFitUnrolled::<u32, 1>::search(&bank, &ids, key),
                expected,
                "algo 1, key {key}"
            );
            assert_eq!(
                BestFitUnrolled::<u32, 2>::search(&bank, &ids, key),
                expected,
                "algo 2, key {key}"
            );
        }
    }

    #[test]
    fn search_handles_tiny_inputs() {
        let (bank, ids) = bank_with(&[16]);
        assert_eq!(BestFitUnrolled::<u32, 0>::search(&bank, &ids, 8), 0);
        assert_eq!(BestFitUnrolled::<u32, 0>::search(&bank, &ids, 17), 1);
        assert_eq!(BestFitUnrolled::<u32, 0>::search(&bank, &[], 8), 0);
    }
}
