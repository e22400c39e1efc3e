// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{BankData, BlockBank, Strategy, commit_split};
use crate::size::SizeType;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::marker::PhantomData;

/// Size class of a block: buckets advance every `granularity` bytes and
/// saturate at `max_bucket`, so the top class collects every large block.
pub(super) fn class_of<S: SizeType>(size: S, granularity: u32, max_bucket: usize) -> usize {
    let class = size.as_u64() / u64::from(granularity);
    usize::try_from(class).unwrap_or(usize::MAX).min(max_bucket)
}

/// Size-classed placement with a fixed-capacity array per bucket.
///
/// A free block lands in the bucket of its size class; a request scans from
/// its own class upward and takes the first member that fits. Blocks that
/// find their bucket full spill into an unsorted overflow vector that is
/// only consulted when every bucket fails (`is_slotted` records which home
/// holds a block).
#[derive(Debug)]
pub struct SlottedArray<
    S: SizeType,
    const GRANULARITY: u32 = 256,
    const MAX_BUCKET: usize = 255,
    const MAX_PER_SLOT: usize = 8,
> {
    /// One bucket per size class, classes `0..=MAX_BUCKET`.
    buckets: Vec<ArrayVec<u32, MAX_PER_SLOT>>,
    overflow: Vec<u32>,
    _marker: PhantomData<fn(S)>,
}

impl<S: SizeType, const G: u32, const MB: usize, const MPS: usize> Default
    for SlottedArray<S, G, MB, MPS>
{
    fn default() -> Self {
        Self {
            buckets: (0..=MB).map(|_| ArrayVec::new()).collect(),
            overflow: Vec::new(),
            _marker: PhantomData,
        }
    }
}

// === impl SlottedArray ===

impl<S: SizeType, const G: u32, const MB: usize, const MPS: usize> SlottedArray<S, G, MB, MPS> {
    fn class_of(size: S) -> usize {
        class_of(size, G, MB)
    }
}

impl<S: SizeType, const G: u32, const MB: usize, const MPS: usize> Strategy<S>
    for SlottedArray<S, G, MB, MPS>
{
    type Extension = ();
    type Cursor = u32;

    fn try_allocate(&self, bank: &BankData<S, ()>, size: S) -> Option<u32> {
        let class = Self::class_of(size);

        // members of a higher class are large enough by construction; the
        // request's own class and the saturated top class need a size check
        for (k, bucket) in self.buckets.iter().enumerate().skip(class) {
            let need_check = k == class || k == MB;
            for &id in bucket {
                if !need_check || bank.blocks[id].size >= size {
                    return Some(id);
                }
            }
        }

        self.overflow
            .iter()
            .copied()
            .find(|&id| bank.blocks[id].size >= size)
    }

    fn commit(&mut self, bank: &mut BankData<S, ()>, size: S, found: u32) -> u32 {
        self.erase(&mut bank.blocks, found);
        if let Some(remainder) = commit_split(bank, found, size) {
            self.add_free(&mut bank.blocks, remainder);
        }
        found
    }

    fn add_free(&mut self, blocks: &mut BlockBank<S, ()>, block: u32) {
        let class = Self::class_of(blocks[block].size);
        if self.buckets[class].try_push(block).is_ok() {
            blocks[block].is_slotted = true;
        } else {
            self.overflow.push(block);
            blocks[block].is_slotted = false;
        }
    }

    fn grow_free_node(&mut self, blocks: &mut BlockBank<S, ()>, block: u32, new_size: S) {
        self.erase(blocks, block);
        blocks[block].size = new_size;
        self.add_free(blocks, block);
    }

    fn replace_and_grow(
        &mut self,
        blocks: &mut BlockBank<S, ()>,
        block: u32,
        new_block: u32,
        new_size: S,
    ) {
        self.erase(blocks, block);
        blocks[new_block].size = new_size;
        self.add_free(blocks, new_block);
    }

    fn erase(&mut self, blocks: &mut BlockBank<S, ()>, block: u32) {
        if blocks[block].is_slotted {
            let class = Self::class_of(blocks[block].size);
            let pos = self.buckets[class]
                .iter()
                .position(|&id| id == block)
                .expect("slotted block missing from its bucket");
            self.buckets[class].swap_remove(pos);
            blocks[block].is_slotted = false;
        } else {
            let pos = self
                .overflow
                .iter()
                .position(|&id| id == block)
                .expect("block missing from the overflow list");
            self.overflow.swap_remove(pos);
        }
    }

    fn total_free_nodes(&self, _blocks: &BlockBank<S, ()>) -> u32 {
        let in_buckets: usize = self.buckets.iter().map(ArrayVec::len).sum();
        (in_buckets + self.overflow.len()) as u32
    }

    fn total_free_size(&self, blocks: &BlockBank<S, ()>) -> S {
        let mut total = S::ZERO;
        for id in self.buckets.iter().flatten().chain(&self.overflow) {
            total += blocks[*id].size;
        }
        total
    }

    fn validate_integrity(&self, blocks: &BlockBank<S, ()>) {
        for (class, bucket) in self.buckets.iter().enumerate() {
            for &id in bucket {
                let blk = &blocks[id];
                assert!(blk.is_free, "bucket holds a non-free block");
                assert!(blk.is_slotted, "bucket member not marked slotted");
                assert_eq!(Self::class_of(blk.size), class, "block in wrong bucket");
            }
        }
        for &id in &self.overflow {
            let blk = &blocks[id];
            assert!(blk.is_free, "overflow holds a non-free block");
            assert!(!blk.is_slotted, "overflow member marked slotted");
        }
    }
}
