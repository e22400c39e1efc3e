// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Placement strategies: pluggable free-set structures for the arena
//! allocator.
//!
//! A strategy owns the structure that indexes free blocks by size and
//! decides which block satisfies a request. The allocator front end drives
//! it through the [`Strategy`] trait; the per-block state a strategy needs
//! (tree links, list links, slot indices) lives in the block's payload slot,
//! declared through [`Strategy::Extension`].
//!
//! | strategy | structure | pick |
//! |----------|-----------|------|
//! | [`BestFitTree`] | red-black tree keyed on size | `lower_bound` |
//! | [`BestFitList`] | size-sorted id vector | lower bound |
//! | [`BestFitUnrolled`] | size-sorted id vector | lower bound, unrolled search |
//! | [`BestFitArrays`] | parallel size/id arrays | lower bound, no bank chasing |
//! | [`GreedyPool`] | unsorted `(size, id)` pool | first fit |
//! | [`GreedyList`] | free list through blocks | first fit |
//! | [`SlottedArray`] | size-class buckets, fixed arrays | class scan |
//! | [`SlottedList`] | size-class buckets, intrusive lists | class scan |
//! | [`SlottedFallback`] | buckets + pluggable fallback | windowed class scan |

use crate::block::{Block, emplace_block};
use crate::size::SizeType;

mod best_fit_tree;
mod best_fit_v0;
mod best_fit_v1;
mod best_fit_v2;
mod greedy_v0;
mod greedy_v1;
mod slotted_v0;
mod slotted_v1;
mod slotted_v2;

pub use crate::arena::BankData;
pub use crate::block::BlockBank;
pub use crate::rbtree::TreeLinks;
pub use crate::table::SparseTable;
pub use crate::vlist::ListNode;
pub use best_fit_tree::BestFitTree;
pub use best_fit_v0::BestFitList;
pub use best_fit_v1::BestFitUnrolled;
pub use best_fit_v2::BestFitArrays;
pub use greedy_v0::GreedyPool;
pub use greedy_v1::GreedyList;
pub use slotted_v0::SlottedArray;
pub use slotted_v1::SlottedList;
pub use slotted_v2::{Backstop, ListBackstop, SlottedExt, SlottedFallback, TreeBackstop};

/// A placement strategy: the free-set structure behind an
/// [`ArenaAllocator`](crate::ArenaAllocator).
///
/// The front end owns the banks; the strategy owns only its search
/// structure and the per-block extension payloads. Sizes passed in are
/// already rounded up to [`MIN_GRANULARITY`](Strategy::MIN_GRANULARITY).
pub trait Strategy<S: SizeType>: Default {
    /// Per-block state overlaid into free blocks' payload slots.
    type Extension: Copy + Default + core::fmt::Debug + PartialEq;

    /// Token connecting a successful [`try_allocate`](Strategy::try_allocate)
    /// to the following [`commit`](Strategy::commit).
    type Cursor;

    /// Minimum allocation quantum. Request sizes must be multiples of this.
    const MIN_GRANULARITY: u32 = 4;

    /// Finds a free block of at least `size` bytes, without modifying
    /// anything.
    fn try_allocate(&self, bank: &BankData<S, Self::Extension>, size: S)
    -> Option<Self::Cursor>;

    /// Takes the block picked by `cursor` out of the free set and splits it
    /// if it is strictly larger than `size`: the original record keeps the
    /// front `size` bytes and is marked used, the remainder becomes a new
    /// free block right after it in arena order. Returns the allocated
    /// block's id.
    fn commit(&mut self, bank: &mut BankData<S, Self::Extension>, size: S, cursor: Self::Cursor)
    -> u32;

    /// Registers the initial free block of a freshly created arena.
    fn add_free_arena(&mut self, blocks: &mut BlockBank<S, Self::Extension>, block: u32) {
        self.add_free(blocks, block);
    }

    /// Registers a block that just became free.
    fn add_free(&mut self, blocks: &mut BlockBank<S, Self::Extension>, block: u32);

    /// Grows the registered free block `block` to `new_size` in place.
    fn grow_free_node(
        &mut self,
        blocks: &mut BlockBank<S, Self::Extension>,
        block: u32,
        new_size: S,
    );

    /// Replaces the registered free block `block` with `new_block` at
    /// `new_size` (the right-coalesce path: the freed block subsumes its
    /// free successor).
    fn replace_and_grow(
        &mut self,
        blocks: &mut BlockBank<S, Self::Extension>,
        block: u32,
        new_block: u32,
        new_size: S,
    );

    /// Removes a free block from the structure.
    fn erase(&mut self, blocks: &mut BlockBank<S, Self::Extension>, block: u32);

    fn total_free_nodes(&self, blocks: &BlockBank<S, Self::Extension>) -> u32;

    fn total_free_size(&self, blocks: &BlockBank<S, Self::Extension>) -> S;

    /// Asserts the strategy's internal invariants.
    fn validate_integrity(&self, blocks: &BlockBank<S, Self::Extension>);
}

/// Shared tail of [`Strategy::commit`]: marks `found` used, shrinks it to
/// `size` and, when a remainder is left, emplaces it after `found` in arena
/// order. Returns the remainder's id so the strategy can re-register it.
///
/// The caller must already have removed `found` from its free structure.
pub(crate) fn commit_split<S: SizeType, X: Copy + Default + core::fmt::Debug + PartialEq>(
    bank: &mut BankData<S, X>,
    found: u32,
    size: S,
) -> Option<u32> {
    let blk = &mut bank.blocks[found];
    debug_assert!(blk.is_free);
    blk.is_free = false;

    let remaining = blk.size - size;
    blk.size = size;

    if remaining > S::ZERO {
        let offset = blk.offset;
        let arena = blk.arena;
        let newblk = emplace_block(
            &mut bank.blocks,
            Block::new_free(offset + size, remaining, arena),
        );
        let BankData { blocks, arenas, .. } = bank;
        arenas[arena].blocks.insert_after(blocks, found, newblk);
        Some(newblk)
    } else {
        None
    }
}
