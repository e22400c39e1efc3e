// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::arena_allocator::UserHandle;
use crate::block::{Block, BlockBank, BlockListAdapter};
use crate::size::SizeType;
use crate::table::Table;
use crate::vlist::{ListAdapter, ListNode, VList};
use core::marker::PhantomData;

/// A contiguous range obtained from the memory manager, subdivided into
/// blocks.
///
/// Invariants: `blocks` is ordered by strictly increasing offset with no
/// gaps, block sizes sum to `size`, and `free` is the sum of the sizes of
/// the free blocks.
#[derive(Debug)]
pub(crate) struct Arena<S: SizeType, X> {
    /// Physical block order.
    pub(crate) blocks: VList<BlockListAdapter<S, X>>,
    /// Link through the allocator's arena order.
    pub(crate) order: ListNode,
    pub(crate) size: S,
    pub(crate) free: S,
    /// Provider-side handle returned by [`MemoryManager::add_arena`].
    ///
    /// [`MemoryManager::add_arena`]: crate::MemoryManager::add_arena
    pub(crate) data: UserHandle,
}

impl<S: SizeType, X> Default for Arena<S, X> {
    fn default() -> Self {
        Self {
            blocks: VList::new(),
            order: ListNode::default(),
            size: S::ZERO,
            free: S::ZERO,
            data: UserHandle::MAX,
        }
    }
}

pub(crate) type ArenaBank<S, X> = Table<Arena<S, X>>;

/// Threads the arena order through arena records.
pub(crate) struct ArenaListAdapter<S, X>(PhantomData<fn(S, X)>);

impl<S: SizeType, X> ListAdapter for ArenaListAdapter<S, X> {
    type Bank = ArenaBank<S, X>;

    fn node(bank: &Self::Bank, id: u32) -> &ListNode {
        &bank[id].order
    }

    fn node_mut(bank: &mut Self::Bank, id: u32) -> &mut ListNode {
        &mut bank[id].order
    }

    fn release(bank: &mut Self::Bank, id: u32) {
        bank.erase(id);
    }
}

/// The complete bookkeeping state shared between the allocator front end and
/// its placement strategy.
#[derive(Debug)]
pub struct BankData<S: SizeType, X> {
    pub(crate) blocks: BlockBank<S, X>,
    pub(crate) arenas: ArenaBank<S, X>,
    pub(crate) arena_order: VList<ArenaListAdapter<S, X>>,
    /// Total free bytes across all arenas.
    pub(crate) free_size: S,
}

// === impl BankData ===

impl<S: SizeType, X: Default> BankData<S, X> {
    pub(crate) fn new() -> Self {
        let mut blocks = BlockBank::new();
        let mut arenas = ArenaBank::new();

        // slot 0 of both banks is the sentinel; intrusive links treat id 0
        // as null
        let root = blocks.emplace(Block::new_free(S::ZERO, S::ZERO, 0));
        debug_assert!(root == 0);
        let root = arenas.emplace(Arena::default());
        debug_assert!(root == 0);

        Self {
            blocks,
            arenas,
            arena_order: VList::new(),
            free_size: S::ZERO,
        }
    }
}
