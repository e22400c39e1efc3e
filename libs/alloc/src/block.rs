// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::arena_allocator::UserHandle;
use crate::size::SizeType;
use crate::table::SparseTable;
use crate::vlist::{ListAdapter, ListNode};
use core::marker::PhantomData;

/// Overlay slot of a block record.
///
/// A block carries either the user handle of the live allocation occupying
/// it, or the free-structure links of the strategy that currently owns it.
/// Which variant is live is implied by the block's residency; the
/// projections below make a wrong read a bug that trips immediately instead
/// of silently misreading links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Payload<X> {
    /// The block is allocated; the caller's handle travels with it.
    User(UserHandle),
    /// The block sits in a strategy's free structure.
    Free(X),
}

impl<X: Default> Default for Payload<X> {
    fn default() -> Self {
        Payload::Free(X::default())
    }
}

/// A sub-range of an arena.
#[derive(Debug)]
pub struct Block<S, X> {
    pub(crate) offset: S,
    pub(crate) size: S,
    /// Dense id of the containing arena.
    pub(crate) arena: u32,
    /// Back-index of this record's own bank slot.
    pub(crate) self_idx: u32,
    pub(crate) payload: Payload<X>,
    /// Link through the containing arena's physical block order.
    pub(crate) arena_order: ListNode,
    pub(crate) is_slotted: bool,
    /// Scratch bit lent to strategies (the rb-tree keeps its color here).
    pub(crate) is_flagged: bool,
    pub(crate) is_free: bool,
    /// Allocation alignment as log2; `0` for granularity-aligned blocks.
    pub(crate) alignment: u8,
}

// === impl Block ===

impl<S: SizeType, X: Default> Block<S, X> {
    pub(crate) fn new_free(offset: S, size: S, arena: u32) -> Self {
        Self {
            offset,
            size,
            arena,
            self_idx: 0,
            payload: Payload::default(),
            arena_order: ListNode::default(),
            is_slotted: false,
            is_flagged: false,
            is_free: true,
            alignment: 0,
        }
    }

    pub(crate) fn new_used(offset: S, size: S, arena: u32, user: UserHandle) -> Self {
        Self {
            offset,
            size,
            arena,
            self_idx: 0,
            payload: Payload::User(user),
            arena_order: ListNode::default(),
            is_slotted: false,
            is_flagged: false,
            is_free: false,
            alignment: 0,
        }
    }
}

impl<S: SizeType, X> Block<S, X> {
    /// First aligned position inside the block; what the caller was handed.
    pub(crate) fn adjusted_offset(&self) -> S {
        self.offset.align_up(S::ONE << u32::from(self.alignment))
    }

    /// Strategy-owned links. The payload must currently be [`Payload::Free`].
    pub(crate) fn ext(&self) -> &X {
        match &self.payload {
            Payload::Free(ext) => ext,
            Payload::User(_) => unreachable!("block payload is owned by an allocation"),
        }
    }

    pub(crate) fn ext_mut(&mut self) -> &mut X {
        match &mut self.payload {
            Payload::Free(ext) => ext,
            Payload::User(_) => unreachable!("block payload is owned by an allocation"),
        }
    }

    /// The owning allocation's user handle. The payload must currently be
    /// [`Payload::User`].
    pub(crate) fn user(&self) -> UserHandle {
        match self.payload {
            Payload::User(user) => user,
            Payload::Free(_) => unreachable!("block payload is owned by a strategy"),
        }
    }
}

pub type BlockBank<S, X> = SparseTable<Block<S, X>>;

/// Inserts a block record and stamps its self back-index.
pub(crate) fn emplace_block<S: SizeType, X>(bank: &mut BlockBank<S, X>, block: Block<S, X>) -> u32 {
    let id = bank.emplace(block);
    bank[id].self_idx = id;
    id
}

/// Threads the arena-order list through block records.
pub(crate) struct BlockListAdapter<S, X>(PhantomData<fn(S, X)>);

impl<S: SizeType, X> ListAdapter for BlockListAdapter<S, X> {
    type Bank = BlockBank<S, X>;

    fn node(bank: &Self::Bank, id: u32) -> &ListNode {
        &bank[id].arena_order
    }

    fn node_mut(bank: &mut Self::Bank, id: u32) -> &mut ListNode {
        &mut bank[id].arena_order
    }

    fn release(bank: &mut Self::Bank, id: u32) {
        bank.erase(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjusted_offset_respects_alignment() {
        let mut blk: Block<u32, ()> = Block::new_free(68, 188, 1);
        blk.alignment = 6; // 64-byte alignment
        assert_eq!(blk.adjusted_offset(), 128);

        blk.alignment = 0;
        assert_eq!(blk.adjusted_offset(), 68);
    }

    #[test]
    #[should_panic(expected = "owned by an allocation")]
    fn ext_of_used_block_trips() {
        let blk: Block<u32, u32> = Block::new_used(0, 16, 1, 7);
        let _ = blk.ext();
    }
}
