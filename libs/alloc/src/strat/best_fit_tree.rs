// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{BankData, BlockBank, Strategy, commit_split};
use crate::rbtree::{RbTree, TreeAdapter, TreeLinks};
use crate::size::SizeType;
use core::marker::PhantomData;

/// Best-fit placement over a red-black tree keyed on block size.
///
/// `try_allocate` is a `lower_bound` lookup; ties between equal sizes are
/// broken by insertion order. The tree links are threaded through the block
/// payloads, the color bit through the block flag bit, so the strategy
/// allocates nothing itself.
#[derive(Debug, Default)]
pub struct BestFitTree<S: SizeType> {
    tree: RbTree<BlockTreeAdapter<S>>,
}

struct BlockTreeAdapter<S>(PhantomData<fn(S)>);

impl<S: SizeType> TreeAdapter for BlockTreeAdapter<S> {
    type Bank = BlockBank<S, TreeLinks>;
    type Key = S;

    fn links(bank: &Self::Bank, id: u32) -> &TreeLinks {
        bank[id].ext()
    }

    fn links_mut(bank: &mut Self::Bank, id: u32) -> &mut TreeLinks {
        bank[id].ext_mut()
    }

    fn key(bank: &Self::Bank, id: u32) -> S {
        bank[id].size
    }

    fn is_red(bank: &Self::Bank, id: u32) -> bool {
        bank[id].is_flagged
    }

    fn set_red(bank: &mut Self::Bank, id: u32, red: bool) {
        bank[id].is_flagged = red;
    }
}

// === impl BestFitTree ===

impl<S: SizeType> Strategy<S> for BestFitTree<S> {
    type Extension = TreeLinks;
    type Cursor = u32;

    fn try_allocate(&self, bank: &BankData<S, TreeLinks>, size: S) -> Option<u32> {
        let found = self.tree.lower_bound(&bank.blocks, size);
        (found != 0).then_some(found)
    }

    fn commit(&mut self, bank: &mut BankData<S, TreeLinks>, size: S, found: u32) -> u32 {
        self.tree.remove(&mut bank.blocks, found);
        if let Some(remainder) = commit_split(bank, found, size) {
            self.tree.insert(&mut bank.blocks, remainder);
        }
        found
    }

    fn add_free(&mut self, blocks: &mut BlockBank<S, TreeLinks>, block: u32) {
        self.tree.insert(blocks, block);
    }

    fn grow_free_node(&mut self, blocks: &mut BlockBank<S, TreeLinks>, block: u32, new_size: S) {
        self.tree.remove(blocks, block);
        blocks[block].size = new_size;
        self.tree.insert(blocks, block);
    }

    fn replace_and_grow(
        &mut self,
        blocks: &mut BlockBank<S, TreeLinks>,
        block: u32,
        new_block: u32,
        new_size: S,
    ) {
        self.tree.remove(blocks, block);
        blocks[new_block].size = new_size;
        self.tree.insert(blocks, new_block);
    }

    fn erase(&mut self, blocks: &mut BlockBank<S, TreeLinks>, block: u32) {
        self.tree.remove(blocks, block);
    }

    fn total_free_nodes(&self, _blocks: &BlockBank<S, TreeLinks>) -> u32 {
        self.tree.len()
    }

    fn total_free_size(&self, blocks: &BlockBank<S, TreeLinks>) -> S {
        let mut total = S::ZERO;
        self.tree.for_each(blocks, &mut |id| total += blocks[id].size);
        total
    }

    fn validate_integrity(&self, blocks: &BlockBank<S, TreeLinks>) {
        self.tree.validate(blocks);
        self.tree.for_each(blocks, &mut |id| {
            assert!(blocks[id].is_free, "tree holds a non-free block");
        });
    }
}
