// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::slotted_v0::class_of;
use super::{BankData, BlockBank, ListNode, Strategy, commit_split};
use crate::rbtree::{RbTree, TreeAdapter, TreeLinks};
use crate::size::SizeType;
use alloc::vec::Vec;
use core::marker::PhantomData;

/// Payload of blocks managed by [`SlottedFallback`]: bucket list links plus
/// the links of the fallback tree. Only one of the two is live at a time,
/// depending on which home (`is_slotted`) holds the block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlottedExt {
    pub(crate) list: ListNode,
    pub(crate) tree: TreeLinks,
}

/// The free set backing [`SlottedFallback`]'s saturated top size class.
pub trait Backstop<S: SizeType>: Default + core::fmt::Debug {
    /// Best candidate of at least `size` bytes, or `None`.
    fn try_allocate(&self, blocks: &BlockBank<S, SlottedExt>, size: S) -> Option<u32>;
    fn insert(&mut self, blocks: &mut BlockBank<S, SlottedExt>, block: u32);
    fn remove(&mut self, blocks: &mut BlockBank<S, SlottedExt>, block: u32);
    fn count(&self) -> u32;
    fn total_size(&self, blocks: &BlockBank<S, SlottedExt>) -> S;
    fn validate(&self, blocks: &BlockBank<S, SlottedExt>);
}

/// Best-fit red-black tree backstop (the default).
#[derive(Debug, Default)]
pub struct TreeBackstop<S: SizeType> {
    tree: RbTree<FallbackTreeAdapter<S>>,
}

struct FallbackTreeAdapter<S>(PhantomData<fn(S)>);

impl<S: SizeType> TreeAdapter for FallbackTreeAdapter<S> {
    type Bank = BlockBank<S, SlottedExt>;
    type Key = S;

    fn links(bank: &Self::Bank, id: u32) -> &TreeLinks {
        &bank[id].ext().tree
    }

    fn links_mut(bank: &mut Self::Bank, id: u32) -> &mut TreeLinks {
        &mut bank[id].ext_mut().tree
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

impl<S: SizeType> Backstop<S> for TreeBackstop<S> {
    fn try_allocate(&self, blocks: &BlockBank<S, SlottedExt>, size: S) -> Option<u32> {
        let found = self.tree.lower_bound(blocks, size);
        (found != 0).then_some(found)
    }

    fn insert(&mut self, blocks: &mut BlockBank<S, SlottedExt>, block: u32) {
        self.tree.insert(blocks, block);
    }

    fn remove(&mut self, blocks: &mut BlockBank<S, SlottedExt>, block: u32) {
        self.tree.remove(blocks, block);
    }

    fn count(&self) -> u32 {
        self.tree.len()
    }

    fn total_size(&self, blocks: &BlockBank<S, SlottedExt>) -> S {
        let mut total = S::ZERO;
        self.tree.for_each(blocks, &mut |id| total += blocks[id].size);
        total
    }

    fn validate(&self, blocks: &BlockBank<S, SlottedExt>) {
        self.tree.validate(blocks);
    }
}

/// First-fit list backstop, for populations too small to justify the tree.
#[derive(Debug)]
pub struct ListBackstop<S: SizeType> {
    head: u32,
    count: u32,
    _marker: PhantomData<fn(S)>,
}

impl<S: SizeType> Default for ListBackstop<S> {
    fn default() -> Self {
        Self {
            head: 0,
            count: 0,
            _marker: PhantomData,
        }
    }
}

impl<S: SizeType> Backstop<S> for ListBackstop<S> {
    fn try_allocate(&self, blocks: &BlockBank<S, SlottedExt>, size: S) -> Option<u32> {
        let mut cur = self.head;
        while cur != 0 {
            let blk = &blocks[cur];
            if blk.size >= size {
                return Some(cur);
            }
            cur = blk.ext().list.next;
        }
        None
    }

    fn insert(&mut self, blocks: &mut BlockBank<S, SlottedExt>, block: u32) {
        blocks[block].ext_mut().list = ListNode {
            next: self.head,
            prev: 0,
        };
        if self.head != 0 {
            blocks[self.head].ext_mut().list.prev = block;
        }
        self.head = block;
        self.count += 1;
    }

    fn remove(&mut self, blocks: &mut BlockBank<S, SlottedExt>, block: u32) {
        let links = blocks[block].ext().list;
        if links.next != 0 {
            blocks[links.next].ext_mut().list.prev = links.prev;
        }
        if links.prev != 0 {
            blocks[links.prev].ext_mut().list.next = links.next;
        } else {
            self.head = links.next;
        }
        blocks[block].ext_mut().list = ListNode::default();
        self.count -= 1;
    }

    fn count(&self) -> u32 {
        self.count
    }

    fn total_size(&self, blocks: &BlockBank<S, SlottedExt>) -> S {
        let mut total = S::ZERO;
        let mut cur = self.head;
        while cur != 0 {
            total += blocks[cur].size;
            cur = blocks[cur].ext().list.next;
        }
        total
    }

    fn validate(&self, blocks: &BlockBank<S, SlottedExt>) {
        let mut seen = 0;
        let mut prev = 0;
        let mut cur = self.head;
        while cur != 0 {
            let blk = &blocks[cur];
            assert!(blk.is_free, "backstop holds a non-free block");
            assert_eq!(blk.ext().list.prev, prev, "broken back link");
            seen += 1;
            prev = cur;
            cur = blk.ext().list.next;
        }
        assert_eq!(seen, self.count, "backstop count out of sync");
    }
}

/// Size-classed placement with a pluggable fallback for the top class.
///
/// Classes below the top behave like [`SlottedList`](super::SlottedList);
/// blocks of the saturated top class live in the [`Backstop`] instead,
/// where a best-fit pick matters because sizes are heterogeneous there.
/// `try_allocate` scans at most `SEARCH_WINDOW` bucket classes before
/// consulting the backstop, and sweeps the remaining buckets only as the
/// slow path, so free space is never missed. A freed block always rejoins
/// its natural home for its current size.
#[derive(Debug)]
pub struct SlottedFallback<
    S: SizeType,
    B: Backstop<S> = TreeBackstop<S>,
    const GRANULARITY: u32 = 256,
    const MAX_BUCKET: usize = 255,
    const SEARCH_WINDOW: usize = 4,
> {
    /// Head block id per size class, classes `0..MAX_BUCKET`.
    heads: Vec<u32>,
    backstop: B,
    _marker: PhantomData<fn(S)>,
}

impl<S: SizeType, B: Backstop<S>, const G: u32, const MB: usize, const SW: usize> Default
    for SlottedFallback<S, B, G, MB, SW>
{
    fn default() -> Self {
        Self {
            heads: alloc::vec![0; MB],
            backstop: B::default(),
            _marker: PhantomData,
        }
    }
}

// === impl SlottedFallback ===

impl<S: SizeType, B: Backstop<S>, const G: u32, const MB: usize, const SW: usize>
    SlottedFallback<S, B, G, MB, SW>
{
    fn class_of(size: S) -> usize {
        class_of(size, G, MB)
    }

    /// First fit within bucket `class`; `need_check` when members may be
    /// smaller than the request.
    fn scan_bucket(
        &self,
        blocks: &BlockBank<S, SlottedExt>,
        class: usize,
        size: S,
        need_check: bool,
    ) -> Option<u32> {
        let mut cur = self.heads[class];
        while cur != 0 {
            let blk = &blocks[cur];
            if !need_check || blk.size >= size {
                return Some(cur);
            }
            cur = blk.ext().list.next;
        }
        None
    }

    fn push_front(&mut self, blocks: &mut BlockBank<S, SlottedExt>, class: usize, block: u32) {
        let head = self.heads[class];
        blocks[block].ext_mut().list = ListNode {
            next: head,
            prev: 0,
        };
        if head != 0 {
            blocks[head].ext_mut().list.prev = block;
        }
        self.heads[class] = block;
        blocks[block].is_slotted = true;
    }

    fn unlink(&mut self, blocks: &mut BlockBank<S, SlottedExt>, class: usize, block: u32) {
        let links = blocks[block].ext().list;
        if links.next != 0 {
            blocks[links.next].ext_mut().list.prev = links.prev;
        }
        if links.prev != 0 {
            blocks[links.prev].ext_mut().list.next = links.next;
        } else {
            debug_assert_eq!(self.heads[class], block);
            self.heads[class] = links.next;
        }
        blocks[block].ext_mut().list = ListNode::default();
        blocks[block].is_slotted = false;
    }
}

impl<S: SizeType, B: Backstop<S>, const G: u32, const MB: usize, const SW: usize> Strategy<S>
    for SlottedFallback<S, B, G, MB, SW>
{
    type Extension = SlottedExt;
    type Cursor = u32;

    fn try_allocate(&self, bank: &BankData<S, SlottedExt>, size: S) -> Option<u32> {
        let class = Self::class_of(size);
        if class == MB {
            return self.backstop.try_allocate(&bank.blocks, size);
        }

        let window_end = (class + SW).min(MB);
        for k in class..window_end {
            if let Some(hit) = self.scan_bucket(&bank.blocks, k, size, k == class) {
                return Some(hit);
            }
        }

        if let Some(hit) = self.backstop.try_allocate(&bank.blocks, size) {
            return Some(hit);
        }

        // slow path: the window and the backstop both came up empty, sweep
        // the remaining buckets
        for k in window_end..MB {
            if let Some(hit) = self.scan_bucket(&bank.blocks, k, size, false) {
                return Some(hit);
            }
        }
        None
    }

    fn commit(&mut self, bank: &mut BankData<S, SlottedExt>, size: S, found: u32) -> u32 {
        self.erase(&mut bank.blocks, found);
        if let Some(remainder) = commit_split(bank, found, size) {
            self.add_free(&mut bank.blocks, remainder);
        }
        found
    }

    fn add_free(&mut self, blocks: &mut BlockBank<S, SlottedExt>, block: u32) {
        let class = Self::class_of(blocks[block].size);
        if class == MB {
            self.backstop.insert(blocks, block);
            blocks[block].is_slotted = false;
        } else {
            self.push_front(blocks, class, block);
        }
    }

    fn grow_free_node(&mut self, blocks: &mut BlockBank<S, SlottedExt>, block: u32, new_size: S) {
        self.erase(blocks, block);
        blocks[block].size = new_size;
        self.add_free(blocks, block);
    }

    fn replace_and_grow(
        &mut self,
        blocks: &mut BlockBank<S, SlottedExt>,
        block: u32,
        new_block: u32,
        new_size: S,
    ) {
        self.erase(blocks, block);
        blocks[new_block].size = new_size;
        self.add_free(blocks, new_block);
    }

    fn erase(&mut self, blocks: &mut BlockBank<S, SlottedExt>, block: u32) {
        if blocks[block].is_slotted {
            let class = Self::class_of(blocks[block].size);
            self.unlink(blocks, class, block);
        } else {
            self.backstop.remove(blocks, block);
        }
    }

    fn total_free_nodes(&self, blocks: &BlockBank<S, SlottedExt>) -> u32 {
        let mut count = self.backstop.count();
        for &head in &self.heads {
            let mut cur = head;
            while cur != 0 {
                count += 1;
                cur = blocks[cur].ext().list.next;
            }
        }
        count
    }

    fn total_free_size(&self, blocks: &BlockBank<S, SlottedExt>) -> S {
        let mut total = self.backstop.total_size(blocks);
        for &head in &self.heads {
            let mut cur = head;
            while cur != 0 {
                total += blocks[cur].size;
                cur = blocks[cur].ext().list.next;
            }
        }
        total
    }

    fn validate_integrity(&self, blocks: &BlockBank<S, SlottedExt>) {
        for (class, &head) in self.heads.iter().enumerate() {
            let mut prev = 0;
            let mut cur = head;
            while cur != 0 {
                let blk = &blocks[cur];
                assert!(blk.is_free, "bucket holds a non-free block");
                assert!(blk.is_slotted, "bucket member not marked slotted");
                assert_eq!(Self::class_of(blk.size), class, "block in wrong bucket");
                assert_eq!(blk.ext().list.prev, prev, "broken back link");
                prev = cur;
                cur = blk.ext().list.next;
            }
        }
        self.backstop.validate(blocks);
    }
}
