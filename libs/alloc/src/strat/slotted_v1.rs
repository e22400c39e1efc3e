// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::slotted_v0::class_of;
use super::{BankData, BlockBank, ListNode, Strategy, commit_split};
use crate::size::SizeType;
use alloc::vec::Vec;
use core::marker::PhantomData;

/// Size-classed placement with an intrusive list per bucket.
///
/// Same classing as [`SlottedArray`](super::SlottedArray), but buckets are
/// unbounded doubly-linked lists threaded through the block payloads, so
/// there is no overflow path.
#[derive(Debug)]
pub struct SlottedList<
    S: SizeType,
    const GRANULARITY: u32 = 256,
    const MAX_BUCKET: usize = 255,
> {
    /// Head block id per size class, classes `0..=MAX_BUCKET`.
    heads: Vec<u32>,
    _marker: PhantomData<fn(S)>,
}

impl<S: SizeType, const G: u32, const MB: usize> Default for SlottedList<S, G, MB> {
    fn default() -> Self {
        Self {
            heads: alloc::vec![0; MB + 1],
            _marker: PhantomData,
        }
    }
}

// === impl SlottedList ===

impl<S: SizeType, const G: u32, const MB: usize> SlottedList<S, G, MB> {
    fn class_of(size: S) -> usize {
        class_of(size, G, MB)
    }

    fn push_front(&mut self, blocks: &mut BlockBank<S, ListNode>, class: usize, block: u32) {
        let head = self.heads[class];
        *blocks[block].ext_mut() = ListNode {
            next: head,
            prev: 0,
        };
        if head != 0 {
            blocks[head].ext_mut().prev = block;
        }
        self.heads[class] = block;
        blocks[block].is_slotted = true;
    }

    fn unlink(&mut self, blocks: &mut BlockBank<S, ListNode>, class: usize, block: u32) {
        let links = *blocks[block].ext();
        if links.next != 0 {
            blocks[links.next].ext_mut().prev = links.prev;
        }
        if links.prev != 0 {
            blocks[links.prev].ext_mut().next = links.next;
        } else {
            debug_assert_eq!(self.heads[class], block);
            self.heads[class] = links.next;
        }
        *blocks[block].ext_mut() = ListNode::default();
        blocks[block].is_slotted = false;
    }
}

impl<S: SizeType, const G: u32, const MB: usize> Strategy<S> for SlottedList<S, G, MB> {
    type Extension = ListNode;
    type Cursor = u32;

    fn try_allocate(&self, bank: &BankData<S, ListNode>, size: S) -> Option<u32> {
        let class = Self::class_of(size);

        for (k, &head) in self.heads.iter().enumerate().skip(class) {
            let need_check = k == class || k == MB;
            let mut cur = head;
            while cur != 0 {
                let blk = &bank.blocks[cur];
                if !need_check || blk.size >= size {
                    return Some(cur);
                }
                cur = blk.ext().next;
            }
        }
        None
    }

    fn commit(&mut self, bank: &mut BankData<S, ListNode>, size: S, found: u32) -> u32 {
        self.erase(&mut bank.blocks, found);
        if let Some(remainder) = commit_split(bank, found, size) {
            self.add_free(&mut bank.blocks, remainder);
        }
        found
    }

    fn add_free(&mut self, blocks: &mut BlockBank<S, ListNode>, block: u32) {
        let class = Self::class_of(blocks[block].size);
        self.push_front(blocks, class, block);
    }

    fn grow_free_node(&mut self, blocks: &mut BlockBank<S, ListNode>, block: u32, new_size: S) {
        self.erase(blocks, block);
        blocks[block].size = new_size;
        self.add_free(blocks, block);
    }

    fn replace_and_grow(
        &mut self,
        blocks: &mut BlockBank<S, ListNode>,
        block: u32,
        new_block: u32,
        new_size: S,
    ) {
        self.erase(blocks, block);
        blocks[new_block].size = new_size;
        self.add_free(blocks, new_block);
    }

    fn erase(&mut self, blocks: &mut BlockBank<S, ListNode>, block: u32) {
        let class = Self::class_of(blocks[block].size);
        self.unlink(blocks, class, block);
    }

    fn total_free_nodes(&self, blocks: &BlockBank<S, ListNode>) -> u32 {
        let mut count = 0;
        for &head in &self.heads {
            let mut cur = head;
            while cur != 0 {
                count += 1;
                cur = blocks[cur].ext().next;
            }
        }
        count
    }

    fn total_free_size(&self, blocks: &BlockBank<S, ListNode>) -> S {
        let mut total = S::ZERO;
        for &head in &self.heads {
            let mut cur = head;
            while cur != 0 {
                let blk = &blocks[cur];
                total += blk.size;
                cur = blk.ext().next;
            }
        }
        total
    }

    fn validate_integrity(&self, blocks: &BlockBank<S, ListNode>) {
        for (class, &head) in self.heads.iter().enumerate() {
            let mut prev = 0;
            let mut cur = head;
            while cur != 0 {
                let blk = &blocks[cur];
                assert!(blk.is_free, "bucket holds a non-free block");
                assert!(blk.is_slotted, "bucket member not marked slotted");
                assert_eq!(Self::class_of(blk.size), class, "block in wrong bucket");
                assert_eq!(blk.ext().prev, prev, "broken back link");
                prev = cur;
                cur = blk.ext().next;
            }
        }
    }
}
