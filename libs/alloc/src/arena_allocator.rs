// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::arena::{Arena, BankData};
use crate::block::{Block, Payload, emplace_block};
use crate::handle::{AllocId, ArenaId};
use crate::size::SizeType;
use crate::stats::{NoStats, StatsPolicy};
use crate::strat::Strategy;
use core::fmt;

/// Caller-owned handle that travels with allocations and arenas through the
/// [`MemoryManager`] callbacks. Opaque to the allocator.
pub type UserHandle = u64;

bitflags::bitflags! {
    /// Per-allocation options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// The allocation may be relocated by [`ArenaAllocator::defragment`].
        const DEFRAG = 1 << 0;
        /// Give the allocation an arena of its own, sized exactly to it;
        /// releasing it frees the whole arena.
        const DEDICATED_ARENA = 1 << 1;
    }
}

/// An allocation request.
#[derive(Debug, Clone, Copy)]
pub struct AllocDesc<S> {
    size: S,
    /// Requested alignment in bytes; must be a power of two. Anything at or
    /// below the strategy's granularity costs nothing.
    alignment: S,
    user: UserHandle,
    flags: AllocFlags,
}

// === impl AllocDesc ===

impl<S: SizeType> AllocDesc<S> {
    pub fn new(size: S) -> Self {
        Self {
            size,
            alignment: S::ONE,
            user: 0,
            flags: AllocFlags::empty(),
        }
    }

    #[must_use]
    pub fn with_alignment(mut self, alignment: S) -> Self {
        debug_assert!(alignment > S::ZERO && alignment & (alignment - S::ONE) == S::ZERO);
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: UserHandle) -> Self {
        self.user = user;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A successful allocation: the provider handle of the arena, the aligned
/// offset inside it, and the handle to release it with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation<S> {
    pub arena: UserHandle,
    pub offset: S,
    pub id: AllocId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The memory manager could not provide a new arena.
    ArenaSourceExhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ArenaSourceExhausted => f.write_str("memory manager is out of arenas"),
        }
    }
}

impl core::error::Error for AllocError {}

/// The provider the allocator sits on: notified around arena and allocation
/// events, and asked to carry out the actual data moves during
/// defragmentation.
///
/// Every method has a no-op default, so a manager only implements what it
/// cares about. A typical implementation maps arenas to OS virtual
/// allocations and does a `memmove` in [`move_memory`].
///
/// [`move_memory`]: MemoryManager::move_memory
pub trait MemoryManager<S: SizeType> {
    /// A new arena of `size` bytes is needed; returns the provider-side
    /// handle for it, or `None` when memory is exhausted.
    fn add_arena(&mut self, id: ArenaId, size: S) -> Option<UserHandle> {
        let _ = size;
        Some(UserHandle::from(id.0))
    }

    /// The arena became entirely free; returning `true` authorizes tearing
    /// it down.
    fn drop_arena(&mut self, arena: UserHandle) -> bool {
        let _ = arena;
        true
    }

    /// Actually release the provider memory behind a torn-down arena.
    fn remove_arena(&mut self, arena: UserHandle) {
        let _ = arena;
    }

    fn begin_defragment(&mut self) {}

    fn end_defragment(&mut self) {}

    /// Move `size` bytes of live data between (or within) arenas.
    fn move_memory(&mut self, src_arena: UserHandle, dst_arena: UserHandle, from: S, to: S, size: S) {
        let _ = (src_arena, dst_arena, from, to, size);
    }

    /// A relocation changed where `user`'s allocation lives.
    fn rebind_alloc(&mut self, user: UserHandle, info: Allocation<S>) {
        let _ = (user, info);
    }
}

/// The all-defaults manager; useful for tests and size-only accounting.
impl<S: SizeType> MemoryManager<S> for () {}

/// A coalescing, defragmenting arena allocator.
///
/// Hands out sub-ranges of provider-backed arenas. Adjacent free blocks are
/// merged eagerly on [`deallocate`](ArenaAllocator::deallocate), so a free
/// block is never followed by another free block within an arena.
/// Allocations flagged [`AllocFlags::DEFRAG`] may be slid toward lower
/// offsets by [`defragment`](ArenaAllocator::defragment) to consolidate
/// free space.
///
/// Single-threaded; callers serialize externally.
pub struct ArenaAllocator<St, M, S = u32, P = NoStats>
where
    S: SizeType,
    St: Strategy<S>,
    M: MemoryManager<S>,
    P: StatsPolicy,
{
    bank: BankData<S, St::Extension>,
    strategy: St,
    manager: M,
    arena_size: S,
    stats: P,
}

// === impl ArenaAllocator ===

impl<St, M, S, P> ArenaAllocator<St, M, S, P>
where
    S: SizeType,
    St: Strategy<S>,
    M: MemoryManager<S>,
    P: StatsPolicy,
{
    /// Creates an allocator that grows in arenas of `arena_size` bytes
    /// (rounded up to the strategy's granularity).
    pub fn new(arena_size: S, manager: M) -> Self {
        Self {
            bank: BankData::new(),
            strategy: St::default(),
            manager,
            arena_size: arena_size.align_up(Self::granularity()),
            stats: P::default(),
        }
    }

    fn granularity() -> S {
        S::from_u32(St::MIN_GRANULARITY)
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut M {
        &mut self.manager
    }

    pub fn stats(&self) -> &P {
        &self.stats
    }

    /// Total free bytes across all arenas.
    pub fn total_free_size(&self) -> S {
        self.bank.free_size
    }

    /// Number of blocks currently registered free.
    pub fn total_free_nodes(&self) -> u32 {
        self.strategy.total_free_nodes(&self.bank.blocks)
    }

    /// Number of live arenas.
    pub fn arena_count(&self) -> u32 {
        self.bank.arenas.len() - 1 // minus the sentinel
    }

    /// Rounds a request up to the granularity and adds the alignment slack.
    /// Returns `(adjusted_size, alignment_bits)`.
    fn adjust(desc_size: S, alignment: S) -> (S, u8) {
        let granularity = Self::granularity();
        let mut size = desc_size.align_up(granularity);
        if size == S::ZERO {
            size = granularity;
        }

        if alignment > granularity {
            // reserve enough that the first aligned position plus the
            // request always fits, wherever the block ends up
            let bits = alignment.as_u64().trailing_zeros() as u8;
            (size + alignment - granularity, bits)
        } else {
            (size, 0)
        }
    }

    /// Allocates per `desc`. Never fails while the manager can provide
    /// arenas; grows by adding one when no strategy candidate fits.
    pub fn allocate(&mut self, desc: AllocDesc<S>) -> Result<Allocation<S>, AllocError> {
        let (size, alignment_bits) = Self::adjust(desc.size, desc.alignment);

        if desc.flags.contains(AllocFlags::DEDICATED_ARENA) {
            return self.allocate_dedicated(size, alignment_bits, desc);
        }

        let cursor = match self.strategy.try_allocate(&self.bank, size) {
            Some(cursor) => cursor,
            None => {
                let grow_by = size.max(self.arena_size);
                self.add_arena(grow_by, true)?;
                match self.strategy.try_allocate(&self.bank, size) {
                    Some(cursor) => cursor,
                    // a fresh arena of at least `size` bytes is registered,
                    // a strategy that misses it is broken
                    None => unreachable!("strategy failed on a fresh arena"),
                }
            }
        };

        let block = self.strategy.commit(&mut self.bank, size, cursor);
        let blk = &mut self.bank.blocks[block];
        blk.alignment = alignment_bits;
        blk.payload = Payload::User(desc.user);
        blk.is_flagged = desc.flags.contains(AllocFlags::DEFRAG);
        let arena = blk.arena;
        let offset = blk.adjusted_offset();

        self.bank.arenas[arena].free -= size;
        self.bank.free_size -= size;
        self.stats.report_allocate(size.as_u64());

        Ok(Allocation {
            arena: self.bank.arenas[arena].data,
            offset,
            id: self.handle_for(block),
        })
    }

    fn allocate_dedicated(
        &mut self,
        size: S,
        alignment_bits: u8,
        desc: AllocDesc<S>,
    ) -> Result<Allocation<S>, AllocError> {
        let (arena, block) = self.add_arena(size, false)?;

        let blk = &mut self.bank.blocks[block];
        blk.alignment = alignment_bits;
        blk.payload = Payload::User(desc.user);
        blk.is_flagged = false; // a dedicated arena never participates in defrag
        let offset = blk.adjusted_offset();

        self.stats.report_allocate(size.as_u64());

        Ok(Allocation {
            arena: self.bank.arenas[arena].data,
            offset,
            id: self.handle_for(block),
        })
    }

    /// Releases an allocation, coalescing with free neighbours. Returns
    /// `true` when the containing arena became empty and was torn down.
    ///
    /// Passing a stale handle is detected in debug builds.
    pub fn deallocate(&mut self, id: AllocId) -> bool {
        let node = id.index();
        debug_assert_eq!(
            id.generation(),
            self.bank.blocks.generation(node),
            "stale allocation handle"
        );

        let blk = &mut self.bank.blocks[node];
        debug_assert!(!blk.is_free, "double free");
        let size = blk.size;
        let arena_idx = blk.arena;

        blk.is_free = true;
        blk.is_flagged = false;
        blk.payload = Payload::default();

        self.stats.report_deallocate(size.as_u64());

        let BankData {
            blocks,
            arenas,
            arena_order,
            free_size,
        } = &mut self.bank;

        let arena = &mut arenas[arena_idx];
        arena.free += size;
        *free_size += size;

        // a neighbour coalesces iff it exists and is free
        let order = blocks[node].arena_order;
        let mut left = 0;
        let mut right = 0;
        if node != arena.blocks.front() && blocks[order.prev].is_free {
            left = order.prev;
        }
        if node != arena.blocks.back() && blocks[order.next].is_free {
            right = order.next;
        }

        if arena.free == arena.size {
            let data = arena.data;
            if self.manager.drop_arena(data) {
                if left != 0 {
                    self.strategy.erase(blocks, left);
                }
                if right != 0 {
                    self.strategy.erase(blocks, right);
                }
                *free_size -= arena.size;
                arena.blocks.clear(blocks);
                arena_order.erase(arenas, arena_idx);
                self.manager.remove_arena(data);
                log::debug!("arena {arena_idx} retired");
                return true;
            }
        }

        match (left != 0, right != 0) {
            (false, false) => {
                self.strategy.add_free(blocks, node);
            }
            (true, false) => {
                let merged = blocks[left].size + size;
                self.strategy.grow_free_node(blocks, left, merged);
                arena.blocks.erase(blocks, node);
            }
            (false, true) => {
                let merged = blocks[right].size + size;
                self.strategy.replace_and_grow(blocks, right, node, merged);
                arena.blocks.erase(blocks, right);
            }
            (true, true) => {
                let merged = blocks[left].size + blocks[right].size + size;
                self.strategy.erase(blocks, right);
                self.strategy.grow_free_node(blocks, left, merged);
                arena.blocks.erase2(blocks, node);
            }
        }

        false
    }

    /// Consolidates free space by sliding every relocatable
    /// ([`AllocFlags::DEFRAG`]) allocation toward lower offsets, arena by
    /// arena. Pinned allocations stay put and are worked around. Arenas
    /// that end up entirely free are offered to the manager for teardown.
    ///
    /// Quiescent allocators defragment to a fixed point: running this twice
    /// in a row performs no moves the second time.
    pub fn defragment(&mut self) {
        self.manager.begin_defragment();

        let mut arena_idx = self.bank.arena_order.front();
        while arena_idx != 0 {
            let next_arena = self.bank.arenas[arena_idx].order.next;
            self.defragment_arena(arena_idx);
            arena_idx = next_arena;
        }

        self.manager.end_defragment();
    }

    fn defragment_arena(&mut self, arena_idx: u32) {
        let BankData {
            blocks,
            arenas,
            arena_order,
            free_size,
        } = &mut self.bank;
        let arena = &mut arenas[arena_idx];

        let mut cur = arena.blocks.front();
        while cur != 0 {
            if !blocks[cur].is_free {
                cur = blocks[cur].arena_order.next;
                continue;
            }

            let used = blocks[cur].arena_order.next;
            if used == 0 {
                // trailing free block, nothing left to slide
                break;
            }
            debug_assert!(!blocks[used].is_free, "free blocks must be coalesced");

            if !blocks[used].is_flagged {
                // pinned; work around it
                cur = blocks[used].arena_order.next;
                continue;
            }

            // slide the used block into the free block's place and let the
            // free block trail it
            let hole = blocks[cur].offset;
            let used_size = blocks[used].size;
            let from = blocks[used].adjusted_offset();
            blocks[used].offset = hole;
            blocks[cur].offset = hole + used_size;
            let to = blocks[used].adjusted_offset();

            arena.blocks.unlink(blocks, cur);
            arena.blocks.insert_after(blocks, used, cur);

            let moved = payload_size(&blocks[used], Self::granularity());
            self.manager.move_memory(arena.data, arena.data, from, to, moved);
            log::trace!(
                "arena {arena_idx}: slid block {used} from {from:?} to {to:?} ({moved:?} bytes)"
            );

            let user = blocks[used].user();
            let info = Allocation {
                arena: arena.data,
                offset: to,
                id: AllocId::pack(used, blocks.generation(used)),
            };
            self.manager.rebind_alloc(user, info);

            // fuse the trailing free block with what follows, if free
            let after = blocks[cur].arena_order.next;
            if after != 0 && blocks[after].is_free {
                let merged = blocks[cur].size + blocks[after].size;
                self.strategy.erase(blocks, after);
                self.strategy.grow_free_node(blocks, cur, merged);
                arena.blocks.erase(blocks, after);
            }
            // revisit `cur`: the next block over may slide as well
        }

        // a fully free arena can be retired now
        if arena.free == arena.size && arena.blocks.front() != 0 {
            let data = arena.data;
            if self.manager.drop_arena(data) {
                let block = arena.blocks.front();
                debug_assert_eq!(blocks[block].arena_order.next, 0);
                self.strategy.erase(blocks, block);
                *free_size -= arena.size;
                arena.blocks.clear(blocks);
                arena_order.erase(arenas, arena_idx);
                self.manager.remove_arena(data);
                log::debug!("arena {arena_idx} retired during defragment");
            }
        }
    }

    /// Asserts every allocator invariant: per-arena block ordering with no
    /// gaps, size accounting, eager coalescing, and the strategy's own
    /// structure.
    pub fn validate_integrity(&self) {
        let bank = &self.bank;
        let mut counted_free_nodes = 0;
        let mut counted_free_size = S::ZERO;

        let mut arena_idx = bank.arena_order.front();
        while arena_idx != 0 {
            let arena = &bank.arenas[arena_idx];
            let mut expected_offset = S::ZERO;
            let mut arena_free = S::ZERO;
            let mut prev_was_free = false;

            assert!(arena.blocks.front() != 0, "live arena without blocks");
            for block in arena.blocks.iter(&bank.blocks) {
                let blk = &bank.blocks[block];
                assert_eq!(blk.self_idx, block, "corrupted self back-index");
                assert_eq!(blk.arena, arena_idx, "block in the wrong arena");
                assert_eq!(blk.offset, expected_offset, "gap or overlap in arena order");
                expected_offset += blk.size;

                if blk.is_free {
                    assert!(!prev_was_free, "adjacent free blocks were not coalesced");
                    counted_free_nodes += 1;
                    counted_free_size += blk.size;
                    arena_free += blk.size;
                }
                prev_was_free = blk.is_free;
            }

            assert_eq!(expected_offset, arena.size, "block sizes do not sum to the arena size");
            assert_eq!(arena_free, arena.free, "arena free-size accounting is off");
            arena_idx = arena.order.next;
        }

        assert_eq!(
            counted_free_nodes,
            self.strategy.total_free_nodes(&bank.blocks),
            "strategy node count disagrees with the arena walk"
        );
        assert_eq!(
            counted_free_size,
            self.strategy.total_free_size(&bank.blocks),
            "strategy free size disagrees with the arena walk"
        );
        assert_eq!(counted_free_size, bank.free_size, "global free-size accounting is off");

        self.strategy.validate_integrity(&bank.blocks);
    }

    fn handle_for(&self, block: u32) -> AllocId {
        AllocId::pack(block, self.bank.blocks.generation(block))
    }

    /// Creates an arena of `size` bytes. `empty` decides whether its single
    /// spanning block starts free (registered with the strategy) or used
    /// (the dedicated-arena path).
    fn add_arena(&mut self, size: S, empty: bool) -> Result<(u32, u32), AllocError> {
        let arena_idx = self.bank.arenas.emplace(Arena {
            size,
            free: if empty { size } else { S::ZERO },
            ..Arena::default()
        });

        let id = ArenaId::pack(arena_idx, self.bank.arenas.generation(arena_idx));
        let Some(data) = self.manager.add_arena(id, size) else {
            self.bank.arenas.erase(arena_idx);
            return Err(AllocError::ArenaSourceExhausted);
        };
        self.bank.arenas[arena_idx].data = data;

        let block = emplace_block(
            &mut self.bank.blocks,
            if empty {
                Block::new_free(S::ZERO, size, arena_idx)
            } else {
                Block::new_used(S::ZERO, size, arena_idx, 0)
            },
        );

        let BankData {
            blocks,
            arenas,
            arena_order,
            free_size,
        } = &mut self.bank;
        arenas[arena_idx].blocks.push_back(blocks, block);
        arena_order.push_back(arenas, arena_idx);

        if empty {
            *free_size += size;
            self.strategy.add_free_arena(blocks, block);
        }

        self.stats.report_new_arena();
        log::debug!("created arena {arena_idx} ({size:?} bytes, empty: {empty})");

        Ok((arena_idx, block))
    }
}

impl<St, M, S, P> fmt::Debug for ArenaAllocator<St, M, S, P>
where
    S: SizeType,
    St: Strategy<S> + fmt::Debug,
    M: MemoryManager<S>,
    P: StatsPolicy,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaAllocator")
            .field("arena_size", &self.arena_size)
            .field("arenas", &self.arena_count())
            .field("free_size", &self.bank.free_size)
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Length of the caller-visible bytes of a used block: everything past the
/// alignment slack.
fn payload_size<S: SizeType, X>(blk: &Block<S, X>, granularity: S) -> S {
    if blk.alignment == 0 {
        blk.size
    } else {
        let alignment = S::ONE << u32::from(blk.alignment);
        blk.size - (alignment - granularity)
    }
}
