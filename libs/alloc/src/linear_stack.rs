// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::linear::{GlobalHeap, UnderlyingAllocator};
use crate::linear_arena::LinearArenaAllocator;
use crate::stats::{NoStats, StatsPolicy};
use core::ops::{Deref, DerefMut};

/// A position in a [`LinearStackAllocator`]'s history that can be rewound
/// to. Rewinding is O(arenas).
#[derive(Debug, Clone, Copy)]
pub struct RewindPoint {
    arena: usize,
    left_over: usize,
}

/// [`LinearArenaAllocator`] plus explicit rewind points and RAII scopes.
///
/// Intended for strictly nested temporary allocations: take a
/// [`rewind_point`](Self::rewind_point) (or open a [`scope`](Self::scope)),
/// allocate freely, rewind, and everything since the point is forgotten at
/// once. Not thread-safe.
#[derive(Debug, Default)]
pub struct LinearStackAllocator<U: UnderlyingAllocator = GlobalHeap, P: StatsPolicy = NoStats> {
    inner: LinearArenaAllocator<U, P>,
}

// === impl LinearStackAllocator ===

impl<U: UnderlyingAllocator, P: StatsPolicy> LinearStackAllocator<U, P> {
    pub fn new(arena_size: usize) -> Self {
        Self {
            inner: LinearArenaAllocator::new(arena_size),
        }
    }

    pub fn stats(&self) -> &P {
        self.inner.stats()
    }

    pub fn arena_count(&self) -> u32 {
        self.inner.arena_count()
    }

    pub fn allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        self.inner.allocate(size, align)
    }

    /// Best-effort LIFO release; [`rewind`](Self::rewind) is the intended
    /// way to free.
    pub fn deallocate(&mut self, ptr: *mut u8, size: usize, align: usize) -> bool {
        self.inner.deallocate(ptr, size, align)
    }

    /// Captures the current allocation position.
    pub fn rewind_point(&self) -> RewindPoint {
        let (arena, left_over) = self.inner.rewind_state();
        RewindPoint { arena, left_over }
    }

    /// Forgets every allocation made since `point` was captured.
    pub fn rewind(&mut self, point: RewindPoint) {
        self.inner.restore_state(point.arena, point.left_over);
    }

    /// Opens a scope that rewinds to the current position when dropped.
    pub fn scope(&mut self) -> Scope<'_, U, P> {
        let point = self.rewind_point();
        Scope { alloc: self, point }
    }
}

/// RAII guard returned by [`LinearStackAllocator::scope`]; rewinds the
/// allocator to the scope's start on drop.
#[must_use = "a scope that is dropped immediately rewinds immediately"]
pub struct Scope<'a, U: UnderlyingAllocator = GlobalHeap, P: StatsPolicy = NoStats> {
    alloc: &'a mut LinearStackAllocator<U, P>,
    point: RewindPoint,
}

impl<U: UnderlyingAllocator, P: StatsPolicy> Deref for Scope<'_, U, P> {
    type Target = LinearStackAllocator<U, P>;

    fn deref(&self) -> &Self::Target {
        self.alloc
    }
}

impl<U: UnderlyingAllocator, P: StatsPolicy> DerefMut for Scope<'_, U, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.alloc
    }
}

impl<U: UnderlyingAllocator, P: StatsPolicy> Drop for Scope<'_, U, P> {
    fn drop(&mut self) {
        self.alloc.rewind(self.point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewind_forgets_allocations() {
        let mut stack: LinearStackAllocator = LinearStackAllocator::new(256);
        let a = stack.allocate(64, 1);

        let point = stack.rewind_point();
        let b = stack.allocate(64, 1);
        let _ = stack.allocate(64, 1);
        stack.rewind(point);

        // the space after the rewind point is handed out again
        assert_eq!(stack.allocate(64, 1), b);
        assert_ne!(a, b);
    }

    #[test]
    fn rewind_across_arenas() {
        let mut stack: LinearStackAllocator = LinearStackAllocator::new(128);
        let _ = stack.allocate(100, 1);

        let point = stack.rewind_point();
        for _ in 0..4 {
            let _ = stack.allocate(100, 1);
        }
        let arenas = stack.arena_count();
        stack.rewind(point);

        // arenas survive a rewind, their contents do not
        assert_eq!(stack.arena_count(), arenas);
        let p = stack.allocate(100, 1);
        assert!(!p.is_null());
    }

    #[test]
    fn scope_rewinds_on_drop() {
        let mut stack: LinearStackAllocator = LinearStackAllocator::new(256);

        let first;
        {
            let mut scope = stack.scope();
            first = scope.allocate(32, 1);
            let _ = scope.allocate(32, 1);
        }

        // everything the scope allocated is handed out again
        assert_eq!(stack.allocate(32, 1), first);
    }
}
