// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::Debug;
use core::sync::atomic::{AtomicU64, Ordering};

/// Accounting policy of an allocator, picked at compile time so that the
/// disabled mode is truly free.
pub trait StatsPolicy: Default + Debug {
    fn report_allocate(&mut self, size: u64);
    fn report_deallocate(&mut self, size: u64);
    fn report_new_arena(&mut self);
    fn snapshot(&self) -> StatsSnapshot;
}

/// Counters reported by a [`StatsPolicy`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub allocations: u64,
    pub deallocations: u64,
    pub bytes_in_use: u64,
    pub peak_bytes: u64,
    pub arenas_created: u64,
}

/// No accounting; every hook compiles to nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStats;

impl StatsPolicy for NoStats {
    #[inline(always)]
    fn report_allocate(&mut self, _size: u64) {}

    #[inline(always)]
    fn report_deallocate(&mut self, _size: u64) {}

    #[inline(always)]
    fn report_new_arena(&mut self) {}

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot::default()
    }
}

/// Plain counters for single-threaded allocators.
#[derive(Debug, Default)]
pub struct Stats {
    inner: StatsSnapshot,
}

impl StatsPolicy for Stats {
    fn report_allocate(&mut self, size: u64) {
        self.inner.allocations += 1;
        self.inner.bytes_in_use += size;
        self.inner.peak_bytes = self.inner.peak_bytes.max(self.inner.bytes_in_use);
    }

    fn report_deallocate(&mut self, size: u64) {
        self.inner.deallocations += 1;
        self.inner.bytes_in_use -= size;
    }

    fn report_new_arena(&mut self) {
        self.inner.arenas_created += 1;
    }

    fn snapshot(&self) -> StatsSnapshot {
        self.inner
    }
}

/// Relaxed atomic counters, for allocators wrapped in an external lock that
/// still want contention-free accounting reads.
#[derive(Debug, Default)]
pub struct AtomicStats {
    allocations: AtomicU64,
    deallocations: AtomicU64,
    bytes_in_use: AtomicU64,
    peak_bytes: AtomicU64,
    arenas_created: AtomicU64,
}

impl StatsPolicy for AtomicStats {
    fn report_allocate(&mut self, size: u64) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let in_use = self.bytes_in_use.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(in_use, Ordering::Relaxed);
    }

    fn report_deallocate(&mut self, size: u64) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_in_use.fetch_sub(size, Ordering::Relaxed);
    }

    fn report_new_arena(&mut self) {
        self.arenas_created.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            bytes_in_use: self.bytes_in_use.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            arenas_created: self.arenas_created.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_usage() {
        let mut stats = Stats::default();
        stats.report_allocate(100);
        stats.report_allocate(50);
        stats.report_deallocate(100);
        stats.report_new_arena();

        let snap = stats.snapshot();
        assert_eq!(snap.allocations, 2);
        assert_eq!(snap.deallocations, 1);
        assert_eq!(snap.bytes_in_use, 50);
        assert_eq!(snap.peak_bytes, 150);
        assert_eq!(snap.arenas_created, 1);
    }

    #[test]
    fn atomic_counters_match() {
        let mut stats = AtomicStats::default();
        stats.report_allocate(64);
        stats.report_deallocate(64);
        let snap = stats.snapshot();
        assert_eq!(snap.allocations, 1);
        assert_eq!(snap.bytes_in_use, 0);
        assert_eq!(snap.peak_bytes, 64);
    }
}
