// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The MPMC work queues behind each workgroup and each worker's private
//! inbox.
//!
//! Two interchangeable implementations, selected at build time:
//!
//! - the default pairs a spin lock with a growable power-of-two ring;
//!   `try_*` operations fail on lock contention, never blocking the
//!   round-robin scans
//! - the `lockfree-queue` feature swaps in a bounded sequence-counter ring
//!   (per-cell sequence words, CAS'd head/tail) for the hot path;
//!   `try_push` fails when the ring is full and submission falls through
//!   to the next queue in the round-robin

cfg_if::cfg_if! {
    if #[cfg(feature = "lockfree-queue")] {
        mod seq_ring;
        pub(crate) use seq_ring::WorkQueue;
    } else {
        mod locked;
        pub(crate) use locked::WorkQueue;
    }
}

/// Queue capacity a workgroup starts from. The locked ring grows past it;
/// the lock-free ring is bounded by it and pushes back on submitters.
pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 2048;
