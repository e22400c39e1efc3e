// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Range-partitioned fan-out over a workgroup.
//!
//! The drivers share one shape: compute a chunking from [`TaskTraits`],
//! submit all chunks but the last to the context's workgroup, run the last
//! chunk on the calling worker, and wait on a countdown latch. The shared
//! state (latch, callable, slice base) lives on the caller's stack; tasks
//! reach it through a raw pointer that the latch keeps valid.

use crate::context::WorkerContext;
use crate::sync::Latch;
use crate::work::WorkItem;
use core::ops::Range;

/// Tuning knobs for the `parallel_for` family.
#[derive(Debug, Clone, Copy)]
pub struct TaskTraits {
    /// Target chunks per group worker when no fixed batch size is given.
    pub batches_per_worker: u32,
    /// Inputs at or below this size run inline on the caller.
    pub parallel_execution_threshold: u32,
    /// Overrides the computed batch size entirely.
    pub fixed_batch_size: Option<u32>,
}

impl Default for TaskTraits {
    fn default() -> Self {
        Self {
            batches_per_worker: 4,
            parallel_execution_threshold: 16,
            fixed_batch_size: None,
        }
    }
}

/// A `*const` that may cross threads; the parallel-for latch guarantees
/// the pointee outlives every reader.
#[derive(Clone, Copy)]
struct SharedPtr(*const u8);

// Safety: see the type docs; all pointees here are `Sync` shared state.
unsafe impl Send for SharedPtr {}

struct RangeShared<'f, F> {
    latch: Latch,
    f: &'f F,
}

struct SliceShared<'f, T, F> {
    latch: Latch,
    base: *const T,
    f: &'f F,
}

struct SliceSharedMut<'f, T, F> {
    latch: Latch,
    base: *mut T,
    f: &'f F,
}

/// Chunking per the traits: `(batch_size, batch_count)`.
fn partition(count: u32, workers: u32, traits: TaskTraits) -> (u32, u32) {
    let batch = traits
        .fixed_batch_size
        .unwrap_or_else(|| count.div_ceil(traits.batches_per_worker.max(1) * workers.max(1)))
        .max(1);
    (batch, count.div_ceil(batch))
}

// === range driver ===

pub(crate) fn for_range<F>(cx: &WorkerContext<'_>, range: Range<u32>, traits: TaskTraits, f: F)
where
    F: Fn(Range<u32>, &WorkerContext<'_>) + Sync,
{
    let count = range.end.saturating_sub(range.start);
    if count == 0 {
        return;
    }

    let workers = cx.inner.group_worker_count(cx.workgroup());
    let (batch, batches) = partition(count, workers, traits);
    if count <= traits.parallel_execution_threshold || batches <= 1 || workers <= 1 {
        f(range, cx);
        return;
    }

    let shared = RangeShared {
        latch: Latch::new(batches as usize - 1),
        f: &f,
    };
    let shared_ptr = SharedPtr((&raw const shared).cast::<u8>());

    let mut begin = range.start;
    for _ in 0..batches - 1 {
        let end = (begin + batch).min(range.end);
        // coerce to a fn pointer so the capture stays free of `F`'s
        // lifetimes
        let run: fn(SharedPtr, u32, u32, &WorkerContext<'_>) = run_range_chunk::<F>;
        let capture = (run, shared_ptr, begin, end);
        cx.inner.submit_to_group(
            cx.worker(),
            WorkItem::new(cx.workgroup(), move |task_cx: &WorkerContext<'_>| {
                (capture.0)(capture.1, capture.2, capture.3, task_cx);
            }),
        );
        begin = end;
    }

    // the caller takes the final chunk, then joins
    f(begin..range.end, cx);
    shared.latch.wait();
}

fn run_range_chunk<F>(shared: SharedPtr, begin: u32, end: u32, cx: &WorkerContext<'_>)
where
    F: Fn(Range<u32>, &WorkerContext<'_>) + Sync,
{
    // Safety: the pointer targets the caller's `RangeShared`, which stays
    // alive until the latch below releases it.
    let shared = unsafe { &*shared.0.cast::<RangeShared<'_, F>>() };
    (shared.f)(begin..end, cx);
    shared.latch.count_down();
}

// === per-element drivers ===

pub(crate) fn for_each<T, F>(cx: &WorkerContext<'_>, items: &[T], traits: TaskTraits, f: F)
where
    T: Sync,
    F: Fn(&T, &WorkerContext<'_>) + Sync,
{
    let count = items.len() as u32;
    if count == 0 {
        return;
    }

    let workers = cx.inner.group_worker_count(cx.workgroup());
    if count <= traits.parallel_execution_threshold || count <= 1 || workers <= 1 {
        for item in items {
            f(item, cx);
        }
        return;
    }

    let shared = SliceShared {
        latch: Latch::new(count as usize - 1),
        base: items.as_ptr(),
        f: &f,
    };
    let shared_ptr = SharedPtr((&raw const shared).cast::<u8>());

    for index in 0..count - 1 {
        let run: fn(SharedPtr, u32, &WorkerContext<'_>) = run_element::<T, F>;
        let capture = (run, shared_ptr, index);
        cx.inner.submit_to_group(
            cx.worker(),
            WorkItem::new(cx.workgroup(), move |task_cx: &WorkerContext<'_>| {
                (capture.0)(capture.1, capture.2, task_cx);
            }),
        );
    }

    f(&items[count as usize - 1], cx);
    shared.latch.wait();
}

fn run_element<T, F>(shared: SharedPtr, index: u32, cx: &WorkerContext<'_>)
where
    T: Sync,
    F: Fn(&T, &WorkerContext<'_>) + Sync,
{
    // Safety: see `run_range_chunk`; additionally `index` is in bounds of
    // the slice the caller partitioned.
    let shared = unsafe { &*shared.0.cast::<SliceShared<'_, T, F>>() };
    // Safety: `base` points at the caller's slice, `index` is in bounds.
    let item = unsafe { &*shared.base.add(index as usize) };
    (shared.f)(item, cx);
    shared.latch.count_down();
}

pub(crate) fn for_each_mut<T, F>(cx: &WorkerContext<'_>, items: &mut [T], traits: TaskTraits, f: F)
where
    T: Send,
    F: Fn(&mut T, &WorkerContext<'_>) + Sync,
{
    let count = items.len() as u32;
    if count == 0 {
        return;
    }

    let workers = cx.inner.group_worker_count(cx.workgroup());
    if count <= traits.parallel_execution_threshold || count <= 1 || workers <= 1 {
        for item in items {
            f(item, cx);
        }
        return;
    }

    let shared = SliceSharedMut {
        latch: Latch::new(count as usize - 1),
        base: items.as_mut_ptr(),
        f: &f,
    };
    let shared_ptr = SharedPtr((&raw const shared).cast::<u8>());

    for index in 0..count - 1 {
        let run: fn(SharedPtr, u32, &WorkerContext<'_>) = run_element_mut::<T, F>;
        let capture = (run, shared_ptr, index);
        cx.inner.submit_to_group(
            cx.worker(),
            WorkItem::new(cx.workgroup(), move |task_cx: &WorkerContext<'_>| {
                (capture.0)(capture.1, capture.2, task_cx);
            }),
        );
    }

    // Safety: every other index is owned by exactly one task; this is the
    // remaining one.
    let last = unsafe { &mut *shared.base.add(count as usize - 1) };
    f(last, cx);
    shared.latch.wait();
}

fn run_element_mut<T, F>(shared: SharedPtr, index: u32, cx: &WorkerContext<'_>)
where
    T: Send,
    F: Fn(&mut T, &WorkerContext<'_>) + Sync,
{
    // Safety: see `run_range_chunk`.
    let shared = unsafe { &*shared.0.cast::<SliceSharedMut<'_, T, F>>() };
    // Safety: each index is handed to exactly one task, so the exclusive
    // borrow is unique.
    let item = unsafe { &mut *shared.base.add(index as usize) };
    (shared.f)(item, cx);
    shared.latch.count_down();
}
