// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::parallel_for::TaskTraits;
use crate::scheduler::Inner;
use crate::work::WorkItem;
use core::any::Any;
use core::cell::Cell;
use core::fmt;
use core::ops::Range;

/// Identity of a worker thread. Worker `0` is the thread that called
/// [`begin_execution`](crate::Scheduler::begin_execution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(u32);

// === impl WorkerId ===

impl WorkerId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// The calling thread's worker identity.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread that is not a scheduler worker.
    pub fn current() -> Self {
        Self::try_current().expect("not on a scheduler worker thread")
    }

    /// Like [`current`](Self::current) but `None` off the worker pool.
    pub fn try_current() -> Option<Self> {
        CURRENT_WORKER.with(Cell::get)
    }
}

std::thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

pub(crate) fn set_current_worker(worker: Option<WorkerId>) {
    CURRENT_WORKER.with(|cell| cell.set(worker));
}

/// Identity of a workgroup: a named, contiguous range of workers used as
/// one dispatch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkgroupId(u32);

// === impl WorkgroupId ===

impl WorkgroupId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handed to the entry hook as each worker comes online.
#[derive(Debug, Clone, Copy)]
pub struct WorkerDesc {
    pub worker: WorkerId,
    /// Bitset of the workgroups this worker belongs to.
    pub group_mask: u32,
}

/// Cached per-(worker, workgroup) record; immutable once execution begins.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ContextData {
    pub(crate) worker: WorkerId,
    pub(crate) group: WorkgroupId,
    pub(crate) group_mask: u32,
    /// This worker's offset within the group's worker range.
    pub(crate) group_offset: u32,
}

/// The execution environment a work item sees: which worker is running it,
/// on behalf of which workgroup, with access back into the scheduler for
/// nested submission.
pub struct WorkerContext<'s> {
    pub(crate) inner: &'s Inner,
    pub(crate) data: &'s ContextData,
}

// === impl WorkerContext ===

impl<'s> WorkerContext<'s> {
    #[inline]
    pub fn worker(&self) -> WorkerId {
        self.data.worker
    }

    #[inline]
    pub fn workgroup(&self) -> WorkgroupId {
        self.data.group
    }

    /// Whether this context's worker belongs to `group`.
    #[inline]
    pub fn belongs_to(&self, group: WorkgroupId) -> bool {
        self.data.group_mask & (1 << group.get()) != 0
    }

    /// This worker's offset within its group's worker range.
    #[inline]
    pub fn group_offset(&self) -> u32 {
        self.data.group_offset
    }

    /// The shared user context installed before startup, downcast to `T`.
    pub fn user_context<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.user_context.as_deref()?.downcast_ref()
    }

    /// Submits `f` to `group`, round-robining over its queues.
    pub fn submit<F>(&self, group: WorkgroupId, f: F)
    where
        F: FnOnce(&WorkerContext<'_>) + Copy + Send + 'static,
    {
        self.inner
            .submit_to_group(self.worker(), WorkItem::new(group, f));
    }

    /// Submits `f` to one specific worker's private inbox. Submitting to
    /// the running worker executes `f` inline, before this returns.
    pub fn submit_to_worker<F>(&self, dst: WorkerId, f: F)
    where
        F: FnOnce(&WorkerContext<'_>) + Copy + Send + 'static,
    {
        self.inner
            .submit_to_worker(self.worker(), dst, WorkItem::new(self.workgroup(), f));
    }

    /// Fans `f` out over `items` across this context's workgroup, one
    /// invocation per element, and waits for all of them.
    pub fn parallel_for<T, F>(&self, items: &[T], traits: TaskTraits, f: F)
    where
        T: Sync,
        F: Fn(&T, &WorkerContext<'_>) + Sync,
    {
        crate::parallel_for::for_each(self, items, traits, f);
    }

    /// Like [`parallel_for`](Self::parallel_for) with exclusive access to
    /// the elements; chunks are disjoint.
    pub fn parallel_for_mut<T, F>(&self, items: &mut [T], traits: TaskTraits, f: F)
    where
        T: Send,
        F: Fn(&mut T, &WorkerContext<'_>) + Sync,
    {
        crate::parallel_for::for_each_mut(self, items, traits, f);
    }

    /// Fans chunked sub-ranges of `range` out over this context's
    /// workgroup and waits for all of them.
    pub fn parallel_for_range<F>(&self, range: Range<u32>, traits: TaskTraits, f: F)
    where
        F: Fn(Range<u32>, &WorkerContext<'_>) + Sync,
    {
        crate::parallel_for::for_range(self, range, traits, f);
    }
}

impl fmt::Debug for WorkerContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker", &self.data.worker)
            .field("group", &self.data.group)
            .field("group_mask", &format_args!("{:#b}", self.data.group_mask))
            .finish()
    }
}
