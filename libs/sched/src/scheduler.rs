// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context::{ContextData, WorkerContext, WorkerDesc, WorkerId, WorkgroupId, set_current_worker};
use crate::loom::{AtomicBool, AtomicU32, Ordering, UnsafeCell};
use crate::queue::{DEFAULT_QUEUE_CAPACITY, WorkQueue};
use crate::sync::{Latch, WakeEvent};
use crate::work::WorkItem;
use arrayvec::ArrayVec;
use std::any::Any;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Upper bound on workgroups; the group membership mask is one word.
pub const MAX_WORKGROUPS: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
struct GroupDesc {
    start: u32,
    count: u32,
    priority: u32,
}

/// A fixed pool of worker threads partitioned into workgroups.
///
/// Configure groups with [`create_group`](Self::create_group), then
/// [`begin_execution`](Self::begin_execution) to bring the pool online (the
/// calling thread becomes worker 0). Submissions go to a group's queues or
/// a specific worker's inbox; [`end_execution`](Self::end_execution) drains
/// everything, stops the pool and joins it.
pub struct Scheduler {
    groups: Vec<GroupDesc>,
    worker_count: u32,
    user_context: Option<Arc<dyn Any + Send + Sync>>,
    inner: Option<Arc<Inner>>,
    threads: Vec<JoinHandle<()>>,
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("groups", &self.groups)
            .field("worker_count", &self.worker_count)
            .field("running", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Scheduler ===

impl Scheduler {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            worker_count: 0,
            user_context: None,
            inner: None,
            threads: Vec::new(),
        }
    }

    /// Declares workgroup `group` as workers
    /// `[start_thread, start_thread + thread_count)` at `priority`. Higher
    /// priorities are drained first by workers in several groups.
    ///
    /// The pool size is derived from the groups: the maximum
    /// `start_thread + thread_count` across all of them.
    ///
    /// # Panics
    ///
    /// Panics once execution has begun, or when `group` is out of range.
    pub fn create_group(
        &mut self,
        group: WorkgroupId,
        start_thread: u32,
        thread_count: u32,
        priority: u32,
    ) {
        assert!(self.inner.is_none(), "the pool is already running");
        assert!(group.index() < MAX_WORKGROUPS, "too many workgroups");
        assert!(thread_count > 0, "a workgroup needs at least one worker");

        if group.index() >= self.groups.len() {
            self.groups.resize(group.index() + 1, GroupDesc::default());
        }
        self.groups[group.index()] = GroupDesc {
            start: start_thread,
            count: thread_count,
            priority,
        };
        self.worker_count = self.worker_count.max(start_thread + thread_count);
    }

    /// Shared state every worker context can downcast to. Must be set
    /// before [`begin_execution`](Self::begin_execution).
    pub fn set_user_context(&mut self, user_context: Arc<dyn Any + Send + Sync>) {
        assert!(self.inner.is_none(), "the pool is already running");
        self.user_context = Some(user_context);
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    pub fn group_worker_count(&self, group: WorkgroupId) -> u32 {
        self.groups[group.index()].count
    }

    /// Brings the pool online. `entry` runs once on every worker (including
    /// the calling thread, which becomes worker 0) before any work is
    /// dispatched; `begin_execution` returns when all workers have passed
    /// through it.
    pub fn begin_execution<F>(&mut self, entry: F)
    where
        F: Fn(WorkerDesc) + Send + Sync + 'static,
    {
        assert!(self.inner.is_none(), "the pool is already running");
        let worker_count = self.worker_count as usize;
        assert!(worker_count > 0, "no workgroups configured");

        let group_count = self.groups.len();

        let mut ranges = vec![GroupRange::default(); worker_count];
        for (group_idx, group) in self.groups.iter().enumerate() {
            for w in group.start..group.start + group.count {
                let range = &mut ranges[w as usize];
                range.mask |= 1 << group_idx;
                range.priority_order.push(group_idx as u8);
            }
        }
        // drain order: descending priority, group index breaking ties
        for range in &mut ranges {
            let groups = &self.groups;
            range.priority_order.sort_unstable_by(|&a, &b| {
                groups[b as usize]
                    .priority
                    .cmp(&groups[a as usize].priority)
                    .then(a.cmp(&b))
            });
        }

        let workgroups: Box<[Workgroup]> = self
            .groups
            .iter()
            .map(|group| Workgroup {
                queues: (0..group.count)
                    .map(|_| WorkQueue::new(DEFAULT_QUEUE_CAPACITY))
                    .collect(),
                start: group.start,
                count: group.count,
                push_offset: AtomicU32::new(0),
            })
            .collect();

        let workers: Box<[Worker]> = (0..worker_count)
            .map(|w| Worker {
                contexts: (0..group_count)
                    .map(|g| ContextData {
                        worker: WorkerId::new(w as u32),
                        group: WorkgroupId::new(g as u32),
                        group_mask: ranges[w].mask,
                        group_offset: (w as u32).wrapping_sub(self.groups[g].start),
                    })
                    .collect(),
                inbox: WorkQueue::new(DEFAULT_QUEUE_CAPACITY),
                quitting: AtomicBool::new(false),
            })
            .collect();

        let inner = Arc::new(Inner {
            workgroups,
            workers,
            group_ranges: ranges.into_boxed_slice(),
            wake_status: (0..worker_count).map(|_| AtomicBool::new(true)).collect(),
            wake_events: (0..worker_count).map(|_| WakeEvent::new()).collect(),
            local_work: (0..worker_count).map(|_| LocalSlot::new()).collect(),
            stop: AtomicBool::new(false),
            user_context: self.user_context.clone(),
        });

        let started = Arc::new(Latch::new(worker_count));
        let entry = Arc::new(entry);

        for w in 1..worker_count {
            let inner = Arc::clone(&inner);
            let started = Arc::clone(&started);
            let entry = Arc::clone(&entry);

            let handle = std::thread::Builder::new()
                .name(format!("worker-{w}"))
                .spawn(move || {
                    let me = WorkerId::new(w as u32);
                    set_current_worker(Some(me));
                    entry(WorkerDesc {
                        worker: me,
                        group_mask: inner.group_ranges[w].mask,
                    });
                    started.count_down();
                    inner.run(me);
                })
                .expect("failed to spawn worker thread");
            self.threads.push(handle);
        }

        // the calling thread is worker 0
        set_current_worker(Some(WorkerId::new(0)));
        entry(WorkerDesc {
            worker: WorkerId::new(0),
            group_mask: inner.group_ranges[0].mask,
        });
        started.count_down();
        started.wait();

        self.inner = Some(inner);
        tracing::debug!(worker_count, group_count, "execution started");
    }

    /// Re-binds worker 0 to the calling thread, for callers that hand the
    /// scheduler between threads.
    pub fn take_ownership(&self) {
        set_current_worker(Some(WorkerId::new(0)));
    }

    /// Submits `f` to `group`. `src` is the submitting worker (used for the
    /// inline fast path bookkeeping); use
    /// [`WorkerId::current`] from inside tasks.
    pub fn submit<F>(&self, src: WorkerId, group: WorkgroupId, f: F)
    where
        F: FnOnce(&WorkerContext<'_>) + Copy + Send + 'static,
    {
        self.inner().submit_to_group(src, WorkItem::new(group, f));
    }

    /// Submits `f` to one specific worker. When `src == dst` the item runs
    /// inline, before this returns.
    pub fn submit_to_worker<F>(&self, src: WorkerId, dst: WorkerId, group: WorkgroupId, f: F)
    where
        F: FnOnce(&WorkerContext<'_>) + Copy + Send + 'static,
    {
        self.inner()
            .submit_to_worker(src, dst, WorkItem::new(group, f));
    }

    /// Runs at most one pending work item on the calling worker. Lets
    /// worker 0 (which never enters the scheduling loop) participate while
    /// it waits for something.
    pub fn busy_work(&self, worker: WorkerId) -> bool {
        debug_assert_eq!(WorkerId::try_current(), Some(worker));
        self.inner().busy_work(worker)
    }

    /// Borrows the cached context of (`worker`, `group`) together with the
    /// scheduler, the view work items execute against.
    pub fn with_context<R>(
        &self,
        worker: WorkerId,
        group: WorkgroupId,
        f: impl FnOnce(&WorkerContext<'_>) -> R,
    ) -> R {
        let inner = self.inner();
        let data = &inner.workers[worker.index()].contexts[group.index()];
        f(&WorkerContext { inner, data })
    }

    /// [`WorkerContext::parallel_for_range`] from the calling worker
    /// thread; it must belong to `group`.
    pub fn parallel_for_range<F>(
        &self,
        group: WorkgroupId,
        range: core::ops::Range<u32>,
        traits: crate::TaskTraits,
        f: F,
    ) where
        F: Fn(core::ops::Range<u32>, &WorkerContext<'_>) + Sync,
    {
        self.with_context(WorkerId::current(), group, |cx| {
            assert!(cx.belongs_to(group), "current worker is outside the target group");
            cx.parallel_for_range(range.clone(), traits, &f);
        });
    }

    /// [`WorkerContext::parallel_for`] from the calling worker thread; it
    /// must belong to `group`.
    pub fn parallel_for<T, F>(
        &self,
        group: WorkgroupId,
        items: &[T],
        traits: crate::TaskTraits,
        f: F,
    ) where
        T: Sync,
        F: Fn(&T, &WorkerContext<'_>) + Sync,
    {
        self.with_context(WorkerId::current(), group, |cx| {
            assert!(cx.belongs_to(group), "current worker is outside the target group");
            cx.parallel_for(items, traits, &f);
        });
    }

    /// [`WorkerContext::parallel_for_mut`] from the calling worker thread;
    /// it must belong to `group`.
    pub fn parallel_for_mut<T, F>(
        &self,
        group: WorkgroupId,
        items: &mut [T],
        traits: crate::TaskTraits,
        f: F,
    ) where
        T: Send,
        F: Fn(&mut T, &WorkerContext<'_>) + Sync,
    {
        self.with_context(WorkerId::current(), group, move |cx| {
            assert!(cx.belongs_to(group), "current worker is outside the target group");
            cx.parallel_for_mut(items, traits, &f);
        });
    }

    /// Drains all pending work, then stops and joins every worker thread.
    /// In-flight items run to completion; nothing is cancelled.
    pub fn end_execution(&mut self) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };

        inner.finish_pending();
        inner.stop.store(true, Ordering::SeqCst);

        for (i, handle) in self.threads.drain(..).enumerate() {
            let w = i + 1;
            while !inner.workers[w].quitting.load(Ordering::SeqCst) {
                inner.wake(WorkerId::new(w as u32));
                std::thread::yield_now();
            }
            handle.join().expect("worker thread panicked");
        }
        tracing::debug!("execution ended");
    }

    pub(crate) fn inner(&self) -> &Inner {
        self.inner.as_deref().expect("the pool is not running")
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let running = self
            .inner
            .as_ref()
            .is_some_and(|inner| !inner.stop.load(Ordering::SeqCst));
        if running {
            self.end_execution();
        }
    }
}

#[derive(Debug)]
struct Workgroup {
    /// One MPMC queue per worker slot in the group.
    queues: Box<[WorkQueue]>,
    start: u32,
    count: u32,
    /// Round-robin cursor for submissions.
    push_offset: AtomicU32,
}

#[derive(Debug)]
struct Worker {
    /// Cached per-group context data, one entry per configured group.
    contexts: Box<[ContextData]>,
    /// Private inbox: any producer, this worker consumes.
    inbox: WorkQueue,
    quitting: AtomicBool,
}

#[derive(Debug, Clone, Default)]
struct GroupRange {
    mask: u32,
    /// Group indices this worker drains, highest priority first.
    priority_order: ArrayVec<u8, MAX_WORKGROUPS>,
}

/// One-item hand-off slot, the fast path for submitting to a worker that
/// was just observed idle.
///
/// Ownership follows the worker's wake-status flag: a submitter that
/// flips the flag from `false` claims the slot until the worker consumes
/// it; the worker owns it whenever its flag is `true`.
struct LocalSlot(UnsafeCell<Option<WorkItem>>);

// Safety: the wake-status claim protocol serializes all slot access.
unsafe impl Sync for LocalSlot {}
// Safety: the slot only holds `WorkItem`s, which are `Send`.
unsafe impl Send for LocalSlot {}

impl LocalSlot {
    fn new() -> Self {
        Self(UnsafeCell::new(None))
    }

    /// # Safety
    ///
    /// The caller must hold the wake-status claim for this slot.
    unsafe fn put(&self, item: WorkItem) {
        self.0.with_mut(|slot| {
            // Safety: the claim grants exclusive access.
            unsafe { *slot = Some(item) }
        });
    }

    /// # Safety
    ///
    /// Only the owning worker may call this, and only while its wake
    /// status is set.
    unsafe fn take(&self) -> Option<WorkItem> {
        self.0.with_mut(|slot| {
            // Safety: the owning worker has exclusive access while awake.
            unsafe { (*slot).take() }
        })
    }
}

impl core::fmt::Debug for LocalSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("LocalSlot(..)")
    }
}

/// Shared state of a running pool; workers hold it through an `Arc`.
pub(crate) struct Inner {
    workgroups: Box<[Workgroup]>,
    workers: Box<[Worker]>,
    group_ranges: Box<[GroupRange]>,
    /// Per worker: `false` only while (about to be) asleep. Doubles as the
    /// claim for the worker's [`LocalSlot`].
    wake_status: Box<[AtomicBool]>,
    wake_events: Box<[WakeEvent]>,
    local_work: Box<[LocalSlot]>,
    stop: AtomicBool,
    pub(crate) user_context: Option<Arc<dyn Any + Send + Sync>>,
}

impl core::fmt::Debug for Inner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inner")
            .field("workgroups", &self.workgroups)
            .field("workers", &self.workers.len())
            .field("stop", &self.stop)
            .finish_non_exhaustive()
    }
}

// === impl Inner ===

impl Inner {
    /// The worker scheduling loop: local hand-off first, then queue work
    /// until dry, then park.
    fn run(&self, me: WorkerId) {
        let w = me.index();
        let _span = tracing::debug_span!("worker loop", worker = me.get()).entered();

        loop {
            // Safety: we are the owning worker and awake.
            if let Some(item) = unsafe { self.local_work[w].take() } {
                self.execute(me, item);
            }

            while self.do_available_work(me) {}

            if self.stop.load(Ordering::SeqCst) {
                tracing::debug!("stop signal received, shutting down");
                break;
            }

            tracing::trace!("going to sleep");
            self.wake_status[w].store(false, Ordering::SeqCst);

            // recheck after publishing the sleep flag: a submission that
            // raced the scan above saw the flag still set and will not
            // notify, so it must be picked up here
            if self.has_pending(me) {
                if self.wake_status[w].swap(true, Ordering::SeqCst) {
                    // a submitter claimed the hand-off slot meanwhile; its
                    // notify must arm the event before the slot is touched
                    self.wake_events[w].wait();
                }
                continue;
            }

            self.wake_events[w].wait();
            tracing::trace!("woke up");
        }

        self.workers[w].quitting.store(true, Ordering::SeqCst);
    }

    /// Pops and runs one work item; `false` when everything is dry.
    pub(crate) fn do_available_work(&self, me: WorkerId) -> bool {
        let Some(item) = self.get_work(me) else {
            return false;
        };
        self.execute(me, item);
        true
    }

    /// One local-slot check plus one queue pop, for threads that help out
    /// without entering the loop.
    pub(crate) fn busy_work(&self, me: WorkerId) -> bool {
        // Safety: `me` is the calling thread's own identity.
        if let Some(item) = unsafe { self.local_work[me.index()].take() } {
            self.execute(me, item);
            return true;
        }
        self.do_available_work(me)
    }

    /// Scans for work: each of this worker's groups in priority order,
    /// round-robin from the worker's own queue within each, then the
    /// private inbox.
    fn get_work(&self, me: WorkerId) -> Option<WorkItem> {
        let w = me.index();
        let range = &self.group_ranges[w];

        for &group_idx in &range.priority_order {
            let group = &self.workgroups[group_idx as usize];
            let own = me.get() - group.start;
            for i in 0..group.count {
                let queue = &group.queues[((own + i) % group.count) as usize];
                if let Some(item) = queue.try_pop() {
                    return Some(item);
                }
            }
        }

        self.workers[w].inbox.pop()
    }

    /// Whether any queue this worker drains holds an item.
    fn has_pending(&self, me: WorkerId) -> bool {
        let w = me.index();
        for &group_idx in &self.group_ranges[w].priority_order {
            let group = &self.workgroups[group_idx as usize];
            for queue in &group.queues {
                if !queue.is_empty() {
                    return true;
                }
            }
        }
        !self.workers[w].inbox.is_empty()
    }

    fn execute(&self, me: WorkerId, item: WorkItem) {
        let data = &self.workers[me.index()].contexts[item.group().index()];
        item.invoke(&WorkerContext { inner: self, data });
    }

    /// Submits to a specific worker's inbox; inline when submitting to
    /// self.
    pub(crate) fn submit_to_worker(&self, src: WorkerId, dst: WorkerId, item: WorkItem) {
        debug_assert!(!self.stop.load(Ordering::SeqCst), "submission after shutdown");

        if src == dst {
            self.execute(dst, item);
            return;
        }

        self.workers[dst.index()].inbox.push(item);
        self.wake(dst);
    }

    /// Submits to the item's target group: hand-off to a sleeping worker
    /// when one is observed, else round-robin over the group's queues.
    pub(crate) fn submit_to_group(&self, _src: WorkerId, mut item: WorkItem) {
        debug_assert!(!self.stop.load(Ordering::SeqCst), "submission after shutdown");

        let group = &self.workgroups[item.group().index()];
        debug_assert!(group.count > 0, "submission to an empty workgroup");

        // fast path: flip a sleeping worker's wake status; winning the flip
        // claims its hand-off slot
        for w in group.start..group.start + group.count {
            if !self.wake_status[w as usize].swap(true, Ordering::SeqCst) {
                // Safety: the exchange observed `false`, so we hold the
                // claim.
                unsafe { self.local_work[w as usize].put(item) };
                self.wake_events[w as usize].notify();
                tracing::trace!(worker = w, "handed work off to sleeping worker");
                return;
            }
        }

        // everyone is busy: queue it
        loop {
            let offset = group.push_offset.fetch_add(1, Ordering::Relaxed);
            for i in 0..group.count {
                let q = ((offset + i) % group.count) as usize;
                match group.queues[q].try_push(item) {
                    Ok(()) => {
                        self.wake(WorkerId::new(group.start + q as u32));
                        return;
                    }
                    Err(back) => item = back,
                }
            }
        }
    }

    /// Wakes `worker` if it was (about to go) asleep.
    fn wake(&self, worker: WorkerId) {
        if !self.wake_status[worker.index()].swap(true, Ordering::SeqCst) {
            self.wake_events[worker.index()].notify();
        }
    }

    pub(crate) fn group_worker_count(&self, group: WorkgroupId) -> u32 {
        self.workgroups[group.index()].count
    }

    /// Spins until every queue and inbox has been observed empty, waking
    /// sleepers so they drain. Runs on worker 0, which drains its own
    /// inbox here since nothing else will.
    fn finish_pending(&self) {
        loop {
            let mut has_work = false;

            for group in &self.workgroups {
                let mut group_has_items = false;
                for queue in &group.queues {
                    group_has_items |= !queue.is_empty();
                }
                if group_has_items {
                    for w in group.start..group.start + group.count {
                        self.wake(WorkerId::new(w));
                    }
                }
                has_work |= group_has_items;
            }

            for (w, worker) in self.workers.iter().enumerate() {
                let pending = !worker.inbox.is_empty();
                if pending {
                    if w == 0 {
                        while self.busy_work(WorkerId::new(0)) {}
                    } else {
                        self.wake(WorkerId::new(w as u32));
                    }
                }
                has_work |= pending;
            }

            if !has_work {
                break;
            }
            std::thread::yield_now();
        }
    }
}
