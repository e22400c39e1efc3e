// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use strata_sched::{Scheduler, TaskTraits, WorkerId, WorkgroupId};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}

const GROUP_A: WorkgroupId = WorkgroupId::new(0);
const GROUP_B: WorkgroupId = WorkgroupId::new(1);

#[test]
fn entry_hook_runs_on_every_worker() {
    init_tracing();
    static ENTERED: AtomicUsize = AtomicUsize::new(0);

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 4, 0);
    assert_eq!(sched.worker_count(), 4);

    sched.begin_execution(|desc| {
        assert!(desc.group_mask & 1 != 0);
        ENTERED.fetch_add(1, Ordering::SeqCst);
    });
    // begin_execution waits until every worker passed the hook
    assert_eq!(ENTERED.load(Ordering::SeqCst), 4);

    sched.end_execution();
}

#[test]
fn inline_submit_to_self() {
    init_tracing();
    static RAN: AtomicBool = AtomicBool::new(false);

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 2, 0);
    sched.begin_execution(|_| {});

    let me = WorkerId::current();
    sched.submit_to_worker(me, me, GROUP_A, |cx| {
        assert_eq!(cx.worker(), WorkerId::new(0));
        RAN.store(true, Ordering::SeqCst);
    });
    // a self-submission runs before submit returns
    assert!(RAN.load(Ordering::SeqCst));

    sched.end_execution();
}

#[test]
fn mailbox_submission_reaches_the_right_worker() {
    init_tracing();
    static RAN_ON: AtomicU32 = AtomicU32::new(u32::MAX);

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 3, 0);
    sched.begin_execution(|_| {});

    sched.submit_to_worker(WorkerId::current(), WorkerId::new(2), GROUP_A, |cx| {
        RAN_ON.store(cx.worker().get(), Ordering::SeqCst);
    });
    sched.end_execution();

    assert_eq!(RAN_ON.load(Ordering::SeqCst), 2);
}

#[test]
fn every_submission_executes_exactly_once() {
    init_tracing();
    static EXECUTED: AtomicUsize = AtomicUsize::new(0);
    const SUBMISSIONS: usize = 5_000;

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 4, 0);
    sched.begin_execution(|_| {});

    let me = WorkerId::current();
    for _ in 0..SUBMISSIONS {
        sched.submit(me, GROUP_A, |_cx| {
            EXECUTED.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.end_execution();

    assert_eq!(EXECUTED.load(Ordering::SeqCst), SUBMISSIONS);
}

#[test]
fn cross_group_submissions_stay_in_the_target_group() {
    init_tracing();
    static PER_WORKER: [AtomicUsize; 6] = [const { AtomicUsize::new(0) }; 6];
    const SUBMISSIONS: usize = 1_000;

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 2, 0);
    sched.create_group(GROUP_B, 2, 4, 0);
    assert_eq!(sched.worker_count(), 6);
    sched.begin_execution(|_| {});

    // worker 0 (group A) floods group B
    let me = WorkerId::current();
    for _ in 0..SUBMISSIONS {
        sched.submit(me, GROUP_B, |cx| {
            assert_eq!(cx.workgroup(), WorkgroupId::new(1));
            assert!(cx.belongs_to(WorkgroupId::new(1)));
            PER_WORKER[cx.worker().get() as usize].fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.end_execution();

    let group_a: usize = PER_WORKER[..2].iter().map(|c| c.load(Ordering::SeqCst)).sum();
    let group_b: usize = PER_WORKER[2..].iter().map(|c| c.load(Ordering::SeqCst)).sum();
    assert_eq!(group_a, 0, "group A must stay untouched");
    assert_eq!(group_b, SUBMISSIONS);
}

#[test]
fn tasks_can_submit_more_tasks() {
    init_tracing();
    static CHAINED: AtomicUsize = AtomicUsize::new(0);

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 3, 0);
    sched.begin_execution(|_| {});

    sched.submit(WorkerId::current(), GROUP_A, |cx| {
        CHAINED.fetch_add(1, Ordering::SeqCst);
        cx.submit(cx.workgroup(), |_cx| {
            CHAINED.fetch_add(1, Ordering::SeqCst);
        });
    });

    // wait for the chain so no submission races the shutdown drain
    while CHAINED.load(Ordering::SeqCst) < 2 {
        std::thread::yield_now();
    }
    sched.end_execution();

    assert_eq!(CHAINED.load(Ordering::SeqCst), 2);
}

#[test]
fn parallel_for_range_visits_every_index() {
    init_tracing();

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 4, 0);
    sched.begin_execution(|_| {});

    let counter = AtomicUsize::new(0);
    sched.parallel_for_range(
        GROUP_A,
        0..100,
        TaskTraits {
            parallel_execution_threshold: 1,
            ..TaskTraits::default()
        },
        |range, _cx| {
            counter.fetch_add(range.len(), Ordering::SeqCst);
        },
    );
    assert_eq!(counter.load(Ordering::SeqCst), 100);

    sched.end_execution();
}

#[test]
fn parallel_for_visits_every_element() {
    init_tracing();

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 4, 0);
    sched.begin_execution(|_| {});

    let items: Vec<AtomicUsize> = (0..100).map(|_| AtomicUsize::new(0)).collect();
    sched.parallel_for(
        GROUP_A,
        &items,
        TaskTraits {
            parallel_execution_threshold: 1,
            ..TaskTraits::default()
        },
        |item, _cx| {
            item.fetch_add(1, Ordering::SeqCst);
        },
    );

    assert!(items.iter().all(|item| item.load(Ordering::SeqCst) == 1));
    sched.end_execution();
}

#[test]
fn parallel_for_mut_gets_exclusive_elements() {
    init_tracing();

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 4, 0);
    sched.begin_execution(|_| {});

    let mut items: Vec<u64> = (0..128).collect();
    sched.parallel_for_mut(
        GROUP_A,
        &mut items,
        TaskTraits {
            parallel_execution_threshold: 1,
            ..TaskTraits::default()
        },
        |item, _cx| {
            *item *= 2;
        },
    );

    for (i, item) in items.iter().enumerate() {
        assert_eq!(*item, (i as u64) * 2);
    }
    sched.end_execution();
}

#[test]
fn small_inputs_run_inline() {
    init_tracing();

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 2, 0);
    sched.begin_execution(|_| {});

    let ran_on = AtomicU32::new(u32::MAX);
    sched.parallel_for_range(GROUP_A, 0..4, TaskTraits::default(), |_range, cx| {
        ran_on.store(cx.worker().get(), Ordering::SeqCst);
    });
    // below the threshold the caller runs the whole range itself
    assert_eq!(ran_on.load(Ordering::SeqCst), 0);

    sched.end_execution();
}

#[test]
fn user_context_is_shared_with_tasks() {
    init_tracing();
    static SEEN: AtomicUsize = AtomicUsize::new(0);

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 2, 0);
    sched.set_user_context(Arc::new(42_usize));
    sched.begin_execution(|_| {});

    sched.submit(WorkerId::current(), GROUP_A, |cx| {
        let value = *cx.user_context::<usize>().expect("context type mismatch");
        SEEN.store(value, Ordering::SeqCst);
    });
    sched.end_execution();

    assert_eq!(SEEN.load(Ordering::SeqCst), 42);
}

#[test]
fn workers_drain_queues_before_shutdown() {
    init_tracing();
    static DONE: AtomicUsize = AtomicUsize::new(0);

    let mut sched = Scheduler::new();
    sched.create_group(GROUP_A, 0, 2, 0);
    sched.begin_execution(|_| {});

    for _ in 0..500 {
        sched.submit(WorkerId::current(), GROUP_A, |_cx| {
            DONE.fetch_add(1, Ordering::SeqCst);
        });
    }

    // end_execution must not return before everything queued has run
    sched.end_execution();
    assert_eq!(DONE.load(Ordering::SeqCst), 500);
}

#[test]
fn dropping_a_running_scheduler_shuts_it_down() {
    init_tracing();
    static DONE: AtomicUsize = AtomicUsize::new(0);

    {
        let mut sched = Scheduler::new();
        sched.create_group(GROUP_A, 0, 2, 0);
        sched.begin_execution(|_| {});
        for _ in 0..50 {
            sched.submit(WorkerId::current(), GROUP_A, |_cx| {
                DONE.fetch_add(1, Ordering::SeqCst);
            });
        }
    }

    assert_eq!(DONE.load(Ordering::SeqCst), 50);
}
