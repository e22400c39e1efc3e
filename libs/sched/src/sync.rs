// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::{AtomicUsize, Condvar, Mutex, Ordering};

/// A binary semaphore parking exactly one worker.
///
/// [`notify`](WakeEvent::notify) stores a wakeup that the next
/// [`wait`](WakeEvent::wait) consumes, so a notify that races ahead of the
/// wait is never lost.
#[derive(Debug)]
pub(crate) struct WakeEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

// === impl WakeEvent ===

impl WakeEvent {
    pub(crate) fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Blocks until notified, consuming the wakeup.
    pub(crate) fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.condvar.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    /// Wakes the owning worker (or pre-arms the next wait).
    pub(crate) fn notify(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.condvar.notify_one();
    }
}

/// A countdown latch: waiters block until the count reaches zero.
///
/// The count never resets; this is single-use synchronization for startup
/// barriers and fan-out joins.
#[derive(Debug)]
pub(crate) struct Latch {
    count: AtomicUsize,
    lock: Mutex<()>,
    condvar: Condvar,
}

// === impl Latch ===

impl Latch {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Decrements the count; the final decrement releases all waiters.
    pub(crate) fn count_down(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "latch counted below zero");
        if prev == 1 {
            // taking the lock orders this notify after any in-flight wait
            // registration
            let _guard = self.lock.lock().unwrap();
            self.condvar.notify_all();
        }
    }

    /// Blocks until the count reaches zero.
    pub(crate) fn wait(&self) {
        if self.count.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut guard = self.lock.lock().unwrap();
        while self.count.load(Ordering::Acquire) != 0 {
            guard = self.condvar.wait(guard).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;

    #[test]
    fn wake_event_is_not_lost() {
        loom::model(|| {
            let event = Arc::new(WakeEvent::new());

            let waker = {
                let event = Arc::clone(&event);
                std::thread::spawn(move || event.notify())
            };

            // whichever side runs first, the wait completes
            event.wait();
            waker.join().unwrap();
        });
    }

    #[test]
    fn latch_releases_at_zero() {
        loom::model(|| {
            let latch = Arc::new(Latch::new(2));

            let workers: Vec<_> = (0..2)
                .map(|_| {
                    let latch = Arc::clone(&latch);
                    std::thread::spawn(move || latch.count_down())
                })
                .collect();

            latch.wait();
            for t in workers {
                t.join().unwrap();
            }
        });
    }

    #[test]
    fn latch_of_zero_never_blocks() {
        let latch = Latch::new(0);
        latch.wait();
    }
}
