// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::{AtomicUsize, Ordering, UnsafeCell};
use crate::work::WorkItem;
use core::fmt;
use core::mem::MaybeUninit;

#[repr(align(64))]
#[derive(Debug, Default)]
struct CachePadded<T>(T);

/// A bounded MPMC ring ordered by per-cell sequence counters.
///
/// Each cell's sequence word encodes which lap of the ring may use it next:
/// producers claim a cell by CAS'ing the enqueue position while its
/// sequence matches, then publish by bumping the sequence; consumers
/// mirror that one lap behind. Neither side ever spins on the other's
/// in-flight write.
pub(crate) struct WorkQueue {
    cells: Box<[Cell]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

struct Cell {
    sequence: AtomicUsize,
    item: UnsafeCell<MaybeUninit<WorkItem>>,
}

// Safety: access to `item` is serialized by the sequence protocol; a cell
// is only read or written by the thread that claimed its position.
unsafe impl Send for WorkQueue {}
// Safety: see above.
unsafe impl Sync for WorkQueue {}

// === impl WorkQueue ===

impl WorkQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(8);
        let cells = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                item: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            cells,
            mask: capacity - 1,
            enqueue_pos: CachePadded(AtomicUsize::new(0)),
            dequeue_pos: CachePadded(AtomicUsize::new(0)),
        }
    }

    /// Enqueues unless the ring is full.
    pub(crate) fn try_push(&self, item: WorkItem) -> Result<(), WorkItem> {
        let mut pos = self.enqueue_pos.0.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);

            if seq == pos {
                match self.enqueue_pos.0.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: the CAS claimed this cell for us; no one
                        // else touches it until the sequence is bumped.
                        cell.item.with_mut(|slot| unsafe {
                            (*slot).write(item);
                        });
                        cell.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if seq < pos {
                // the consumer lap has not come around yet
                return Err(item);
            } else {
                pos = self.enqueue_pos.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueues, spinning while the ring is full.
    pub(crate) fn push(&self, mut item: WorkItem) {
        let mut boff = strata_spin::Backoff::default();
        loop {
            match self.try_push(item) {
                Ok(()) => return,
                Err(back) => item = back,
            }
            boff.spin();
        }
    }

    /// Dequeues unless the ring is empty.
    pub(crate) fn try_pop(&self) -> Option<WorkItem> {
        let mut pos = self.dequeue_pos.0.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);

            if seq == pos + 1 {
                match self.dequeue_pos.0.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: the CAS claimed this cell; the producer
                        // published the item before bumping the sequence.
                        let item = cell.item.with(|slot| unsafe { (*slot).assume_init_read() });
                        cell.sequence
                            .store(pos + self.mask + 1, Ordering::Release);
                        return Some(item);
                    }
                    Err(actual) => pos = actual,
                }
            } else if seq <= pos {
                return None;
            } else {
                pos = self.dequeue_pos.0.load(Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<WorkItem> {
        self.try_pop()
    }

    /// Approximate; exact once the queue is quiescent.
    pub(crate) fn is_empty(&self) -> bool {
        let head = self.dequeue_pos.0.load(Ordering::SeqCst);
        let tail = self.enqueue_pos.0.load(Ordering::SeqCst);
        head >= tail
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("capacity", &self.cells.len())
            .field("enqueue_pos", &self.enqueue_pos.0)
            .field("dequeue_pos", &self.dequeue_pos.0)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkgroupId;

    fn item() -> WorkItem {
        WorkItem::new(WorkgroupId::new(0), |_cx| {})
    }

    #[test]
    fn bounded_and_fifo() {
        let ring = WorkQueue::new(8);
        for _ in 0..8 {
            assert!(ring.try_push(item()).is_ok());
        }
        assert!(ring.try_push(item()).is_err(), "ring is bounded");

        let mut popped = 0;
        while ring.try_pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, 8);
        assert!(ring.is_empty());

        // the freed lap is usable again
        assert!(ring.try_push(item()).is_ok());
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};

        let ring = Arc::new(WorkQueue::new(64));
        let popped = Arc::new(StdAtomicUsize::new(0));
        const PER_PRODUCER: usize = 1000;

        let producers: Vec<_> = (0..2)
            .map(|_| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        ring.push(item());
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let ring = Arc::clone(&ring);
                let popped = Arc::clone(&popped);
                std::thread::spawn(move || {
                    while popped.load(StdOrdering::Relaxed) < 2 * PER_PRODUCER {
                        if ring.try_pop().is_some() {
                            popped.fetch_add(1, StdOrdering::Relaxed);
                        } else {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for t in producers {
            t.join().unwrap();
        }
        for t in consumers {
            t.join().unwrap();
        }

        assert_eq!(popped.load(StdOrdering::Relaxed), 2 * PER_PRODUCER);
        assert!(ring.is_empty());
    }
}
