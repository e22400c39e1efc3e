// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context::{WorkerContext, WorkgroupId};
use core::fmt;
use core::mem::{MaybeUninit, align_of, size_of};
use core::ptr;
use static_assertions::assert_impl_all;

/// Capture budget of a [`WorkItem`], in bytes.
pub const CAPTURE_SIZE: usize = 32;

/// Strictest capture alignment a [`WorkItem`] supports.
pub const CAPTURE_ALIGN: usize = 8;

#[derive(Clone, Copy)]
#[repr(align(8))]
struct Buf([MaybeUninit<u8>; CAPTURE_SIZE]);

/// A queued unit of work: a type-erased callable stored inline, plus the
/// tag of the workgroup it targets.
///
/// The stored callable must be `Copy` (and therefore has no destructor):
/// items move through MPMC queues and hand-off slots as plain bit copies.
/// Captures larger than [`CAPTURE_SIZE`] or over-aligned beyond
/// [`CAPTURE_ALIGN`] are rejected at compile time; spill such state behind
/// a reference instead.
#[derive(Clone, Copy)]
pub struct WorkItem {
    invoke: unsafe fn(*const u8, &WorkerContext<'_>),
    data: Buf,
    group: WorkgroupId,
}

assert_impl_all!(WorkItem: Send, Copy);

// === impl WorkItem ===

impl WorkItem {
    /// Packs `f` into an inline work item targeting `group`.
    pub fn new<F>(group: WorkgroupId, f: F) -> Self
    where
        F: FnOnce(&WorkerContext<'_>) + Copy + Send + 'static,
    {
        const {
            assert!(size_of::<F>() <= CAPTURE_SIZE, "capture exceeds the work item budget");
            assert!(align_of::<F>() <= CAPTURE_ALIGN, "capture is over-aligned");
        }

        let mut data = Buf([MaybeUninit::uninit(); CAPTURE_SIZE]);
        // Safety: the asserts above guarantee `F` fits the buffer, and the
        // buffer's alignment covers `F`'s.
        unsafe {
            ptr::write(data.0.as_mut_ptr().cast::<F>(), f);
        }

        Self {
            invoke: invoke_thunk::<F>,
            data,
            group,
        }
    }

    #[inline]
    pub fn group(&self) -> WorkgroupId {
        self.group
    }

    /// Runs the stored callable.
    pub(crate) fn invoke(&self, cx: &WorkerContext<'_>) {
        // Safety: `data` holds a valid `F` written by `new`, and the thunk
        // was instantiated for that same `F`.
        unsafe { (self.invoke)(self.data.0.as_ptr().cast::<u8>(), cx) }
    }
}

// Safety: `new` requires the captured callable to be `Send`, and the item
// carries nothing else besides plain bytes and a group tag.
unsafe impl Send for WorkItem {}

unsafe fn invoke_thunk<F>(data: *const u8, cx: &WorkerContext<'_>)
where
    F: FnOnce(&WorkerContext<'_>) + Copy,
{
    // Safety: the caller passes the buffer `new::<F>` wrote; `F: Copy`
    // makes the read a plain bit copy with no double-drop hazard.
    let f = unsafe { data.cast::<F>().read() };
    f(cx);
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_budget_is_enforced_for_fitting_captures() {
        // a full-width capture still fits
        let payload = [0u64; 4];
        let item = WorkItem::new(WorkgroupId::new(0), move |_cx| {
            let _ = payload;
        });
        assert_eq!(item.group(), WorkgroupId::new(0));
    }
}
