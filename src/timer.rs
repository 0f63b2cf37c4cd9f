use std::cell::Cell;
use std::ptr;
use std::sync::atomic::AtomicU32;

use crate::op::OpBase;
use crate::time::TimePoint;

/// Node header for timed operations.
///
/// Extends the queue header with the heap links, the deadline, and the
/// atomic state the elapsed/cancel handoff runs over (`TIMER_ELAPSED` /
/// `CANCEL_PENDING` in [`crate::op`]). Must be the first field of a
/// `#[repr(C)]` timed operation.
#[repr(C)]
pub(crate) struct TimerOp {
    pub(crate) base: OpBase,
    pub(crate) timer_next: Cell<*mut TimerOp>,
    pub(crate) timer_prev: Cell<*mut TimerOp>,
    pub(crate) deadline: Cell<TimePoint>,
    /// Set at start when the receiver's stop token can actually be stopped;
    /// an uncancellable timer skips the atomic handoff entirely.
    pub(crate) can_be_cancelled: Cell<bool>,
    pub(crate) state: AtomicU32,
}

impl TimerOp {
    pub(crate) fn new(deadline: TimePoint) -> TimerOp {
        TimerOp {
            base: OpBase::new(),
            timer_next: Cell::new(ptr::null_mut()),
            timer_prev: Cell::new(ptr::null_mut()),
            deadline: Cell::new(deadline),
            can_be_cancelled: Cell::new(false),
            state: AtomicU32::new(0),
        }
    }

    pub(crate) fn as_op_base(&self) -> *mut OpBase {
        self as *const TimerOp as *mut TimerOp as *mut OpBase
    }
}

/// Set of pending timers, ordered by deadline.
///
/// An intrusive doubly-linked list kept sorted ascending, so the earliest
/// deadline is always at the head and removal by node pointer is O(1).
/// Insertion walks the list; the run loop only ever looks at the head.
pub(crate) struct TimerHeap {
    head: *mut TimerOp,
}

impl TimerHeap {
    pub(crate) const fn new() -> TimerHeap {
        TimerHeap {
            head: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// The timer with the earliest deadline, or null.
    pub(crate) fn top(&self) -> *mut TimerOp {
        self.head
    }

    /// Unlink and return the earliest timer.
    ///
    /// # Safety
    ///
    /// The heap must not be empty.
    pub(crate) unsafe fn pop(&mut self) -> *mut TimerOp {
        let item = self.head;
        self.head = (*item).timer_next.get();
        if !self.head.is_null() {
            (*self.head).timer_prev.set(ptr::null_mut());
        }
        item
    }

    /// Insert a timer at its deadline-sorted position.
    ///
    /// # Safety
    ///
    /// `item` must be a valid node that is not currently in the heap.
    pub(crate) unsafe fn insert(&mut self, item: *mut TimerOp) {
        if self.head.is_null() {
            self.head = item;
            (*item).timer_next.set(ptr::null_mut());
            (*item).timer_prev.set(ptr::null_mut());
        } else if (*item).deadline.get() < (*self.head).deadline.get() {
            (*item).timer_next.set(self.head);
            (*item).timer_prev.set(ptr::null_mut());
            (*self.head).timer_prev.set(item);
            self.head = item;
        } else {
            // Insertion sort; equal deadlines keep insertion order.
            let mut insert_after = self.head;
            loop {
                let next = (*insert_after).timer_next.get();
                if next.is_null() || (*next).deadline.get() > (*item).deadline.get() {
                    break;
                }
                insert_after = next;
            }
            let insert_before = (*insert_after).timer_next.get();

            (*item).timer_prev.set(insert_after);
            (*item).timer_next.set(insert_before);
            (*insert_after).timer_next.set(item);
            if !insert_before.is_null() {
                (*insert_before).timer_prev.set(item);
            }
        }
    }

    /// Unlink a timer wherever it sits in the list.
    ///
    /// # Safety
    ///
    /// `item` must currently be in the heap.
    pub(crate) unsafe fn remove(&mut self, item: *mut TimerOp) {
        let prev = (*item).timer_prev.get();
        let next = (*item).timer_next.get();
        if !prev.is_null() {
            (*prev).timer_next.set(next);
        } else {
            self.head = next;
        }
        if !next.is_null() {
            (*next).timer_prev.set(prev);
        }
    }
}
