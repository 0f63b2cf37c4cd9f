use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::op::OpBase;

/// Non-thread-safe intrusive FIFO of operation nodes.
///
/// Owned by the I/O thread. Nodes link through `OpBase::next`; the queue
/// never allocates and never touches the `enqueued` flags, its callers do.
pub(crate) struct Queue {
    head: *mut OpBase,
    tail: *mut OpBase,
}

impl Queue {
    pub(crate) const fn new() -> Queue {
        Queue {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Append a node. The node's `next` link is overwritten.
    ///
    /// # Safety
    ///
    /// `op` must be a valid node that is not currently in any queue.
    pub(crate) unsafe fn push_back(&mut self, op: *mut OpBase) {
        (*op).next.set(ptr::null_mut());
        if self.tail.is_null() {
            self.head = op;
        } else {
            (*self.tail).next.set(op);
        }
        self.tail = op;
    }

    /// Pop the oldest node, or null if empty.
    pub(crate) fn pop_front(&mut self) -> *mut OpBase {
        let op = self.head;
        if !op.is_null() {
            // SAFETY: a non-null head is a node previously pushed and still
            // owned by this queue.
            unsafe {
                self.head = (*op).next.get();
            }
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            }
        }
        op
    }

    /// Splice all of `other` onto the end of this queue.
    pub(crate) fn append(&mut self, other: Queue) {
        let mut other = other;
        if other.is_empty() {
            return;
        }
        if self.tail.is_null() {
            self.head = other.head;
        } else {
            // SAFETY: a non-null tail is a node owned by this queue.
            unsafe {
                (*self.tail).next.set(other.head);
            }
        }
        self.tail = other.tail;
        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
    }

    /// Rebuild a FIFO queue from a LIFO chain by reversing the links.
    ///
    /// # Safety
    ///
    /// `head` must be the head of a well-formed null-terminated chain.
    pub(crate) unsafe fn from_reversed(head: *mut OpBase) -> Queue {
        let mut queue = Queue::new();
        queue.tail = head;
        let mut prev: *mut OpBase = ptr::null_mut();
        let mut node = head;
        while !node.is_null() {
            let next = (*node).next.get();
            (*node).next.set(prev);
            prev = node;
            node = next;
        }
        queue.head = prev;
        queue
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        debug_assert!(self.is_empty(), "queue dropped while operations pending");
    }
}

/// Multi-producer single-consumer atomic LIFO of operation nodes.
///
/// Producers push concurrently; the consumer dequeues the whole chain at
/// once, reversed back to FIFO order. The consumer can also mark itself
/// inactive; the next producer to enqueue then learns, through the return
/// value of [`enqueue`], that it must wake the consumer.
///
/// The inactive state is encoded as a sentinel pointer that can never be a
/// valid node: the address of the queue's own head.
///
/// [`enqueue`]: RemoteQueue::enqueue
pub(crate) struct RemoteQueue {
    head: AtomicPtr<OpBase>,
}

impl RemoteQueue {
    pub(crate) fn new() -> RemoteQueue {
        RemoteQueue {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn inactive_value(&self) -> *mut OpBase {
        &self.head as *const _ as *mut OpBase
    }

    /// Enqueue a node. Returns true if the consumer was inactive, in which
    /// case the calling thread is responsible for waking it.
    ///
    /// # Safety
    ///
    /// `op` must be a valid node that is not currently in any queue.
    pub(crate) unsafe fn enqueue(&self, op: *mut OpBase) -> bool {
        let inactive = self.inactive_value();
        let mut old_value = self.head.load(Ordering::Relaxed);
        loop {
            (*op).next.set(if old_value == inactive {
                ptr::null_mut()
            } else {
                old_value
            });
            match self
                .head
                .compare_exchange_weak(old_value, op, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return old_value == inactive,
                Err(value) => old_value = value,
            }
        }
    }

    /// Transition from inactive to active without dequeuing.
    ///
    /// Returns true if the previous state was inactive. The run loop itself
    /// always goes through the sweep below; this exists for consumers that
    /// want to resume without collecting.
    #[allow(dead_code)]
    pub(crate) fn try_mark_active(&self) -> bool {
        self.head
            .compare_exchange(
                self.inactive_value(),
                ptr::null_mut(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn try_mark_inactive(&self) -> bool {
        self.head
            .compare_exchange(
                ptr::null_mut(),
                self.inactive_value(),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Atomically either mark the consumer inactive (if the queue is empty,
    /// returning an empty queue) or dequeue everything in FIFO order.
    ///
    /// Not valid to call while already inactive.
    pub(crate) fn try_mark_inactive_or_dequeue_all(&self) -> Queue {
        if self.try_mark_inactive() {
            return Queue::new();
        }

        let old_value = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        debug_assert!(!old_value.is_null());
        debug_assert!(old_value != self.inactive_value());
        // SAFETY: `old_value` heads the chain of nodes pushed by `enqueue`.
        unsafe { Queue::from_reversed(old_value) }
    }

    /// Dequeue all items without touching the active state.
    ///
    /// Not valid to call while inactive.
    #[allow(dead_code)]
    pub(crate) fn dequeue_all(&self) -> Queue {
        let value = self.head.load(Ordering::Relaxed);
        if value.is_null() {
            return Queue::new();
        }
        debug_assert!(value != self.inactive_value());
        let value = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        // SAFETY: as above.
        unsafe { Queue::from_reversed(value) }
    }
}

impl Drop for RemoteQueue {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        debug_assert!(
            head.is_null() || head == self.inactive_value(),
            "remote queue dropped while operations pending"
        );
    }
}

// SAFETY: the head pointer is only manipulated atomically and the nodes it
// links are handed off release/acquire from producers to the single
// consumer.
unsafe impl Send for RemoteQueue {}
unsafe impl Sync for RemoteQueue {}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::{Queue, RemoteQueue};
    use crate::op::OpBase;

    fn node() -> Box<OpBase> {
        Box::new(OpBase::new())
    }

    #[test]
    fn fifo_order() {
        let mut a = node();
        let mut b = node();
        let mut c = node();
        let mut queue = Queue::new();
        assert!(queue.is_empty());

        unsafe {
            queue.push_back(&mut *a);
            queue.push_back(&mut *b);
            queue.push_back(&mut *c);
        }
        assert_eq!(queue.pop_front(), &mut *a as *mut OpBase);
        assert_eq!(queue.pop_front(), &mut *b as *mut OpBase);
        assert_eq!(queue.pop_front(), &mut *c as *mut OpBase);
        assert!(queue.pop_front().is_null());
        assert!(queue.is_empty());
    }

    #[test]
    fn append_preserves_order() {
        let mut a = node();
        let mut b = node();
        let mut front = Queue::new();
        let mut back = Queue::new();
        unsafe {
            front.push_back(&mut *a);
            back.push_back(&mut *b);
        }
        front.append(back);
        assert_eq!(front.pop_front(), &mut *a as *mut OpBase);
        assert_eq!(front.pop_front(), &mut *b as *mut OpBase);
    }

    #[test]
    fn remote_enqueue_reports_inactive_consumer() {
        let mut a = node();
        let mut b = node();
        let queue = RemoteQueue::new();

        // A fresh queue is active and empty: flipping inactive succeeds.
        assert!(queue.try_mark_inactive_or_dequeue_all().is_empty());

        // First producer reactivates the queue and must wake the consumer.
        assert!(unsafe { queue.enqueue(&mut *a) });
        assert!(!unsafe { queue.enqueue(&mut *b) });

        let mut items = queue.try_mark_inactive_or_dequeue_all();
        assert_eq!(items.pop_front(), &mut *a as *mut OpBase);
        assert_eq!(items.pop_front(), &mut *b as *mut OpBase);
        assert!(items.pop_front().is_null());
    }

    #[test]
    fn remote_try_mark_active() {
        let queue = RemoteQueue::new();
        assert!(!queue.try_mark_active());
        assert!(queue.try_mark_inactive_or_dequeue_all().is_empty());
        assert!(queue.try_mark_active());
    }

    #[test]
    fn remote_dequeue_all_restores_fifo() {
        let mut nodes: Vec<Box<OpBase>> = (0..4).map(|_| node()).collect();
        let queue = RemoteQueue::new();
        for n in nodes.iter_mut() {
            let _ = unsafe { queue.enqueue(&mut **n) };
        }
        let mut items = queue.dequeue_all();
        for n in nodes.iter_mut() {
            assert_eq!(items.pop_front(), &mut **n as *mut OpBase);
        }
        assert!(items.pop_front().is_null());
        assert_eq!(queue.dequeue_all().pop_front(), ptr::null_mut());
    }
}
