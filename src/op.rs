use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

/// The function the run loop invokes when it pops a node off a queue.
///
/// # Safety
///
/// `node` must point at the header embedded in the operation the function
/// was installed for, and the operation must still be alive and pinned.
pub(crate) type ExecuteFn = unsafe fn(node: *mut OpBase);

/// Intrusive header shared by every operation the context can dispatch.
///
/// A node is in at most one queue at a time; `enqueued` is true exactly
/// while it is. `execute` must be installed before the node is enqueued.
/// The header must be the first field of a `#[repr(C)]` operation so the
/// node pointer doubles as the operation pointer.
#[repr(C)]
pub(crate) struct OpBase {
    /// Forward link used by the local queue, the remote queue, and the
    /// remote queue's LIFO chain.
    pub(crate) next: Cell<*mut OpBase>,
    pub(crate) execute: Cell<Option<ExecuteFn>>,
    pub(crate) enqueued: AtomicBool,
}

impl OpBase {
    pub(crate) const fn new() -> OpBase {
        OpBase {
            next: Cell::new(std::ptr::null_mut()),
            execute: Cell::new(None),
            enqueued: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_enqueued(&self) -> bool {
        self.enqueued.load(Ordering::Acquire)
    }
}

impl Drop for OpBase {
    fn drop(&mut self) {
        debug_assert!(
            !self.enqueued.load(Ordering::Relaxed),
            "operation dropped while still queued"
        );
    }
}

// The elapsed/ended and cancel/stop halves of the operation state bitfield.
// The low 16 bits count stop requests, the high bits record that the I/O
// (or timer) side has claimed the completion. Whichever side's atomic RMW
// observes the other side's bits already set backs off; the other side owns
// the final completion.
pub(crate) const OPERATION_ENDED: u32 = 0x0001_0000;
pub(crate) const OPERATION_ENDED_MASK: u32 = 0xFFFF_0000;
pub(crate) const REQUEST_STOPPED: u32 = 0x1;
pub(crate) const REQUEST_STOPPED_MASK: u32 = 0xFFFF;

pub(crate) const TIMER_ELAPSED: u32 = OPERATION_ENDED;
pub(crate) const CANCEL_PENDING: u32 = REQUEST_STOPPED;
pub(crate) const CANCEL_PENDING_MASK: u32 = REQUEST_STOPPED_MASK;

/// A raw operation pointer that may cross a thread boundary.
///
/// Stop callbacks capture one of these; the operation protocol, not the
/// type system, guarantees the pointee outlives the registration.
pub(crate) struct SendPtr<T>(pub(crate) *mut T);

unsafe impl<T> Send for SendPtr<T> {}

impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SendPtr<T> {}
