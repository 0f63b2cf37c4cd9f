use std::marker::PhantomPinned;
use std::mem::offset_of;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};

use log::trace;

use crate::context::Context;
use crate::error::Error;
use crate::exec::{OperationState, Receiver};
use crate::interest::Interest;
use crate::net::Socket;
use crate::op::{
    ExecuteFn, OpBase, SendPtr, OPERATION_ENDED, OPERATION_ENDED_MASK, REQUEST_STOPPED,
    REQUEST_STOPPED_MASK,
};
use crate::stop::StopCallback;

/// Which multiplexer event set an operation waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    /// Data-available readiness (accept, recv).
    Read,
    /// Writable readiness (send).
    Write,
}

impl OpKind {
    fn interest(self) -> Interest {
        match self {
            OpKind::Read => Interest::READABLE.add(Interest::PRIORITY),
            OpKind::Write => Interest::WRITABLE.add(Interest::PRIORITY),
        }
    }
}

/// The syscall half of a concrete socket operation.
///
/// One non-blocking attempt per call; the surrounding state machine decides
/// whether a would-block result arms the operation or an outcome completes
/// it. Runs only on the I/O thread.
pub trait Driver: Send {
    type Value;

    fn perform(&mut self, socket: &Socket) -> Result<Self::Value, Error>;
}

/// State machine shared by every socket operation.
///
/// Embeds two independent sub-nodes: `completion` rides the multiplexer's
/// ready map and the run-loop queues, `stop` carries a cancellation across
/// threads. Both may be queued at the same time, which is what makes the
/// "stop waits behind an already-queued completion" rule possible without
/// allocation.
///
/// The perform-once-first rule: on first entry to the I/O thread the driver
/// runs synchronously, and anything other than would-block completes the
/// operation without ever touching the multiplexer.
#[repr(C)]
pub struct SocketOp<'a, R, D>
where
    R: Receiver,
    D: Driver,
{
    completion: OpBase,
    stop: OpBase,
    context: &'a Context,
    socket: &'a Socket,
    kind: OpKind,
    state: AtomicU32,
    result: Option<Result<D::Value, Error>>,
    driver: D,
    receiver: Option<R>,
    stop_callback: Option<StopCallback>,
    _pin: PhantomPinned,
}

impl<'a, R, D> SocketOp<'a, R, D>
where
    R: Receiver<Value = D::Value>,
    D: Driver,
{
    pub(crate) fn new(
        context: &'a Context,
        socket: &'a Socket,
        kind: OpKind,
        driver: D,
        receiver: R,
    ) -> SocketOp<'a, R, D> {
        SocketOp {
            completion: OpBase::new(),
            stop: OpBase::new(),
            context,
            socket,
            kind,
            state: AtomicU32::new(0),
            result: None,
            driver,
            receiver: Some(receiver),
            stop_callback: None,
            _pin: PhantomPinned,
        }
    }

    /// Recover the operation from its stop sub-node.
    ///
    /// # Safety
    ///
    /// `op` must be the `stop` field of a live `SocketOp` of this exact
    /// instantiation.
    unsafe fn from_stop(op: *mut OpBase) -> *mut Self {
        (op as *mut u8).sub(offset_of!(Self, stop)) as *mut Self
    }

    /// Ran on the I/O thread after a remote start crossed over.
    ///
    /// # Safety
    ///
    /// `op` is the completion sub-node (offset zero) of a live, pinned
    /// operation popped off a queue.
    unsafe fn on_schedule_complete(op: *mut OpBase) {
        Self::perform_first(op as *mut Self);
    }

    /// First synchronous attempt, and the arming path on would-block.
    ///
    /// # Safety
    ///
    /// Must run on the I/O thread with `this` live and pinned.
    unsafe fn perform_first(this: *mut Self) {
        debug_assert!((*this).context.is_running_on_io_thread());
        debug_assert!(!(*this).completion.is_enqueued());

        let outcome = {
            let socket = (*this).socket;
            (*this).driver.perform(socket)
        };
        match outcome {
            Err(err) if err.is_would_block() => {
                let stop_token = match (*this).receiver.as_ref() {
                    Some(receiver) => receiver.stop_token(),
                    None => return,
                };
                // Checked just before arming: a pre-stopped token never
                // touches the multiplexer at all.
                if stop_token.stop_requested() {
                    if let Some(receiver) = (*this).receiver.take() {
                        receiver.set_stopped();
                    }
                    return;
                }

                (*this).completion.execute.set(Some(Self::wakeup as ExecuteFn));
                if let Err(err) = Self::add_events(this) {
                    (*this).result = Some(Err(err));
                    Self::finish(this);
                    return;
                }

                if stop_token.stop_possible() {
                    // Type-erased so the callback closure is `'static`. If
                    // the token was stopped in the meantime this invokes
                    // inline and takes the disarm path right here.
                    let ptr = SendPtr(this as *mut ());
                    let request_stop = Self::request_stop_erased as unsafe fn(*mut ());
                    (*this).stop_callback = stop_token.register(move || {
                        // Force capture of the whole `SendPtr` (not just its
                        // `.0` field) so the closure relies on `SendPtr`'s
                        // `Send` impl rather than `*mut ()`'s lack of one.
                        let ptr = ptr;
                        // SAFETY: the operation outlives its registration;
                        // the handle is dropped before the receiver is
                        // signalled.
                        unsafe { request_stop(ptr.0) };
                    });
                }
            }
            outcome => {
                (*this).result = Some(outcome);
                Self::finish(this);
            }
        }
    }

    /// The descriptor signalled readiness: perform again and complete.
    ///
    /// # Safety
    ///
    /// As for [`Self::on_schedule_complete`].
    unsafe fn wakeup(op: *mut OpBase) {
        let this = op as *mut Self;
        debug_assert!(!(*this).completion.is_enqueued());

        // Waits out a concurrently running stop callback, so past this
        // point the stop side either queued its node or never will.
        drop((*this).stop_callback.take());
        Self::remove_events(this);

        let old_state = (*this).state.fetch_or(OPERATION_ENDED, Ordering::AcqRel);
        if old_state & REQUEST_STOPPED_MASK != 0 {
            // A remote stop owns the completion.
            return;
        }

        let outcome = {
            let socket = (*this).socket;
            (*this).driver.perform(socket)
        };
        (*this).result = Some(outcome);
        Self::complete(this);
    }

    /// Claim the completion after an eager (unarmed) outcome.
    ///
    /// # Safety
    ///
    /// As for [`Self::perform_first`].
    unsafe fn finish(this: *mut Self) {
        let old_state = (*this).state.fetch_or(OPERATION_ENDED, Ordering::AcqRel);
        if old_state & REQUEST_STOPPED_MASK != 0 {
            // The stop side is responsible for signalling the receiver.
            return;
        }
        Self::complete(this);
    }

    /// Deliver the terminal signal according to the error slot.
    ///
    /// # Safety
    ///
    /// As for [`Self::perform_first`]; the result slot must be filled.
    unsafe fn complete(this: *mut Self) {
        let receiver = match (*this).receiver.take() {
            Some(receiver) => receiver,
            None => return,
        };
        match (*this).result.take() {
            Some(Ok(value)) => receiver.set_value(value),
            Some(Err(err)) if err.is_canceled() => receiver.set_stopped(),
            Some(Err(err)) => receiver.set_error(err),
            // Both callers fill the slot first.
            None => debug_assert!(false, "completed without an outcome"),
        }
    }

    /// Deliver `set_stopped`, waiting behind a queued completion if needed.
    ///
    /// # Safety
    ///
    /// `op` is the stop sub-node of a live, pinned operation popped off a
    /// queue on the I/O thread.
    unsafe fn complete_with_stop(op: *mut OpBase) {
        let this = Self::from_stop(op);
        if !(*this).completion.is_enqueued() {
            if let Some(receiver) = (*this).receiver.take() {
                receiver.set_stopped();
            }
        } else {
            // The completion is already committed to the queue and will run
            // first (and back off on the state bits); requeue the stop
            // behind it so exactly one signal is delivered.
            (*this).stop.execute.set(Some(Self::complete_with_stop as ExecuteFn));
            (*this).context.schedule_local(&mut (*this).stop);
        }
    }

    /// # Safety
    ///
    /// `this` must point at a live, pinned operation of this exact
    /// instantiation.
    unsafe fn request_stop_erased(this: *mut ()) {
        Self::request_stop(this as *mut Self);
    }

    /// Entered from the stop callback, on whatever thread requested stop.
    ///
    /// # Safety
    ///
    /// As for [`Self::request_stop_erased`].
    unsafe fn request_stop(this: *mut Self) {
        let old_state = (*this).state.fetch_add(REQUEST_STOPPED, Ordering::AcqRel);
        if old_state & OPERATION_ENDED_MASK == 0 {
            // The I/O has not completed: deregister so the wakeup never
            // fires, then carry the stop across to the I/O thread.
            Self::remove_events(this);
            (*this).stop.execute.set(Some(Self::complete_with_stop as ExecuteFn));
            (*this).context.schedule_remote(&mut (*this).stop);
        }
        // Otherwise the I/O side already claimed the completion.
    }

    /// # Safety
    ///
    /// As for [`Self::perform_first`].
    unsafe fn add_events(this: *mut Self) -> Result<(), Error> {
        let token: *mut OpBase = &mut (*this).completion;
        (*this)
            .context
            .register_io(
                (*this).socket.native_handle(),
                token,
                (*this).kind.interest(),
            )
            .map_err(Error::from)
    }

    /// Best effort: the state handoff, not the multiplexer, decides who
    /// completes. Called from both sides of a cancellation race, so a
    /// missing registration is expected.
    ///
    /// # Safety
    ///
    /// `this` must be live and pinned.
    unsafe fn remove_events(this: *mut Self) {
        if let Err(err) = (*this)
            .context
            .deregister_io((*this).socket.native_handle())
        {
            trace!("deregister during completion/stop race: {}", err);
        }
    }
}

impl<R, D> OperationState for SocketOp<'_, R, D>
where
    R: Receiver<Value = D::Value>,
    D: Driver,
{
    fn start(self: Pin<&mut Self>) {
        // SAFETY: the operation is pinned; every pointer handed out below
        // stays valid until the receiver is signalled.
        unsafe {
            let this = self.get_unchecked_mut();
            debug_assert!(this.receiver.is_some(), "operation started without receiver");
            if this.context.is_running_on_io_thread() {
                Self::perform_first(this);
            } else {
                this.completion
                    .execute
                    .set(Some(Self::on_schedule_complete as ExecuteFn));
                this.context.schedule_remote(&mut this.completion);
            }
        }
    }
}
