use std::marker::PhantomPinned;
use std::pin::Pin;
use std::sync::atomic::Ordering;

use crate::context::Context;
use crate::exec::{OperationState, Receiver, Sender};
use crate::op::{ExecuteFn, OpBase, SendPtr, CANCEL_PENDING, TIMER_ELAPSED};
use crate::stop::StopCallback;
use crate::time::TimePoint;
use crate::timer::TimerOp;

/// Sender for an immediate transfer onto the I/O thread.
///
/// Returned by [`Scheduler::schedule`](crate::Scheduler::schedule).
#[derive(Debug, Clone, Copy)]
pub struct ScheduleSender<'ctx> {
    context: &'ctx Context,
}

impl<'ctx> ScheduleSender<'ctx> {
    pub(crate) fn new(context: &'ctx Context) -> ScheduleSender<'ctx> {
        ScheduleSender { context }
    }
}

impl<'ctx> Sender for ScheduleSender<'ctx> {
    type Value = ();

    type Operation<R> = ScheduleOp<'ctx, R>
    where
        R: Receiver<Value = ()>;

    fn connect<R>(self, receiver: R) -> ScheduleOp<'ctx, R>
    where
        R: Receiver<Value = ()>,
    {
        ScheduleOp {
            base: OpBase::new(),
            context: self.context,
            receiver: Some(receiver),
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`ScheduleSender`].
///
/// Too short-lived to be independently cancellable: the only stop window is
/// the token check at dispatch.
#[repr(C)]
pub struct ScheduleOp<'ctx, R> {
    base: OpBase,
    context: &'ctx Context,
    receiver: Option<R>,
    _pin: PhantomPinned,
}

impl<R> ScheduleOp<'_, R>
where
    R: Receiver<Value = ()>,
{
    /// Dispatched by the run loop.
    ///
    /// # Safety
    ///
    /// `op` is the node of a live, pinned `ScheduleOp` popped off a queue.
    unsafe fn execute_impl(op: *mut OpBase) {
        let this = op as *mut Self;
        if let Some(receiver) = (*this).receiver.take() {
            let stop_token = receiver.stop_token();
            if stop_token.stop_requested() {
                receiver.set_stopped();
            } else {
                receiver.set_value(());
            }
        }
    }
}

impl<R> OperationState for ScheduleOp<'_, R>
where
    R: Receiver<Value = ()>,
{
    fn start(self: Pin<&mut Self>) {
        // SAFETY: the operation is pinned; the pointer handed to the queue
        // stays valid until the receiver is signalled.
        unsafe {
            let this = self.get_unchecked_mut();
            debug_assert!(this.base.execute.get().is_none(), "operation started twice");
            this.base.execute.set(Some(Self::execute_impl as ExecuteFn));
            this.context.schedule(&mut this.base);
        }
    }
}

/// Sender for a transfer onto the I/O thread at an absolute deadline.
///
/// Returned by [`Scheduler::schedule_at`](crate::Scheduler::schedule_at)
/// and [`Scheduler::schedule_after`](crate::Scheduler::schedule_after).
#[derive(Debug, Clone, Copy)]
pub struct ScheduleAtSender<'ctx> {
    context: &'ctx Context,
    deadline: TimePoint,
}

impl<'ctx> ScheduleAtSender<'ctx> {
    pub(crate) fn new(context: &'ctx Context, deadline: TimePoint) -> ScheduleAtSender<'ctx> {
        ScheduleAtSender { context, deadline }
    }
}

impl<'ctx> Sender for ScheduleAtSender<'ctx> {
    type Value = ();

    type Operation<R> = ScheduleAtOp<'ctx, R>
    where
        R: Receiver<Value = ()>;

    fn connect<R>(self, receiver: R) -> ScheduleAtOp<'ctx, R>
    where
        R: Receiver<Value = ()>,
    {
        ScheduleAtOp {
            timer: TimerOp::new(self.deadline),
            context: self.context,
            receiver: Some(receiver),
            stop_callback: None,
            _pin: PhantomPinned,
        }
    }
}

/// Operation state of [`ScheduleAtSender`].
///
/// Sits in the context's timer heap until its deadline. Cancellation races
/// against the deadline through the `TIMER_ELAPSED`/`CANCEL_PENDING` bits:
/// whichever side's read-modify-write misses the other's bit takes
/// responsibility for the single completion.
#[repr(C)]
pub struct ScheduleAtOp<'ctx, R> {
    timer: TimerOp,
    context: &'ctx Context,
    receiver: Option<R>,
    stop_callback: Option<StopCallback>,
    _pin: PhantomPinned,
}

impl<R> ScheduleAtOp<'_, R>
where
    R: Receiver<Value = ()>,
{
    /// Ran on the I/O thread after a remote start crossed over.
    ///
    /// # Safety
    ///
    /// `op` is the node of a live, pinned `ScheduleAtOp` popped off a queue.
    unsafe fn on_schedule_complete(op: *mut OpBase) {
        Self::start_local(op as *mut Self);
    }

    /// # Safety
    ///
    /// Must run on the I/O thread with `this` live and pinned.
    unsafe fn start_local(this: *mut Self) {
        let stop_token = match (*this).receiver.as_ref() {
            Some(receiver) => receiver.stop_token(),
            None => return,
        };

        if stop_token.stop_requested() {
            // Stop already requested. Don't bother adding the timer.
            (*this).timer.base.execute.set(Some(Self::complete_with_stop as ExecuteFn));
            (*this).context.schedule_local((*this).timer.as_op_base());
            return;
        }

        (*this)
            .timer
            .base
            .execute
            .set(Some(Self::complete_with_value as ExecuteFn));
        (*this).timer.can_be_cancelled.set(stop_token.stop_possible());
        (*this).context.schedule_at_insert(&mut (*this).timer);

        if stop_token.stop_possible() {
            // The callback must be a `'static` closure, so the operation
            // pointer crosses into it type-erased with a matching
            // trampoline. An already-stopped token invokes the callback
            // inline, on this thread, which takes the local cancellation
            // path below.
            let ptr = SendPtr(this as *mut ());
            let request_stop = Self::request_stop_erased as unsafe fn(*mut ());
            (*this).stop_callback = stop_token.register(move || {
                // Force capture of the whole `SendPtr` (not just its `.0`
                // field) so the closure relies on `SendPtr`'s `Send` impl
                // rather than `*mut ()`'s lack of one.
                let ptr = ptr;
                // SAFETY: the operation outlives its registration; the
                // handle is dropped before the receiver is signalled.
                unsafe { request_stop(ptr.0) };
            });
        }
    }

    /// # Safety
    ///
    /// `this` must point at a live, pinned `ScheduleAtOp` of this exact
    /// instantiation.
    unsafe fn request_stop_erased(this: *mut ()) {
        Self::request_stop(this as *mut Self);
    }

    /// The timer reached the front of the ready-to-run queue.
    ///
    /// # Safety
    ///
    /// As for [`Self::on_schedule_complete`].
    unsafe fn complete_with_value(op: *mut OpBase) {
        let this = op as *mut Self;
        drop((*this).stop_callback.take());
        if let Some(receiver) = (*this).receiver.take() {
            if receiver.stop_token().stop_requested() {
                receiver.set_stopped();
            } else {
                receiver.set_value(());
            }
        }
    }

    /// # Safety
    ///
    /// As for [`Self::on_schedule_complete`].
    unsafe fn complete_with_stop(op: *mut OpBase) {
        let this = op as *mut Self;
        if let Some(receiver) = (*this).receiver.take() {
            receiver.set_stopped();
        }
    }

    /// Remote cancellation crossing back onto the I/O thread.
    ///
    /// # Safety
    ///
    /// As for [`Self::on_schedule_complete`].
    unsafe fn remove_timer_and_complete_with_stopped(op: *mut OpBase) {
        let this = op as *mut Self;
        debug_assert!((*this).context.is_running_on_io_thread());
        drop((*this).stop_callback.take());

        let state = (*this).timer.state.load(Ordering::Relaxed);
        if state & TIMER_ELAPSED == 0 {
            // Timer not yet removed from the timer heap. Do that now.
            (*this).context.remove_timer(&mut (*this).timer);
        }

        if let Some(receiver) = (*this).receiver.take() {
            receiver.set_stopped();
        }
    }

    /// Entered from the stop callback, on whatever thread requested stop.
    ///
    /// # Safety
    ///
    /// `this` must be live and pinned, with its stop callback registered.
    unsafe fn request_stop(this: *mut Self) {
        if (*this).context.is_running_on_io_thread() {
            Self::request_stop_local(this);
        } else {
            Self::request_stop_remote(this);
        }
    }

    /// # Safety
    ///
    /// As for [`Self::request_stop`], on the I/O thread.
    unsafe fn request_stop_local(this: *mut Self) {
        debug_assert!((*this).context.is_running_on_io_thread());
        drop((*this).stop_callback.take());
        (*this).timer.base.execute.set(Some(Self::complete_with_stop as ExecuteFn));

        let state = (*this).timer.state.load(Ordering::Relaxed);
        if state & TIMER_ELAPSED == 0 {
            // Timer not yet elapsed. Remove it from the heap and enqueue the
            // cancellation.
            (*this).context.remove_timer(&mut (*this).timer);
            (*this).context.schedule_local((*this).timer.as_op_base());
        }
        // Otherwise the elapsed timer is already on the ready-to-run queue
        // and will observe the stop request when dispatched.
    }

    /// # Safety
    ///
    /// As for [`Self::request_stop`].
    unsafe fn request_stop_remote(this: *mut Self) {
        let old_state = (*this).timer.state.fetch_add(CANCEL_PENDING, Ordering::AcqRel);
        if old_state & TIMER_ELAPSED == 0 {
            // The timer had not yet elapsed: this thread owns the completion
            // of the operation.
            (*this)
                .timer
                .base
                .execute
                .set(Some(Self::remove_timer_and_complete_with_stopped as ExecuteFn));
            (*this).context.schedule_remote((*this).timer.as_op_base());
        }
    }
}

impl<R> OperationState for ScheduleAtOp<'_, R>
where
    R: Receiver<Value = ()>,
{
    fn start(self: Pin<&mut Self>) {
        // SAFETY: the operation is pinned; every pointer handed out below
        // stays valid until the receiver is signalled.
        unsafe {
            let this = self.get_unchecked_mut();
            debug_assert!(
                this.timer.base.execute.get().is_none(),
                "operation started twice"
            );
            if this.context.is_running_on_io_thread() {
                Self::start_local(this);
            } else {
                this.timer
                    .base
                    .execute
                    .set(Some(Self::on_schedule_complete as ExecuteFn));
                this.context.schedule_remote(this.timer.as_op_base());
            }
        }
    }
}
