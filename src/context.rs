use std::cell::{Cell, UnsafeCell};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use log::trace;

use crate::error::Error;
use crate::interest::Interest;
use crate::op::{OpBase, CANCEL_PENDING_MASK, TIMER_ELAPSED};
use crate::queue::{Queue, RemoteQueue};
use crate::schedule::{ScheduleAtSender, ScheduleSender};
use crate::stop::{StopSource, StopToken};
use crate::sys::{Events, Interrupter, Selector, TimerFd};
use crate::time::TimePoint;
use crate::timer::{TimerHeap, TimerOp};

std::thread_local! {
    // Address of the context the current thread is driving, if any.
    static CURRENT_CONTEXT: Cell<*const Context> = const { Cell::new(ptr::null()) };
}

// Multiplexer user data. Operation completions carry the address of their
// completion sub-node, which is always at least pointer-aligned, so small
// integers can never collide with one.
const WAKE_TOKEN: u64 = 1;
const TIMER_TOKEN: u64 = 2;

// Reprogramming the kernel timer for a deadline less than this much earlier
// than the currently programmed one is not worth the syscall.
const REPROGRAM_THRESHOLD: Duration = Duration::from_micros(1);

/// A single-threaded I/O reactor.
///
/// The context owns an epoll instance, a kernel timer, and an [interrupter]
/// and multiplexes readiness, timer expirations and cross-thread
/// submissions onto whichever thread calls [`run`] (the "I/O thread").
/// Exactly one thread may drive a context at a time; all other threads
/// interact with it through its [`Scheduler`] and through
/// [`request_stop`], both of which are thread-safe.
///
/// [`request_stop`] makes [`run`] return after the current drain. In-flight
/// operations are not individually cancelled: their storage is owned by
/// their callers and simply outlives the loop. Cancel operations through
/// their receivers' stop tokens when a graceful teardown is needed.
///
/// # Implementation notes
///
/// Each turn of the run loop, in order: drain the local queue (work queued
/// during the drain waits for the next turn), check for a stop request,
/// reconcile the timer heap with the kernel timer if it is dirty, splice
/// any remote submissions onto the local queue, then wait on `epoll` —
/// indefinitely when the local queue is empty, with a zero timeout
/// otherwise.
///
/// Three kinds of registration share the epoll instance. The interrupter
/// and the kernel timer are registered once at construction under fixed
/// tokens; every other readiness record carries the address of a waiting
/// operation, so dispatch is a pointer cast rather than a table lookup.
/// The interrupter's eventfd is never read: it stays armed, edge-triggered,
/// and producers communicate through flags instead of the counter value.
///
/// Operations never allocate on submission. Both queues and the timer heap
/// link through nodes embedded in the operation states themselves, which
/// is why operations must stay pinned from start to completion.
///
/// [interrupter]: crate::sys::Interrupter
/// [`run`]: Context::run
/// [`request_stop`]: Context::request_stop
pub struct Context {
    // Field order is drop order: the descriptors close in reverse creation
    // order, the epoll instance last.
    interrupter: Interrupter,
    timer_fd: TimerFd,
    selector: Selector,

    /// Pending timers, earliest deadline first. I/O thread only.
    timers: UnsafeCell<TimerHeap>,
    /// The deadline the kernel timer is currently programmed to.
    current_earliest_deadline: Cell<Option<TimePoint>>,
    /// Cleared when the interrupter fires; true once a remote-queue sweep
    /// found it empty.
    processed_remote_submissions: Cell<bool>,
    /// Tells the run loop to reconcile the kernel timer with the heap.
    timers_dirty: Cell<bool>,
    /// Ready-to-run operations. I/O thread only.
    local_queue: UnsafeCell<Queue>,
    /// Operations submitted by remote threads.
    remote_queue: RemoteQueue,
    /// Nodes currently sitting in either queue.
    outstanding_work: AtomicI64,
    stop_source: StopSource,
    is_running: AtomicBool,
}

// SAFETY: the non-`Sync` interior (timer heap, local queue, the `Cell`
// flags) is only touched from the I/O thread, which is unique per the
// `is_running` latch. Remote threads go through the atomic remote queue,
// the stop source and the interrupter only.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// Create a context and its three descriptors.
    ///
    /// Failure to create or register any of them is fatal to the runtime,
    /// so the error is surfaced here and the context never exists
    /// half-built.
    pub fn new() -> io::Result<Context> {
        let selector = Selector::new()?;
        let timer_fd = TimerFd::new()?;
        let interrupter = Interrupter::new()?;

        selector.register(timer_fd.raw_fd(), TIMER_TOKEN, Interest::READABLE)?;
        selector.register(interrupter.read_fd(), WAKE_TOKEN, Interest::READABLE)?;

        trace!(
            "created context: epoll={:?} timer={:?} wake={:?}",
            std::os::fd::AsRawFd::as_raw_fd(&selector),
            timer_fd.raw_fd(),
            interrupter.read_fd(),
        );

        Ok(Context {
            interrupter,
            timer_fd,
            selector,
            timers: UnsafeCell::new(TimerHeap::new()),
            current_earliest_deadline: Cell::new(None),
            processed_remote_submissions: Cell::new(false),
            timers_dirty: Cell::new(false),
            local_queue: UnsafeCell::new(Queue::new()),
            remote_queue: RemoteQueue::new(),
            outstanding_work: AtomicI64::new(0),
            stop_source: StopSource::new(),
            is_running: AtomicBool::new(false),
        })
    }

    /// Drive the context until stop is requested.
    ///
    /// Pins the calling thread as the I/O thread for the duration of the
    /// call. Returns [`Error::AlreadyRunning`] if another thread is already
    /// inside `run`.
    pub fn run(&self) -> Result<(), Error> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }
        let _guard = RunGuard::pin(self);

        trace!("context run loop entered");
        let mut events = Events::with_capacity(crate::sys::EVENTS_CAPACITY);
        loop {
            self.execute_local();
            if self.stop_source.stop_requested() {
                // Pending work is abandoned; callers own its storage.
                trace!("stop requested, leaving run loop");
                return Ok(());
            }
            if self.timers_dirty.get() {
                self.update_timers();
            }
            if !self.processed_remote_submissions.get() {
                // False after a splice: more producers may have queued
                // behind the batch we just collected.
                self.processed_remote_submissions
                    .set(self.try_schedule_remote_to_local());
            }
            self.acquire_completions(&mut events)
                .map_err(Error::from)?;
        }
    }

    /// Request the run loop to exit. Safe from any thread; idempotent.
    pub fn request_stop(&self) {
        self.stop_source.request_stop();
        // The loop may be parked in `epoll_wait`.
        let _ = self.interrupter.interrupt();
    }

    /// Whether stop has been requested on this context.
    pub fn stop_requested(&self) -> bool {
        self.stop_source.stop_requested()
    }

    /// A token observing this context's stop source.
    pub fn stop_token(&self) -> StopToken {
        self.stop_source.token()
    }

    /// Whether some thread is currently inside [`run`](Context::run).
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Whether the calling thread is the one driving this context.
    pub fn is_running_on_io_thread(&self) -> bool {
        CURRENT_CONTEXT.with(|current| ptr::eq(current.get(), self))
    }

    /// A cheap handle operations and sender factories hold.
    pub fn scheduler(&self) -> Scheduler<'_> {
        Scheduler { context: self }
    }

    // ===== scheduling primitives used by operations =====

    /// Push a ready operation onto the local queue.
    ///
    /// # Safety
    ///
    /// Must be called on the I/O thread with a valid, un-enqueued node
    /// whose `execute` is installed.
    pub(crate) unsafe fn schedule_local(&self, op: *mut OpBase) {
        debug_assert!(self.is_running_on_io_thread() || !self.is_running());
        debug_assert!((*op).execute.get().is_some());
        debug_assert!(!(*op).is_enqueued());
        (*op).enqueued.store(true, Ordering::Relaxed);
        (*self.local_queue.get()).push_back(op);
        self.outstanding_work.fetch_add(1, Ordering::Relaxed);
    }

    /// Splice a whole queue onto the local queue.
    ///
    /// The `enqueued` flags are left untouched: the nodes come straight off
    /// the remote queue and are still marked.
    ///
    /// # Safety
    ///
    /// Must be called on the I/O thread.
    unsafe fn schedule_local_queue(&self, ops: Queue) {
        (*self.local_queue.get()).append(ops);
    }

    /// Hand an operation to the I/O thread from a remote thread.
    ///
    /// # Safety
    ///
    /// `op` must be a valid, un-enqueued node with `execute` installed, and
    /// must stay alive until the I/O thread dispatches it.
    pub(crate) unsafe fn schedule_remote(&self, op: *mut OpBase) {
        debug_assert!((*op).execute.get().is_some());
        debug_assert!(!(*op).is_enqueued());
        (*op).enqueued.store(true, Ordering::Relaxed);
        self.outstanding_work.fetch_add(1, Ordering::Relaxed);
        if self.remote_queue.enqueue(op) {
            // We were the first to queue onto an inactive consumer; the I/O
            // thread will not re-check the remote queue until woken.
            let _ = self.interrupter.interrupt();
        }
    }

    /// Dispatch to the local or remote queue based on the calling thread.
    ///
    /// # Safety
    ///
    /// As for [`schedule_local`](Context::schedule_local) /
    /// [`schedule_remote`](Context::schedule_remote).
    pub(crate) unsafe fn schedule(&self, op: *mut OpBase) {
        if self.is_running_on_io_thread() {
            self.schedule_local(op);
        } else {
            self.schedule_remote(op);
        }
    }

    /// Insert a timer into the heap. Must be called on the I/O thread.
    ///
    /// # Safety
    ///
    /// `op` must be a valid timer node not currently in the heap.
    pub(crate) unsafe fn schedule_at_insert(&self, op: *mut TimerOp) {
        debug_assert!(self.is_running_on_io_thread());
        let timers = &mut *self.timers.get();
        timers.insert(op);
        if ptr::eq(timers.top(), op) {
            self.timers_dirty.set(true);
        }
    }

    /// Remove a timer from the heap. Must be called on the I/O thread.
    ///
    /// # Safety
    ///
    /// `op` must currently be in the heap.
    pub(crate) unsafe fn remove_timer(&self, op: *mut TimerOp) {
        debug_assert!(self.is_running_on_io_thread());
        let timers = &mut *self.timers.get();
        debug_assert!(!timers.is_empty());
        if ptr::eq(timers.top(), op) {
            self.timers_dirty.set(true);
        }
        timers.remove(op);
    }

    /// Register a socket operation's descriptor with the multiplexer. The
    /// token is the address of the operation's completion sub-node.
    pub(crate) fn register_io(
        &self,
        fd: RawFd,
        token: *mut OpBase,
        interests: Interest,
    ) -> io::Result<()> {
        self.selector.register(fd, token as u64, interests)
    }

    pub(crate) fn deregister_io(&self, fd: RawFd) -> io::Result<()> {
        self.selector.deregister(fd)
    }

    // ===== run loop internals =====

    /// Run everything currently on the local queue.
    ///
    /// Operations enqueued while this drain runs are deferred to the next
    /// iteration, which bounds the work per turn.
    fn execute_local(&self) -> usize {
        // SAFETY: I/O thread. The queue is swapped out before any `execute`
        // runs, so re-entrant scheduling pushes onto a fresh queue.
        let mut pending = unsafe { mem::replace(&mut *self.local_queue.get(), Queue::new()) };
        let mut count = 0;
        loop {
            let item = pending.pop_front();
            if item.is_null() {
                break;
            }
            // SAFETY: nodes on the queue are alive and enqueued by the
            // scheduling contract.
            unsafe {
                debug_assert!((*item).is_enqueued());
                (*item).enqueued.store(false, Ordering::Release);
                (*item).next.set(ptr::null_mut());
                if let Some(execute) = (*item).execute.get() {
                    execute(item);
                }
            }
            self.outstanding_work.fetch_sub(1, Ordering::Relaxed);
            count += 1;
        }
        count
    }

    /// Collect a batch from the remote queue, or mark it inactive.
    ///
    /// Returns true if the remote queue was empty (and is now inactive).
    fn try_schedule_remote_to_local(&self) -> bool {
        let queued_items = self.remote_queue.try_mark_inactive_or_dequeue_all();
        if queued_items.is_empty() {
            true
        } else {
            // SAFETY: I/O thread.
            unsafe { self.schedule_local_queue(queued_items) };
            false
        }
    }

    /// Reconcile the timer heap with the kernel timer.
    fn update_timers(&self) {
        // SAFETY: I/O thread; the heap is not touched reentrantly from
        // here (completions only get queued, not run).
        let timers = unsafe { &mut *self.timers.get() };

        // Reap elapsed timers.
        if !timers.is_empty() {
            let now = TimePoint::now();
            while !timers.is_empty() {
                let top = timers.top();
                // SAFETY: non-empty heap, `top` is a live timer node.
                unsafe {
                    if (*top).deadline.get() > now {
                        break;
                    }
                    let op = timers.pop();
                    if (*op).can_be_cancelled.get() {
                        let old_state = (*op).state.fetch_or(TIMER_ELAPSED, Ordering::AcqRel);
                        if old_state & CANCEL_PENDING_MASK != 0 {
                            // A remote cancellation owns this completion and
                            // will enqueue the node itself.
                            continue;
                        }
                    }
                    self.schedule_local((*op).as_op_base());
                }
            }
        }

        // Program (or disarm) the kernel timer.
        if timers.is_empty() {
            if self.current_earliest_deadline.get().is_some() {
                self.current_earliest_deadline.set(None);
                if let Err(err) = self.timer_fd.disarm() {
                    trace!("failed to disarm kernel timer: {}", err);
                }
            }
        } else {
            // SAFETY: non-empty heap.
            let earliest_deadline = unsafe { (*timers.top()).deadline.get() };
            let reprogram = match self.current_earliest_deadline.get() {
                Some(current) => earliest_deadline < current - REPROGRAM_THRESHOLD,
                None => true,
            };
            if reprogram {
                if let Err(err) = self.timer_fd.set(earliest_deadline) {
                    trace!("failed to arm kernel timer: {}", err);
                }
                self.current_earliest_deadline.set(Some(earliest_deadline));
            }
        }

        self.timers_dirty.set(false);
    }

    /// Wait on the multiplexer and queue whatever became ready.
    ///
    /// Blocks indefinitely only when there is nothing on the local queue;
    /// the timer fd and the interrupter both break the sleep.
    fn acquire_completions(&self, events: &mut Events) -> io::Result<()> {
        // SAFETY: I/O thread; the borrow ends before `select`.
        let block = unsafe { (*self.local_queue.get()).is_empty() };
        self.selector.select(events, block)?;

        for event in events.iter() {
            match crate::sys::event::token(event) {
                WAKE_TOKEN => {
                    // Leave the eventfd readable and rely on edge-triggered
                    // notification; the flag makes the loop sweep the remote
                    // queue again.
                    self.processed_remote_submissions.set(false);
                }
                TIMER_TOKEN => {
                    self.current_earliest_deadline.set(None);
                    self.timers_dirty.set(true);
                    self.timer_fd.drain()?;
                }
                token => {
                    let completion = token as usize as *mut OpBase;
                    // SAFETY: the token was registered as the address of a
                    // completion sub-node of an operation that stays alive
                    // while registered.
                    unsafe {
                        debug_assert!(!(*completion).is_enqueued());
                        self.schedule_local(completion);
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Context")
            .field("is_running", &self.is_running())
            .field("stop_requested", &self.stop_requested())
            .field(
                "outstanding_work",
                &self.outstanding_work.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Restores the thread-local pin and the running latch when `run` exits.
struct RunGuard<'a> {
    context: &'a Context,
    previous: *const Context,
}

impl<'a> RunGuard<'a> {
    fn pin(context: &'a Context) -> RunGuard<'a> {
        let previous = CURRENT_CONTEXT.with(|current| current.replace(context));
        RunGuard { context, previous }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        CURRENT_CONTEXT.with(|current| current.set(self.previous));
        self.context.is_running.store(false, Ordering::Release);
    }
}

/// A lightweight handle to a [`Context`], used to build senders.
///
/// Copyable and comparable; two schedulers are equal when they point at the
/// same context.
#[derive(Clone, Copy)]
pub struct Scheduler<'ctx> {
    context: &'ctx Context,
}

impl<'ctx> Scheduler<'ctx> {
    /// A sender that completes on the I/O thread as soon as the loop gets
    /// to it.
    pub fn schedule(self) -> ScheduleSender<'ctx> {
        ScheduleSender::new(self.context)
    }

    /// A sender that completes on the I/O thread once `deadline` has
    /// passed.
    pub fn schedule_at(self, deadline: TimePoint) -> ScheduleAtSender<'ctx> {
        ScheduleAtSender::new(self.context, deadline)
    }

    /// A sender that completes on the I/O thread once `delay` has elapsed.
    pub fn schedule_after(self, delay: Duration) -> ScheduleAtSender<'ctx> {
        ScheduleAtSender::new(self.context, TimePoint::now() + delay)
    }

    /// The current reading of the clock timers run against.
    pub fn now(self) -> TimePoint {
        TimePoint::now()
    }

    pub(crate) fn context(self) -> &'ctx Context {
        self.context
    }
}

impl PartialEq for Scheduler<'_> {
    fn eq(&self, other: &Scheduler<'_>) -> bool {
        ptr::eq(self.context, other.context)
    }
}

impl Eq for Scheduler<'_> {}

impl std::fmt::Debug for Scheduler<'_> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Scheduler")
            .field("context", &(self.context as *const Context))
            .finish()
    }
}
