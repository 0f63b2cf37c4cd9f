//! A sender-oriented non-blocking socket runtime built on epoll.
//!
//! Exio drives typed, composable socket operations (accept, recv, send) and
//! timers from a single-threaded event loop, the [`Context`]. Work reaches
//! the loop from any thread through a lock-free remote queue; the loop
//! multiplexes socket readiness, a kernel timer and cross-thread wake-ups
//! over one `epoll` instance.
//!
//! Asynchronous work is expressed as [`Sender`]s. A sender does nothing by
//! itself: [`connect`](Sender::connect)ing it to a [`Receiver`] yields an
//! [`OperationState`], and [`start`](OperationState::start)ing that runs the
//! operation to exactly one of three completions — `set_value`, `set_error`
//! or `set_stopped`. Cancellation flows through the receiver's
//! [`StopToken`]; a stop request races safely against the operation and one
//! side always wins outright.
//!
//! # Example
//!
//! Transfer onto the I/O thread and print from there:
//!
//! ```no_run
//! use std::pin::pin;
//! use std::thread;
//! use std::time::Duration;
//!
//! use exio::{Context, OperationState, Receiver, Sender};
//!
//! struct Print;
//!
//! impl Receiver for Print {
//!     type Value = ();
//!
//!     fn set_value(self, _: ()) {
//!         println!("hello from the I/O thread");
//!     }
//!
//!     fn set_error(self, err: exio::Error) {
//!         eprintln!("schedule failed: {}", err);
//!     }
//!
//!     fn set_stopped(self) {}
//! }
//!
//! let context = Context::new().expect("unable to create context");
//! thread::scope(|scope| {
//!     scope.spawn(|| context.run().expect("unable to run context"));
//!
//!     let mut op = pin!(context.scheduler().schedule().connect(Print));
//!     op.as_mut().start();
//!
//!     thread::sleep(Duration::from_millis(100));
//!     context.request_stop();
//! });
//! ```
//!
//! # Threading model
//!
//! Exactly one thread may drive [`Context::run`] at a time (the "I/O
//! thread"); a second call fails with [`Error::AlreadyRunning`]. Any thread
//! may create senders, start operations and request stop. Operations started
//! off the I/O thread hop onto it through the remote queue before doing any
//! I/O.
//!
//! # Operation lifetimes
//!
//! Operation states are pinned and must stay alive until their receiver has
//! been signalled. [`Context::request_stop`] abandons pending work rather
//! than cancelling it; cancel individual operations through their stop
//! tokens when teardown needs to be graceful.

#![cfg(any(target_os = "linux", target_os = "android"))]

// Macro must be imported before any module that uses it.
#[macro_use]
mod sys;

mod buf;
mod context;
mod error;
mod exec;
mod interest;
mod op;
mod ops;
mod queue;
mod schedule;
mod stop;
mod time;
mod timer;

pub mod net;

pub use crate::buf::{ConstBufferSequence, MutBufferSequence};
pub use crate::context::{Context, Scheduler};
pub use crate::error::Error;
pub use crate::exec::{OperationState, Receiver, Sender};
pub use crate::interest::Interest;
pub use crate::ops::{
    async_accept, async_recv_some, async_send_some, AcceptDriver, AcceptSender, Driver,
    RecvDriver, RecvSomeSender, SendDriver, SendSomeSender, SocketOp,
};
pub use crate::schedule::{ScheduleAtOp, ScheduleAtSender, ScheduleOp, ScheduleSender};
pub use crate::stop::{StopCallback, StopSource, StopToken};
pub use crate::time::TimePoint;
