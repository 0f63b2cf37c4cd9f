//! Raw OS plumbing.
//!
//! Everything in this module speaks `std::io::Result`; the operation layer
//! translates into [`crate::Error`](crate::Error) at the boundary.

#[macro_use]
mod unix;

pub(crate) use self::unix::eventfd::Interrupter;
pub(crate) use self::unix::net;
pub(crate) use self::unix::selector::{event, Event, Events, Selector, EVENTS_CAPACITY};
pub(crate) use self::unix::timerfd::TimerFd;
