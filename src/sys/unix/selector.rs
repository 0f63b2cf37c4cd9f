use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use libc::{EPOLLET, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI};

use crate::interest::Interest;

/// Maximum number of events collected per `epoll_wait` call.
pub(crate) const EVENTS_CAPACITY: usize = 256;

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    /// Wait for readiness events.
    ///
    /// Blocks indefinitely when `block` is true, otherwise polls with a zero
    /// timeout. Retries when the wait is interrupted by a signal.
    pub(crate) fn select(&self, events: &mut Events, block: bool) -> io::Result<()> {
        let timeout: libc::c_int = if block { -1 } else { 0 };

        events.clear();
        loop {
            match syscall!(epoll_wait(
                self.ep.as_raw_fd(),
                events.as_mut_ptr(),
                events.capacity() as i32,
                timeout,
            )) {
                Ok(n_events) => {
                    // This is safe because `epoll_wait` ensures that
                    // `n_events` are assigned.
                    unsafe { events.set_len(n_events as usize) };
                    return Ok(());
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Register `fd` with edge-triggered notification for `interests`.
    ///
    /// `token` is returned verbatim in the event's user data and is what maps
    /// a readiness record back to the waiting party.
    pub(crate) fn register(&self, fd: RawFd, token: u64, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: token,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())).map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = EPOLLET | EPOLLERR | EPOLLHUP;

    if interests.is_readable() {
        kind |= EPOLLIN;
    }

    if interests.is_writable() {
        kind |= EPOLLOUT;
    }

    if interests.is_priority() {
        kind |= EPOLLPRI;
    }

    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::Event;

    pub(crate) fn token(event: &Event) -> u64 {
        event.u64
    }
}
