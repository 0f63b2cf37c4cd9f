use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use log::warn;

/// Wakes a blocked `epoll_wait` from another thread.
///
/// Backed by `eventfd`, which is effectively a 64 bit counter: every
/// `interrupt` adds one to the counter and makes the read end readable, so
/// any number of interrupts between two waits coalesce into a single
/// readiness event. When `eventfd` is unavailable a non-blocking pipe takes
/// its place and the read and write ends differ.
///
/// The run loop registers [`read_fd`] edge-triggered and never reads it;
/// producers set their own flags and the loop checks those instead.
///
/// [`read_fd`]: Interrupter::read_fd
#[derive(Debug)]
pub(crate) struct Interrupter {
    reader: File,
    /// Only present for the pipe fallback; `eventfd` reads and writes the
    /// same descriptor.
    writer: Option<File>,
}

impl Interrupter {
    pub(crate) fn new() -> io::Result<Interrupter> {
        match syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)) {
            Ok(fd) => {
                // SAFETY: `eventfd(2)` ensures the fd is valid.
                let reader = unsafe { File::from_raw_fd(fd) };
                Ok(Interrupter {
                    reader,
                    writer: None,
                })
            }
            Err(err) => {
                warn!("eventfd unavailable ({}), falling back to a pipe", err);
                Interrupter::from_pipe()
            }
        }
    }

    fn from_pipe() -> io::Result<Interrupter> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
        // SAFETY: `pipe2(2)` ensures both fds are valid.
        let reader = unsafe { File::from_raw_fd(fds[0]) };
        let writer = unsafe { File::from_raw_fd(fds[1]) };
        Ok(Interrupter {
            reader,
            writer: Some(writer),
        })
    }

    /// Make [`read_fd`] readable.
    ///
    /// [`read_fd`]: Interrupter::read_fd
    pub(crate) fn interrupt(&self) -> io::Result<()> {
        let result = match self.writer.as_ref() {
            None => (&self.reader).write(&1u64.to_ne_bytes()).map(drop),
            Some(mut writer) => (writer).write(&[1u8]).map(drop),
        };
        match result {
            Ok(()) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The counter (or pipe) is full, which already guarantees a
                // pending readiness event. Drain it and signal again so the
                // edge-triggered registration fires once more.
                self.reset()?;
                self.interrupt()
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.interrupt(),
            Err(err) => Err(err),
        }
    }

    /// Drain whatever was written. Safe to call while no interrupt is
    /// pending.
    pub(crate) fn reset(&self) -> io::Result<()> {
        if self.writer.is_none() {
            // A single read resets the kernel-maintained counter to zero.
            let mut buf = [0u8; 8];
            match (&self.reader).read(&mut buf) {
                Ok(_) => Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.reset(),
                Err(err) => Err(err),
            }
        } else {
            let mut buf = [0u8; 1024];
            loop {
                match (&self.reader).read(&mut buf) {
                    Ok(n) if n == buf.len() => continue,
                    Ok(_) => return Ok(()),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
        }
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}
