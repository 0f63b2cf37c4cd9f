use std::{error, fmt, io};

/// The error type delivered through `set_error` and returned by the socket
/// verbs.
///
/// The runtime straddles two error domains: raw POSIX errnos coming out of
/// syscalls, and a small set of conditions the kernel has no code for. Both
/// are folded into one sum type so an error signal is a single copyable
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A raw OS errno, e.g. `libc::ECONNRESET`.
    Os(i32),
    /// A stream-oriented read observed a clean end-of-stream.
    ///
    /// Datagram sockets never produce this; a zero-byte datagram is a value.
    Eof,
    /// The operation was consumed by a cancellation request.
    ///
    /// Never delivered through `set_error`; completion maps it to
    /// `set_stopped`.
    Canceled,
    /// `run()` was called while another thread was already driving the
    /// context.
    AlreadyRunning,
}

impl Error {
    /// True for `EAGAIN`/`EWOULDBLOCK`, the transient "no progress possible"
    /// results that arm an operation instead of completing it.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Os(code) if *code == libc::EAGAIN || *code == libc::EWOULDBLOCK)
    }

    /// True for `EINTR`.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Os(libc::EINTR))
    }

    /// True if this error represents a cancelled operation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled | Error::Os(libc::ECANCELED))
    }

    /// The raw errno, if this is an OS error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Os(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Os(code) => io::Error::from_raw_os_error(*code).fmt(fmt),
            Error::Eof => write!(fmt, "end of file"),
            Error::Canceled => write!(fmt, "operation canceled"),
            Error::AlreadyRunning => write!(fmt, "context is already running"),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(code) => Error::Os(code),
            None => match err.kind() {
                io::ErrorKind::UnexpectedEof => Error::Eof,
                _ => Error::Os(libc::EIO),
            },
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Os(code) => io::Error::from_raw_os_error(code),
            Error::Eof => io::ErrorKind::UnexpectedEof.into(),
            Error::Canceled => io::Error::from_raw_os_error(libc::ECANCELED),
            Error::AlreadyRunning => io::Error::from_raw_os_error(libc::EBUSY),
        }
    }
}
