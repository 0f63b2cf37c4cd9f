use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::Error;
use crate::sys::net;

/// A non-blocking socket descriptor.
///
/// Owns its fd and closes it on drop. The non-blocking verbs never block:
/// they retry on `EINTR` internally and surface `EAGAIN`/`EWOULDBLOCK` as
/// [`Error::Os`] for the operation layer to treat as "arm and wait".
/// Operations borrow the socket; closing it while an operation is in flight
/// is the caller's responsibility to avoid.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
    /// Stream sockets surface a clean zero-byte read as [`Error::Eof`];
    /// datagram sockets report it as a value.
    stream_oriented: bool,
}

impl Socket {
    pub(crate) fn from_owned(fd: OwnedFd, stream_oriented: bool) -> Socket {
        Socket {
            fd,
            stream_oriented,
        }
    }

    pub(crate) fn new(domain: libc::c_int, socket_type: libc::c_int) -> Result<Socket, Error> {
        let fd = net::new_socket(domain, socket_type)?;
        // SAFETY: `new_socket` returns a freshly created, valid fd.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Socket::from_owned(fd, socket_type == libc::SOCK_STREAM))
    }

    /// The raw descriptor, e.g. for multiplexer registration.
    pub fn native_handle(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Whether this socket is stream-oriented (as opposed to datagram).
    pub fn is_stream_oriented(&self) -> bool {
        self.stream_oriented
    }

    /// Switch the descriptor's non-blocking mode.
    pub fn set_non_blocking(&self, non_blocking: bool) -> Result<(), Error> {
        let flags = syscall!(fcntl(self.native_handle(), libc::F_GETFL))?;
        let flags = if non_blocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        syscall!(fcntl(self.native_handle(), libc::F_SETFL, flags))?;
        Ok(())
    }

    /// Accept one pending connection without blocking.
    ///
    /// The returned socket is already non-blocking and close-on-exec.
    pub fn non_blocking_accept(&self) -> Result<Socket, Error> {
        loop {
            match syscall!(accept4(
                self.native_handle(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )) {
                // SAFETY: `accept4(2)` returns a freshly created, valid fd.
                Ok(fd) => return Ok(Socket::from_owned(unsafe { OwnedFd::from_raw_fd(fd) }, true)),
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Read some bytes without blocking.
    ///
    /// On a stream socket a zero-byte result for a non-empty buffer means
    /// the peer shut down its write side and is surfaced as [`Error::Eof`];
    /// on a datagram socket it is an empty datagram and is a value.
    pub fn non_blocking_recv(&self, buf: &mut [u8], flags: libc::c_int) -> Result<usize, Error> {
        loop {
            let res = syscall!(recv(
                self.native_handle(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
            ));
            match res {
                Ok(0) if self.stream_oriented && !buf.is_empty() => return Err(Error::Eof),
                Ok(n) => return Ok(n as usize),
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Scatter-read some bytes without blocking.
    pub fn non_blocking_recvmsg(
        &self,
        bufs: &mut [IoSliceMut<'_>],
        flags: libc::c_int,
    ) -> Result<usize, Error> {
        let requested: usize = bufs.iter().map(|b| b.len()).sum();
        loop {
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            // `IoSliceMut` is ABI-compatible with `iovec`.
            msg.msg_iov = bufs.as_mut_ptr() as *mut libc::iovec;
            msg.msg_iovlen = bufs.len() as _;
            let res = syscall!(recvmsg(self.native_handle(), &mut msg, flags));
            match res {
                Ok(0) if self.stream_oriented && requested > 0 => return Err(Error::Eof),
                Ok(n) => return Ok(n as usize),
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Write some bytes without blocking.
    ///
    /// `MSG_NOSIGNAL` is always set; a closed peer surfaces as `EPIPE`
    /// rather than a process signal.
    pub fn non_blocking_send(&self, buf: &[u8], flags: libc::c_int) -> Result<usize, Error> {
        loop {
            let res = syscall!(send(
                self.native_handle(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags | libc::MSG_NOSIGNAL,
            ));
            match res {
                Ok(n) => return Ok(n as usize),
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Gather-write some bytes without blocking.
    pub fn non_blocking_sendmsg(
        &self,
        bufs: &[IoSlice<'_>],
        flags: libc::c_int,
    ) -> Result<usize, Error> {
        loop {
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            // `IoSlice` is ABI-compatible with `iovec`; sendmsg does not
            // write through the pointer.
            msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
            msg.msg_iovlen = bufs.len() as _;
            let res = syscall!(sendmsg(
                self.native_handle(),
                &msg,
                flags | libc::MSG_NOSIGNAL
            ));
            match res {
                Ok(n) => return Ok(n as usize),
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> Result<(), Error> {
        let (raw_addr, len) = net::socket_addr(addr);
        syscall!(bind(self.native_handle(), raw_addr.as_ptr(), len))?;
        Ok(())
    }

    pub(crate) fn listen(&self, backlog: libc::c_int) -> Result<(), Error> {
        syscall!(listen(self.native_handle(), backlog))?;
        Ok(())
    }

    pub(crate) fn connect(&self, addr: &SocketAddr) -> Result<(), Error> {
        let (raw_addr, len) = net::socket_addr(addr);
        loop {
            match syscall!(connect(self.native_handle(), raw_addr.as_ptr(), len)) {
                Ok(_) => return Ok(()),
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.native_handle(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        // SAFETY: the kernel filled `storage` with one of the inet families.
        unsafe { net::to_socket_addr(&storage).map_err(Error::from) }
    }

    pub(crate) fn set_reuseaddr(&self) -> Result<(), Error> {
        self.set_option_int(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
    }

    /// Set an integer-valued (or boolean, as 0/1) socket option.
    pub(crate) fn set_option_int(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> Result<(), Error> {
        syscall!(setsockopt(
            self.native_handle(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))?;
        Ok(())
    }

    /// Read an integer-valued socket option.
    pub(crate) fn option_int(
        &self,
        level: libc::c_int,
        name: libc::c_int,
    ) -> Result<libc::c_int, Error> {
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.native_handle(),
            level,
            name,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        ))?;
        Ok(value)
    }

    /// Take and clear the pending socket error, if any.
    pub fn take_error(&self) -> Result<Option<Error>, Error> {
        match self.option_int(libc::SOL_SOCKET, libc::SO_ERROR)? {
            0 => Ok(None),
            code => Ok(Some(Error::Os(code))),
        }
    }

    /// Bytes available to read without blocking.
    pub fn available(&self) -> Result<usize, Error> {
        let mut value: libc::c_int = 0;
        syscall!(ioctl(self.native_handle(), libc::FIONREAD, &mut value))?;
        Ok(value as usize)
    }

    /// Shut down the read, write, or both halves of the connection.
    pub fn shutdown(&self, how: std::net::Shutdown) -> Result<(), Error> {
        let how = match how {
            std::net::Shutdown::Read => libc::SHUT_RD,
            std::net::Shutdown::Write => libc::SHUT_WR,
            std::net::Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.native_handle(), how))?;
        Ok(())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
