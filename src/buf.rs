use std::io::{IoSlice, IoSliceMut};

use crate::error::Error;
use crate::net::Socket;

/// Writable destination of a recv-some operation.
///
/// Implementations pick the socket verb that matches their shape: a single
/// contiguous buffer goes through `recv`, a scatter sequence through
/// `recvmsg`. The `Send` bound exists because the buffers travel to the I/O
/// thread inside the operation.
pub trait MutBufferSequence: Send {
    /// Attempt one non-blocking read from `socket` into this sequence.
    fn recv(&mut self, socket: &Socket) -> Result<usize, Error>;
}

impl MutBufferSequence for &mut [u8] {
    fn recv(&mut self, socket: &Socket) -> Result<usize, Error> {
        socket.non_blocking_recv(self, 0)
    }
}

impl MutBufferSequence for &mut [IoSliceMut<'_>] {
    fn recv(&mut self, socket: &Socket) -> Result<usize, Error> {
        socket.non_blocking_recvmsg(self, 0)
    }
}

/// Readable source of a send-some operation.
pub trait ConstBufferSequence: Send {
    /// Attempt one non-blocking write of this sequence to `socket`.
    fn send(&self, socket: &Socket) -> Result<usize, Error>;
}

impl ConstBufferSequence for &[u8] {
    fn send(&self, socket: &Socket) -> Result<usize, Error> {
        socket.non_blocking_send(self, 0)
    }
}

impl ConstBufferSequence for &[IoSlice<'_>] {
    fn send(&self, socket: &Socket) -> Result<usize, Error> {
        socket.non_blocking_sendmsg(self, 0)
    }
}
