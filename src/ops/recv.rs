use crate::buf::MutBufferSequence;
use crate::context::{Context, Scheduler};
use crate::error::Error;
use crate::exec::{Receiver, Sender};
use crate::net::Socket;
use crate::ops::base::{Driver, OpKind, SocketOp};

/// Build a sender that reads some bytes from `socket` into `buffers`.
///
/// "Some" means a short read is a normal outcome; composing reads into
/// "all" variants belongs to higher-level algorithms. On a stream socket a
/// clean peer shutdown completes with [`Error::Eof`]; on a datagram socket
/// an empty datagram completes with value `0`.
pub fn async_recv_some<'a, B>(
    scheduler: Scheduler<'a>,
    socket: &'a Socket,
    buffers: B,
) -> RecvSomeSender<'a, B>
where
    B: MutBufferSequence,
{
    RecvSomeSender {
        context: scheduler.context(),
        socket,
        buffers,
    }
}

/// Sender returned by [`async_recv_some`].
#[derive(Debug)]
pub struct RecvSomeSender<'a, B> {
    context: &'a Context,
    socket: &'a Socket,
    buffers: B,
}

impl<'a, B> Sender for RecvSomeSender<'a, B>
where
    B: MutBufferSequence,
{
    type Value = usize;

    type Operation<R> = SocketOp<'a, R, RecvDriver<B>>
    where
        R: Receiver<Value = usize>;

    fn connect<R>(self, receiver: R) -> SocketOp<'a, R, RecvDriver<B>>
    where
        R: Receiver<Value = usize>,
    {
        SocketOp::new(
            self.context,
            self.socket,
            OpKind::Read,
            RecvDriver {
                buffers: self.buffers,
            },
            receiver,
        )
    }
}

/// Recv syscall driver; see [`SocketOp`].
#[derive(Debug)]
pub struct RecvDriver<B> {
    buffers: B,
}

impl<B> Driver for RecvDriver<B>
where
    B: MutBufferSequence,
{
    type Value = usize;

    fn perform(&mut self, socket: &Socket) -> Result<usize, Error> {
        self.buffers.recv(socket)
    }
}
