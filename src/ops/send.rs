use crate::buf::ConstBufferSequence;
use crate::context::{Context, Scheduler};
use crate::error::Error;
use crate::exec::{Receiver, Sender};
use crate::net::Socket;
use crate::ops::base::{Driver, OpKind, SocketOp};

/// Build a sender that writes some bytes from `buffers` to `socket`.
///
/// The mirror of [`async_recv_some`](crate::async_recv_some): short writes
/// are normal outcomes, and sends carry `MSG_NOSIGNAL` so a closed peer
/// surfaces as an error rather than a signal.
pub fn async_send_some<'a, B>(
    scheduler: Scheduler<'a>,
    socket: &'a Socket,
    buffers: B,
) -> SendSomeSender<'a, B>
where
    B: ConstBufferSequence,
{
    SendSomeSender {
        context: scheduler.context(),
        socket,
        buffers,
    }
}

/// Sender returned by [`async_send_some`].
#[derive(Debug)]
pub struct SendSomeSender<'a, B> {
    context: &'a Context,
    socket: &'a Socket,
    buffers: B,
}

impl<'a, B> Sender for SendSomeSender<'a, B>
where
    B: ConstBufferSequence,
{
    type Value = usize;

    type Operation<R> = SocketOp<'a, R, SendDriver<B>>
    where
        R: Receiver<Value = usize>;

    fn connect<R>(self, receiver: R) -> SocketOp<'a, R, SendDriver<B>>
    where
        R: Receiver<Value = usize>,
    {
        SocketOp::new(
            self.context,
            self.socket,
            OpKind::Write,
            SendDriver {
                buffers: self.buffers,
            },
            receiver,
        )
    }
}

/// Send syscall driver; see [`SocketOp`].
#[derive(Debug)]
pub struct SendDriver<B> {
    buffers: B,
}

impl<B> Driver for SendDriver<B>
where
    B: ConstBufferSequence,
{
    type Value = usize;

    fn perform(&mut self, socket: &Socket) -> Result<usize, Error> {
        self.buffers.send(socket)
    }
}
