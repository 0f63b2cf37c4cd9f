use crate::context::{Context, Scheduler};
use crate::error::Error;
use crate::exec::{Receiver, Sender};
use crate::net::{Socket, TcpListener, TcpStream};
use crate::ops::base::{Driver, OpKind, SocketOp};

/// Build a sender that accepts one connection from `listener`.
///
/// The operation completes with the connected [`TcpStream`], already in
/// non-blocking mode; an acceptor never produces the end-of-file sentinel.
pub fn async_accept<'a>(
    scheduler: Scheduler<'a>,
    listener: &'a TcpListener,
) -> AcceptSender<'a> {
    AcceptSender {
        context: scheduler.context(),
        listener,
    }
}

/// Sender returned by [`async_accept`].
#[derive(Debug, Clone, Copy)]
pub struct AcceptSender<'a> {
    context: &'a Context,
    listener: &'a TcpListener,
}

impl<'a> Sender for AcceptSender<'a> {
    type Value = TcpStream;

    type Operation<R> = SocketOp<'a, R, AcceptDriver>
    where
        R: Receiver<Value = TcpStream>;

    fn connect<R>(self, receiver: R) -> SocketOp<'a, R, AcceptDriver>
    where
        R: Receiver<Value = TcpStream>,
    {
        SocketOp::new(
            self.context,
            self.listener.socket(),
            OpKind::Read,
            AcceptDriver,
            receiver,
        )
    }
}

/// Accept syscall driver; see [`SocketOp`].
#[derive(Debug)]
pub struct AcceptDriver;

impl Driver for AcceptDriver {
    type Value = TcpStream;

    fn perform(&mut self, socket: &Socket) -> Result<TcpStream, Error> {
        socket.non_blocking_accept().map(TcpStream::from_socket)
    }
}
