//! Asynchronous socket operations.
//!
//! [`base`] holds the state machine every socket operation shares; the
//! sibling modules supply the per-verb drivers and the sender factories.

mod accept;
mod base;
mod recv;
mod send;

pub use self::accept::{async_accept, AcceptDriver, AcceptSender};
pub use self::base::{Driver, SocketOp};
pub use self::recv::{async_recv_some, RecvDriver, RecvSomeSender};
pub use self::send::{async_send_some, SendDriver, SendSomeSender};

pub(crate) use self::base::OpKind;
