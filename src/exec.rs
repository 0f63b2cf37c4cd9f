use std::pin::Pin;

use crate::error::Error;
use crate::stop::StopToken;

/// The continuation of an asynchronous operation.
///
/// Exactly one of the three terminal methods is invoked, exactly once, for
/// every started operation. `set_value` delivers the operation's result,
/// `set_error` a failure, and `set_stopped` the outcome of a cancellation.
///
/// Receivers cross threads (an operation may be started remotely and
/// completed on the I/O thread), hence the `Send` bound.
pub trait Receiver: Send {
    /// The type produced by a successful completion.
    type Value;

    /// The operation completed with a value.
    fn set_value(self, value: Self::Value);

    /// The operation failed.
    fn set_error(self, error: Error);

    /// The operation was cancelled before it could complete.
    fn set_stopped(self);

    /// The stop token this receiver observes.
    ///
    /// The default token can never be stopped, which lets operations skip
    /// callback registration and the cancellation paths altogether.
    fn stop_token(&self) -> StopToken {
        StopToken::none()
    }
}

/// A started (or startable) operation, pinned for its intrusive links.
///
/// After `start` returns the operation is owned by the runtime's queues
/// until its receiver gets a terminal signal; it must stay pinned and alive
/// until then. Keep the operation in scope until the receiver has observed
/// the completion.
pub trait OperationState {
    /// Submit the operation. May be called at most once.
    fn start(self: Pin<&mut Self>);
}

/// A lazily started asynchronous computation.
///
/// Connecting a sender to a [`Receiver`] yields an [`OperationState`]
/// holding all the state the operation needs; nothing happens until the
/// operation is started.
pub trait Sender {
    /// The type this sender's operations deliver through `set_value`.
    type Value;

    /// The operation produced by [`connect`](Sender::connect).
    type Operation<R>: OperationState
    where
        R: Receiver<Value = Self::Value>;

    /// Bind this sender to its continuation.
    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = Self::Value>;
}
