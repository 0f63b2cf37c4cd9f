// Not all helpers are used by all test binaries.
#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex, Once};
use std::time::{Duration, Instant};

use exio::{Error, Receiver, StopToken};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    })
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

/// The terminal signal a test operation delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<V> {
    Value(V),
    Error(Error),
    Stopped,
}

struct Inner<V> {
    /// Stays true forever once a completion arrived, so a second completion
    /// is caught even after the outcome was taken out.
    completed: bool,
    outcome: Option<Outcome<V>>,
}

struct SignalState<V> {
    inner: Mutex<Inner<V>>,
    cond: Condvar,
}

/// One-shot completion mailbox shared between a receiver and the test body.
///
/// Panics on a second completion, which is how the exactly-once property is
/// enforced in every test that uses it.
pub struct Signal<V> {
    state: Arc<SignalState<V>>,
}

impl<V> Clone for Signal<V> {
    fn clone(&self) -> Signal<V> {
        Signal {
            state: self.state.clone(),
        }
    }
}

impl<V> Signal<V> {
    pub fn new() -> Signal<V> {
        Signal {
            state: Arc::new(SignalState {
                inner: Mutex::new(Inner {
                    completed: false,
                    outcome: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn set(&self, outcome: Outcome<V>) {
        let mut inner = self.state.inner.lock().expect("signal poisoned");
        assert!(!inner.completed, "operation completed twice");
        inner.completed = true;
        inner.outcome = Some(outcome);
        self.state.cond.notify_all();
    }

    /// Wait for the completion and take it, panicking after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Outcome<V> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.state.inner.lock().expect("signal poisoned");
        loop {
            if let Some(outcome) = inner.outcome.take() {
                return outcome;
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for completion");
            let (guard, _) = self
                .state
                .cond
                .wait_timeout(inner, remaining)
                .expect("signal poisoned");
            inner = guard;
        }
    }

    pub fn wait(&self) -> Outcome<V> {
        self.wait_timeout(Duration::from_secs(10))
    }

    /// Take the completion if one has been delivered.
    pub fn try_take(&self) -> Option<Outcome<V>> {
        self.state.inner.lock().expect("signal poisoned").outcome.take()
    }

    /// Whether any completion has been delivered yet.
    pub fn is_completed(&self) -> bool {
        self.state.inner.lock().expect("signal poisoned").completed
    }
}

/// Receiver recording its single completion into a [`Signal`].
pub struct TestReceiver<V> {
    signal: Signal<V>,
    stop_token: StopToken,
}

impl<V> TestReceiver<V> {
    pub fn new(signal: &Signal<V>) -> TestReceiver<V> {
        TestReceiver {
            signal: signal.clone(),
            stop_token: StopToken::none(),
        }
    }

    pub fn with_token(signal: &Signal<V>, stop_token: StopToken) -> TestReceiver<V> {
        TestReceiver {
            signal: signal.clone(),
            stop_token,
        }
    }
}

impl<V: Send> Receiver for TestReceiver<V> {
    type Value = V;

    fn set_value(self, value: V) {
        self.signal.set(Outcome::Value(value));
    }

    fn set_error(self, error: Error) {
        self.signal.set(Outcome::Error(error));
    }

    fn set_stopped(self) {
        self.signal.set(Outcome::Stopped);
    }

    fn stop_token(&self) -> StopToken {
        self.stop_token.clone()
    }
}
