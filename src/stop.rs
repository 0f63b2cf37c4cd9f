use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

type BoxedCallback = Box<dyn FnOnce() + Send>;

struct Inner {
    callbacks: Vec<(u64, BoxedCallback)>,
    next_id: u64,
    /// Callback currently being invoked by `request_stop`, with the invoking
    /// thread.
    running: Option<(u64, ThreadId)>,
    /// True once `request_stop` finished invoking every callback; late
    /// registrations then run inline.
    drained: bool,
}

struct State {
    requested: AtomicBool,
    inner: Mutex<Inner>,
    cond: Condvar,
}

/// Owner side of a stop request.
///
/// A source hands out [`StopToken`]s. Requesting stop flips a flag and
/// invokes every callback registered through the tokens, each exactly once.
pub struct StopSource {
    state: Arc<State>,
}

/// Observer side of a stop request; cheap to clone.
///
/// A token obtained from [`StopToken::none`] can never be stopped, which
/// lets operations elide their cancellation paths.
#[derive(Clone, Default)]
pub struct StopToken {
    state: Option<Arc<State>>,
}

/// A registered stop callback.
///
/// Dropping the handle deregisters the callback. If the callback is being
/// invoked on another thread at that moment, the drop blocks until the
/// invocation returns, so after the drop the callback is guaranteed not to
/// be running. Dropping from inside the callback itself returns immediately.
pub struct StopCallback {
    state: Arc<State>,
    id: u64,
}

impl StopSource {
    pub fn new() -> StopSource {
        StopSource {
            state: Arc::new(State {
                requested: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    callbacks: Vec::new(),
                    next_id: 0,
                    running: None,
                    drained: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// A token observing this source.
    pub fn token(&self) -> StopToken {
        StopToken {
            state: Some(self.state.clone()),
        }
    }

    /// Request stop. Returns false if stop had already been requested.
    ///
    /// Invokes all registered callbacks on the calling thread before
    /// returning. Idempotent and safe from any thread.
    pub fn request_stop(&self) -> bool {
        if self.state.requested.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mut inner = self.state.inner.lock().unwrap_or_else(|e| e.into_inner());
        while let Some((id, callback)) = inner.callbacks.pop() {
            inner.running = Some((id, thread::current().id()));
            drop(inner);
            callback();
            inner = self.state.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.running = None;
            self.state.cond.notify_all();
        }
        inner.drained = true;
        true
    }

    /// Whether stop has been requested on this source.
    pub fn stop_requested(&self) -> bool {
        self.state.requested.load(Ordering::Acquire)
    }
}

impl Default for StopSource {
    fn default() -> StopSource {
        StopSource::new()
    }
}

impl StopToken {
    /// A token that can never be stopped.
    pub fn none() -> StopToken {
        StopToken { state: None }
    }

    /// Whether a stop request can ever be observed through this token.
    pub fn stop_possible(&self) -> bool {
        self.state.is_some()
    }

    /// Whether stop has been requested.
    pub fn stop_requested(&self) -> bool {
        match self.state.as_ref() {
            Some(state) => state.requested.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Register `callback` to be invoked when stop is requested.
    ///
    /// Returns `None` without registering when the token cannot be stopped.
    /// If stop was already requested, the callback is invoked inline and
    /// `None` is returned. Otherwise the callback stays registered until the
    /// returned handle is dropped or a stop request consumes it.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> Option<StopCallback> {
        let state = self.state.as_ref()?;

        let mut inner = state.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.requested.load(Ordering::Acquire) && inner.drained {
            drop(inner);
            callback();
            return None;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.callbacks.push((id, Box::new(callback)));
        Some(StopCallback {
            state: state.clone(),
            id,
        })
    }
}

impl Drop for StopCallback {
    fn drop(&mut self) {
        let mut inner = self.state.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = inner.callbacks.iter().position(|(id, _)| *id == self.id) {
            // Not yet invoked and now never will be. Drop the callback
            // outside the lock in case it owns interesting state.
            let entry = inner.callbacks.swap_remove(pos);
            drop(inner);
            drop(entry);
            return;
        }

        // Either already invoked, or being invoked right now. Wait out a
        // concurrent invocation; a self-deregistration from inside the
        // callback must not wait for itself.
        let current = thread::current().id();
        while matches!(inner.running, Some((id, tid)) if id == self.id && tid != current) {
            inner = self
                .state
                .cond
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl std::fmt::Debug for StopSource {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("StopSource")
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

impl std::fmt::Debug for StopToken {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("StopToken")
            .field("stop_possible", &self.stop_possible())
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

impl std::fmt::Debug for StopCallback {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("StopCallback").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{StopSource, StopToken};

    #[test]
    fn unstoppable_token() {
        let token = StopToken::none();
        assert!(!token.stop_possible());
        assert!(!token.stop_requested());
        assert!(token.register(|| panic!("must not run")).is_none());
    }

    #[test]
    fn request_stop_is_idempotent() {
        let source = StopSource::new();
        assert!(!source.stop_requested());
        assert!(source.request_stop());
        assert!(!source.request_stop());
        assert!(source.stop_requested());
        assert!(source.token().stop_requested());
    }

    #[test]
    fn callbacks_run_once_on_request() {
        let source = StopSource::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits1 = hits.clone();
        let cb = source
            .token()
            .register(move || {
                hits1.fetch_add(1, Ordering::SeqCst);
            })
            .expect("registration must succeed");

        source.request_stop();
        source.request_stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(cb);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_registration_runs_inline() {
        let source = StopSource::new();
        source.request_stop();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits1 = hits.clone();
        let handle = source.token().register(move || {
            hits1.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregistration_prevents_invocation() {
        let source = StopSource::new();
        let cb = source
            .token()
            .register(|| panic!("must not run"))
            .expect("registration must succeed");
        drop(cb);
        source.request_stop();
    }

    #[test]
    fn deregistration_waits_for_running_callback() {
        let source = Arc::new(StopSource::new());
        let entered = Arc::new(std::sync::Barrier::new(2));
        let finished = Arc::new(AtomicUsize::new(0));

        let entered1 = entered.clone();
        let finished1 = finished.clone();
        let cb = source
            .token()
            .register(move || {
                entered1.wait();
                thread::sleep(Duration::from_millis(50));
                finished1.fetch_add(1, Ordering::SeqCst);
            })
            .expect("registration must succeed");

        let source1 = source.clone();
        let stopper = thread::spawn(move || {
            source1.request_stop();
        });

        // Once the callback is running, dropping the handle must block until
        // it returns.
        entered.wait();
        drop(cb);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        stopper.join().unwrap();
    }
}
