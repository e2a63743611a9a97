//! Deferred single-shot results.
//!
//! This is deliberately not `std::future::Future`: the reactor drives I/O
//! explicitly on one dedicated thread (see [`crate::reactor`]), and nothing
//! here ever gets polled by an executor. A [`Deferred`] is produced by the
//! invocation service, completed exactly once by the reactor thread when a
//! response frame (or a timeout, or a connection failure) arrives, and
//! consumed by application code via [`Deferred::wait`] or
//! [`Deferred::on_complete`].

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::ClientError;

thread_local! {
    static ON_REACTOR_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Marks the calling thread as the reactor thread for the remainder of
/// `body`. [`Deferred::wait`] panics if called while this guard is active.
pub fn run_as_reactor_thread<R>(body: impl FnOnce() -> R) -> R {
    ON_REACTOR_THREAD.with(|f| f.set(true));
    let result = body();
    ON_REACTOR_THREAD.with(|f| f.set(false));
    result
}

pub fn is_reactor_thread() -> bool {
    ON_REACTOR_THREAD.with(|f| f.get())
}

enum State<T> {
    Pending(Vec<Box<dyn FnOnce(Result<T, ClientError>) + Send>>),
    Resolved(T),
    Rejected(ClientError),
    /// The value has already been taken out by `wait()` or a callback.
    Taken,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    condvar: Condvar,
}

/// A single-shot result, shared between the completer (reactor thread) and
/// any number of waiters/continuations.
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Completes this deferred with a success value. A no-op if it has
    /// already been completed once.
    pub fn set_result(&self, value: T) {
        self.complete(Ok(value));
    }

    /// Completes this deferred with a failure. A no-op if it has already
    /// been completed once.
    pub fn set_exception(&self, error: ClientError) {
        self.complete(Err(error));
    }

    fn complete(&self, result: Result<T, ClientError>) {
        let callbacks = {
            let mut state = self.inner.state.lock().unwrap();
            if !matches!(&*state, State::Pending(_)) {
                return;
            }
            let previous = std::mem::replace(&mut *state, State::Taken);
            let State::Pending(callbacks) = previous else {
                unreachable!("checked above")
            };
            *state = match &result {
                Ok(v) => State::Resolved(v.clone()),
                Err(e) => State::Rejected(clone_error(e)),
            };
            callbacks
        };
        self.inner.condvar.notify_all();
        for cb in callbacks {
            cb(result.clone_result());
        }
    }

    /// Registers a callback that runs once this deferred completes. If it
    /// has already completed, the callback runs immediately on the calling
    /// thread.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(Result<T, ClientError>) + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            State::Pending(callbacks) => callbacks.push(Box::new(callback)),
            State::Resolved(v) => {
                let v = v.clone();
                drop(state);
                callback(Ok(v));
            }
            State::Rejected(e) => {
                let e = clone_error(e);
                drop(state);
                callback(Err(e));
            }
            State::Taken => {}
        }
    }

    /// Blocks the calling thread until this deferred completes.
    ///
    /// # Panics
    /// Panics if called from the reactor thread: the reactor is the only
    /// thread that can ever complete a pending I/O-bound deferred, so
    /// blocking on one there deadlocks the client.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, ClientError> {
        assert!(
            !is_reactor_thread(),
            "Deferred::wait() called from the reactor thread"
        );
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match &*state {
                State::Pending(_) => {}
                State::Resolved(v) => return Ok(v.clone()),
                State::Rejected(e) => return Err(clone_error(e)),
                State::Taken => {
                    return Err(ClientError::IllegalState(
                        "deferred already consumed".into(),
                    ));
                }
            }
            state = match deadline {
                None => self.inner.condvar.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ClientError::OperationTimeout(
                            timeout.unwrap_or_default(),
                        ));
                    }
                    let (guard, _) = self
                        .inner
                        .condvar
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    guard
                }
            };
        }
    }

    /// Returns a new deferred that resolves to `f(result)` once `self`
    /// completes. Panics inside `f` are not caught; callers should not
    /// panic in continuation closures (matches reactor-thread conventions
    /// elsewhere in this crate).
    pub fn continue_with<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, ClientError>) -> Result<U, ClientError> + Send + 'static,
    {
        let child = Deferred::<U>::new();
        let child_clone = child.clone();
        self.on_complete(move |result| match f(result) {
            Ok(v) => child_clone.set_result(v),
            Err(e) => child_clone.set_exception(e),
        });
        child
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes when every input deferred completes; resolves to the list of
/// results in input order, or rejects with the first error encountered.
pub fn combine<T: Clone + Send + 'static>(deferreds: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
    let combined = Deferred::<Vec<T>>::new();
    if deferreds.is_empty() {
        combined.set_result(Vec::new());
        return combined;
    }
    let total = deferreds.len();
    let results: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; total]));
    let remaining = Arc::new(Mutex::new(total));
    let failed = Arc::new(Mutex::new(false));

    for (idx, d) in deferreds.into_iter().enumerate() {
        let results = results.clone();
        let remaining = remaining.clone();
        let failed = failed.clone();
        let combined = combined.clone();
        d.on_complete(move |result| {
            match result {
                Ok(v) => {
                    results.lock().unwrap()[idx] = Some(v);
                }
                Err(e) => {
                    let mut failed_guard = failed.lock().unwrap();
                    if !*failed_guard {
                        *failed_guard = true;
                        combined.set_exception(e);
                    }
                    return;
                }
            }
            let mut remaining_guard = remaining.lock().unwrap();
            *remaining_guard -= 1;
            if *remaining_guard == 0 && !*failed.lock().unwrap() {
                let collected = results
                    .lock()
                    .unwrap()
                    .drain(..)
                    .map(|o| o.expect("all results present once remaining reaches zero"))
                    .collect();
                combined.set_result(collected);
            }
        });
    }
    combined
}

/// `ClientError` is not `Clone` (it wraps non-Clone sources like `io::Error`
/// and `thiserror`-derived errors), but the same completed deferred may be
/// observed by multiple waiters. We re-render the error into a fresh
/// `ClientError` carrying its display text, which is lossy but sufficient:
/// only the message matters once a deferred has already completed.
fn clone_error(e: &ClientError) -> ClientError {
    ClientError::IllegalState(e.to_string())
}

trait CloneResult<T> {
    fn clone_result(&self) -> Result<T, ClientError>;
}

impl<T: Clone> CloneResult<T> for Result<T, ClientError> {
    fn clone_result(&self) -> Result<T, ClientError> {
        match self {
            Ok(v) => Ok(v.clone()),
            Err(e) => Err(clone_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_and_can_be_waited_on() {
        let d = Deferred::<i32>::new();
        d.set_result(42);
        assert_eq!(d.wait(None).unwrap(), 42);
    }

    #[test]
    fn completes_exactly_once() {
        let d = Deferred::<i32>::new();
        d.set_result(1);
        d.set_result(2);
        assert_eq!(d.wait(None).unwrap(), 1);
    }

    #[test]
    fn on_complete_fires_immediately_if_already_done() {
        let d = Deferred::<i32>::new();
        d.set_result(7);
        let (tx, rx) = std::sync::mpsc::channel();
        d.on_complete(move |r| tx.send(r.unwrap()).unwrap());
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[test]
    fn on_complete_fires_after_later_completion() {
        let d = Deferred::<i32>::new();
        let (tx, rx) = std::sync::mpsc::channel();
        d.on_complete(move |r| tx.send(r.unwrap()).unwrap());
        d.set_result(9);
        assert_eq!(rx.recv().unwrap(), 9);
    }

    #[test]
    fn continue_with_chains_a_transformation() {
        let d = Deferred::<i32>::new();
        let child = d.continue_with(|r| r.map(|v| v * 2));
        d.set_result(21);
        assert_eq!(child.wait(None).unwrap(), 42);
    }

    #[test]
    fn combine_waits_for_all_and_preserves_order() {
        let a = Deferred::<i32>::new();
        let b = Deferred::<i32>::new();
        let c = Deferred::<i32>::new();
        let combined = combine(vec![a.clone(), b.clone(), c.clone()]);
        b.set_result(2);
        c.set_result(3);
        a.set_result(1);
        assert_eq!(combined.wait(None).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn combine_rejects_on_first_error() {
        let a = Deferred::<i32>::new();
        let b = Deferred::<i32>::new();
        let combined = combine(vec![a.clone(), b.clone()]);
        a.set_exception(ClientError::Shutdown);
        b.set_result(2);
        assert!(combined.wait(None).is_err());
    }

    #[test]
    #[should_panic(expected = "reactor thread")]
    fn wait_panics_on_reactor_thread() {
        let d = Deferred::<i32>::new();
        run_as_reactor_thread(|| {
            d.set_result(1);
            let _ = d.wait(None);
        });
    }

    #[test]
    fn wait_with_timeout_times_out() {
        let d = Deferred::<i32>::new();
        let result = d.wait(Some(Duration::from_millis(10)));
        assert!(matches!(result, Err(ClientError::OperationTimeout(_))));
    }
}
