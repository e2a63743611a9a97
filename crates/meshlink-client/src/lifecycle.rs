//! Client lifecycle state machine and listener dispatch.
//!
//! Ground truth: `hazelcast/lifecycle.py`'s `_InternalLifecycleService`.
//! `start()` is a no-op if already running; `shutdown()` is idempotent;
//! listener dispatch is synchronous on the calling thread and swallows
//! listener panics the way the source swallows listener exceptions.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Starting,
    Started,
    ShuttingDown,
    Shutdown,
    Connected,
    Disconnected,
}

pub type LifecycleListener = Box<dyn Fn(LifecycleState) + Send + Sync>;

pub struct LifecycleService {
    running: AtomicBool,
    listeners: Mutex<Vec<(Uuid, LifecycleListener)>>,
}

impl LifecycleService {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: LifecycleListener) -> Uuid {
        let id = Uuid::new_v4();
        self.listeners.lock().unwrap().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: Uuid) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// No-op if already running.
    pub fn start(&self) {
        if self.running.load(Ordering::SeqCst) {
            return;
        }
        self.fire(LifecycleState::Starting);
        self.running.store(true, Ordering::SeqCst);
        self.fire(LifecycleState::Started);
    }

    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.fire(LifecycleState::ShuttingDown);
        self.fire(LifecycleState::Shutdown);
    }

    pub fn fire(&self, state: LifecycleState) {
        info!(?state, "lifecycle state transition");
        let listeners = self.listeners.lock().unwrap();
        for (_, listener) in listeners.iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener(state)));
            if result.is_err() {
                error!(?state, "lifecycle listener panicked");
            }
        }
    }
}

impl Default for LifecycleService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn start_is_a_no_op_when_already_running() {
        let service = LifecycleService::new();
        let events = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        service.add_listener(Box::new(move |state| events_clone.lock().unwrap().push(state)));

        service.start();
        service.start();

        assert_eq!(
            *events.lock().unwrap(),
            vec![LifecycleState::Starting, LifecycleState::Started]
        );
    }

    #[test]
    fn shutdown_is_idempotent() {
        let service = LifecycleService::new();
        service.start();
        let events = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        service.add_listener(Box::new(move |state| events_clone.lock().unwrap().push(state)));

        service.shutdown();
        service.shutdown();

        assert_eq!(
            *events.lock().unwrap(),
            vec![LifecycleState::ShuttingDown, LifecycleState::Shutdown]
        );
    }

    #[test]
    fn listener_panic_does_not_stop_other_listeners() {
        let service = LifecycleService::new();
        let called = Arc::new(StdMutex::new(false));
        let called_clone = called.clone();
        service.add_listener(Box::new(|_| panic!("boom")));
        service.add_listener(Box::new(move |_| *called_clone.lock().unwrap() = true));

        service.start();

        assert!(*called.lock().unwrap());
    }

    #[test]
    fn remove_listener_stops_future_dispatch() {
        let service = LifecycleService::new();
        let count = Arc::new(StdMutex::new(0));
        let count_clone = count.clone();
        let id = service.add_listener(Box::new(move |_| *count_clone.lock().unwrap() += 1));
        service.remove_listener(id);
        service.start();
        assert_eq!(*count.lock().unwrap(), 0);
    }
}
