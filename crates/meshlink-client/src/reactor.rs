//! Single-threaded event loop: socket readiness plus a time-ordered timer
//! queue, driven from one dedicated OS thread.
//!
//! Mirrors `kimberlite-server`'s stated design principle of explicit
//! control flow without an async runtime: a `mio::Poll` instance owns every
//! registered socket, and each loop iteration also drains any timers whose
//! deadline has passed. Handlers run synchronously on the reactor thread;
//! nothing here ever blocks on a `Deferred`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, warn};

use crate::future::run_as_reactor_thread;

/// Handler invoked when a registered socket becomes readable/writable, or
/// when the reactor is shutting down and the handler must clean up.
pub trait IoHandler: Send {
    fn handle_readable(&mut self);
    fn handle_writable(&mut self);
    /// Interest this handler currently wants registered with the poller.
    fn interest(&self) -> Interest;
    fn handle_shutdown(&mut self);
}

type TimerCallback = Box<dyn FnOnce() + Send>;

struct Timer {
    deadline: Instant,
    seq: u64,
    callback: Mutex<Option<TimerCallback>>,
    canceled: Arc<AtomicBool>,
}

/// A handle that can cancel a previously scheduled timer. Cancellation is
/// best-effort: a timer already popped and firing cannot be canceled.
#[derive(Clone)]
pub struct TimerHandle {
    canceled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}

struct TimerOrd(Instant, u64);

impl PartialEq for TimerOrd {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0 && self.1 == other.1
    }
}
impl Eq for TimerOrd {}
impl PartialOrd for TimerOrd {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerOrd {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0, self.1).cmp(&(other.0, other.1))
    }
}

/// A poll interval short enough that timers fire close to their deadline
/// without burning CPU busy-waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared handle to a running reactor. Cheap to clone; all clones refer to
/// the same background thread.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

struct Shared {
    live: AtomicBool,
    poll: Mutex<Poll>,
    timers: Mutex<BinaryHeap<Reverse<TimerOrd>>>,
    timer_bodies: Mutex<std::collections::HashMap<(Instant, u64), Timer>>,
    timer_seq: AtomicU64,
    next_token: AtomicU64,
    handlers: Mutex<std::collections::HashMap<Token, Box<dyn IoHandler>>>,
}

/// Owns the reactor thread. Dropping this joins the thread after requesting
/// shutdown, matching the join-on-shutdown idiom used elsewhere in this
/// codebase for owned background workers.
pub struct Reactor {
    handle: ReactorHandle,
    join: Option<JoinHandle<()>>,
}

impl Reactor {
    pub fn start() -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let shared = Arc::new(Shared {
            live: AtomicBool::new(true),
            poll: Mutex::new(poll),
            timers: Mutex::new(BinaryHeap::new()),
            timer_bodies: Mutex::new(std::collections::HashMap::new()),
            timer_seq: AtomicU64::new(0),
            next_token: AtomicU64::new(0),
            handlers: Mutex::new(std::collections::HashMap::new()),
        });
        let handle = ReactorHandle {
            shared: shared.clone(),
        };
        let thread_shared = shared.clone();
        let join = thread::Builder::new()
            .name("meshlink-reactor".into())
            .spawn(move || run_as_reactor_thread(|| reactor_loop(thread_shared)))?;
        Ok(Self {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Stops the reactor and joins its thread. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.handle.shared.live.store(false, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            // The reactor thread itself should never call shutdown() -- it
            // has no way to join itself. Application code only ever holds
            // a `Reactor` from outside the reactor thread.
            let _ = join.join();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ReactorHandle {
    /// Registers a new handler, returning the token used to unregister it.
    pub fn register(
        &self,
        source: &mut impl mio::event::Source,
        handler: Box<dyn IoHandler>,
    ) -> std::io::Result<Token> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed) as usize);
        let interest = handler.interest();
        self.shared
            .poll
            .lock()
            .unwrap()
            .registry()
            .register(source, token, interest)?;
        self.shared.handlers.lock().unwrap().insert(token, handler);
        Ok(token)
    }

    pub fn reregister(
        &self,
        source: &mut impl mio::event::Source,
        token: Token,
        interest: Interest,
    ) -> std::io::Result<()> {
        self.shared
            .poll
            .lock()
            .unwrap()
            .registry()
            .reregister(source, token, interest)
    }

    pub fn deregister(&self, source: &mut impl mio::event::Source, token: Token) {
        let _ = self.shared.poll.lock().unwrap().registry().deregister(source);
        self.shared.handlers.lock().unwrap().remove(&token);
    }

    /// Schedules `callback` to run on the reactor thread at `deadline`.
    pub fn add_timer_absolute(
        &self,
        deadline: Instant,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let seq = self.shared.timer_seq.fetch_add(1, Ordering::Relaxed);
        let canceled = Arc::new(AtomicBool::new(false));
        let timer = Timer {
            deadline,
            seq,
            callback: Mutex::new(Some(Box::new(callback))),
            canceled: canceled.clone(),
        };
        self.shared
            .timer_bodies
            .lock()
            .unwrap()
            .insert((deadline, seq), timer);
        self.shared
            .timers
            .lock()
            .unwrap()
            .push(Reverse(TimerOrd(deadline, seq)));
        TimerHandle { canceled }
    }

    pub fn add_timer(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        self.add_timer_absolute(Instant::now() + delay, callback)
    }

    fn check_timers(&self) {
        let now = Instant::now();
        loop {
            let next_key = {
                let mut timers = self.shared.timers.lock().unwrap();
                match timers.peek() {
                    Some(Reverse(TimerOrd(deadline, _))) if *deadline <= now => {
                        let Reverse(TimerOrd(deadline, seq)) = timers.pop().unwrap();
                        Some((deadline, seq))
                    }
                    _ => None,
                }
            };
            let Some(key) = next_key else { break };
            let timer = self.shared.timer_bodies.lock().unwrap().remove(&key);
            if let Some(timer) = timer {
                if timer.canceled.load(Ordering::SeqCst) {
                    continue;
                }
                if let Some(cb) = timer.callback.lock().unwrap().take() {
                    cb();
                }
            }
        }
    }

    fn shutdown_all_handlers(&self) {
        let mut handlers = self.shared.handlers.lock().unwrap();
        for (_, handler) in handlers.drain() {
            let mut handler = handler;
            handler.handle_shutdown();
        }
    }
}

fn reactor_loop(shared: Arc<Shared>) {
    let handle = ReactorHandle {
        shared: shared.clone(),
    };
    let mut events = Events::with_capacity(256);
    debug!("reactor loop starting");
    while shared.live.load(Ordering::SeqCst) {
        let poll_result = {
            let mut poll = shared.poll.lock().unwrap();
            poll.poll(&mut events, Some(POLL_INTERVAL))
        };
        if let Err(e) = poll_result {
            if e.kind() != std::io::ErrorKind::Interrupted {
                error!(error = %e, "reactor poll failed");
            }
        }
        for event in events.iter() {
            let token = event.token();
            let mut handlers = shared.handlers.lock().unwrap();
            if let Some(handler) = handlers.get_mut(&token) {
                if event.is_readable() {
                    handler.handle_readable();
                }
                if event.is_writable() {
                    handler.handle_writable();
                }
            } else {
                warn!(?token, "event for unknown token");
            }
        }
        handle.check_timers();
    }
    handle.shutdown_all_handlers();
    debug!("reactor loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_a_timer_close_to_its_deadline() {
        let mut reactor = Reactor::start().unwrap();
        let handle = reactor.handle();
        let (tx, rx) = mpsc::channel();
        handle.add_timer(Duration::from_millis(20), move || {
            tx.send(Instant::now()).unwrap();
        });
        let fired_at = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(fired_at.elapsed() < Duration::from_millis(500));
        reactor.shutdown();
    }

    #[test]
    fn canceled_timer_never_fires() {
        let mut reactor = Reactor::start().unwrap();
        let handle = reactor.handle();
        let (tx, rx) = mpsc::channel::<()>();
        let timer = handle.add_timer(Duration::from_millis(20), move || {
            tx.send(()).unwrap();
        });
        timer.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        reactor.shutdown();
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut reactor = Reactor::start().unwrap();
        let handle = reactor.handle();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        handle.add_timer(Duration::from_millis(40), move || tx2.send(2).unwrap());
        handle.add_timer(Duration::from_millis(10), move || tx.send(1).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
        reactor.shutdown();
    }
}
