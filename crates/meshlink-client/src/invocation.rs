//! Request/response correlation, retry, and timeout handling.
//!
//! Ground truth: the retryable/non-retryable split in §4.4 and the capped
//! exponential backoff noted as an Open Question resolution in
//! `SPEC_FULL.md` §9.1, shaped after `kimberlite-server::core_runtime`'s
//! reconnect backoff idiom (`initial * 2^attempt`, capped, jittered). Per
//! §4.4, a retryable failure is reattempted -- re-routed and re-sent -- with
//! that backoff until the invocation's own deadline, not failed on first
//! error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meshlink_types::MemberId;
use meshlink_wire::Frame;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::future::Deferred;
use crate::reactor::{ReactorHandle, TimerHandle};

/// How an invocation selects its target connection.
#[derive(Debug, Clone)]
pub enum RoutingMode {
    /// Any live connection, chosen by the load balancer.
    Random,
    /// The connection to the partition owner, falling back to `Random` if
    /// no connection to that member currently exists.
    Partition(u32),
    /// The connection to a specific member.
    Member(MemberId),
    /// A specific connection, bypassing member/partition resolution
    /// entirely (used for the authentication handshake itself).
    Connection(u64),
}

/// Resolves `routing` to a live connection and sends `request` on it,
/// returning the connection id the frame was actually sent on. Supplied by
/// the client root once the connection manager exists (see
/// `InvocationService::set_resend`), since the invocation service itself
/// owns no connections.
pub type ResendFn = dyn Fn(&RoutingMode, &Frame) -> ClientResult<u64> + Send + Sync;

struct Invocation {
    request: Frame,
    routing: RoutingMode,
    deferred: Deferred<Frame>,
    deadline: Instant,
    attempt: u32,
    bound_connection: Option<u64>,
    deadline_timer: Option<TimerHandle>,
    retry_timer: Option<TimerHandle>,
}

/// Correlates outgoing requests with inbound responses and drives retry /
/// timeout policy. Does not itself own connections; `resend` (set once via
/// `set_resend`) is how a retry actually gets a frame back out.
pub struct InvocationService {
    next_correlation_id: AtomicI64,
    in_flight: Mutex<HashMap<i64, Invocation>>,
    retry_pause: Duration,
    max_backoff: Duration,
    reactor: ReactorHandle,
    resend: Mutex<Option<Arc<ResendFn>>>,
}

impl InvocationService {
    pub fn new(reactor: ReactorHandle, retry_pause: Duration, max_backoff: Duration) -> Self {
        Self {
            next_correlation_id: AtomicI64::new(1),
            in_flight: Mutex::new(HashMap::new()),
            retry_pause,
            max_backoff,
            reactor,
            resend: Mutex::new(None),
        }
    }

    /// Installs the function used to re-route and re-send a retried
    /// invocation. Without one, retryable failures behave as before: they
    /// fail immediately (this is also what unit tests below exercise).
    pub fn set_resend(&self, resend: Arc<ResendFn>) {
        *self.resend.lock().unwrap() = Some(resend);
    }

    pub fn next_correlation_id(&self) -> i64 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a new invocation and arms its deadline timer. The caller
    /// is responsible for actually sending `request` via whatever transport
    /// `routing` resolves to; this only tracks completion, retry, and
    /// timeout.
    pub fn register(
        self: &Arc<Self>,
        request: Frame,
        routing: RoutingMode,
        timeout: Duration,
        bound_connection: Option<u64>,
    ) -> Deferred<Frame> {
        let correlation_id = request.correlation_id;
        let deferred = Deferred::<Frame>::new();
        let deadline = Instant::now() + timeout;

        let this = self.clone();
        let deadline_timer = self.reactor.add_timer_absolute(deadline, move || {
            this.fail(correlation_id, ClientError::OperationTimeout(timeout));
        });

        self.in_flight.lock().unwrap().insert(
            correlation_id,
            Invocation {
                request,
                routing,
                deferred: deferred.clone(),
                deadline,
                attempt: 0,
                bound_connection,
                deadline_timer: Some(deadline_timer),
                retry_timer: None,
            },
        );
        deferred
    }

    /// Completes the invocation matching `frame.correlation_id`, if any.
    /// Frames with no matching invocation are logged and dropped unless
    /// they carry the event flag, which callers should route separately
    /// before reaching this method.
    pub fn complete(&self, frame: Frame) {
        let invocation = self.in_flight.lock().unwrap().remove(&frame.correlation_id);
        match invocation {
            Some(invocation) => {
                cancel(invocation.deadline_timer);
                cancel(invocation.retry_timer);
                invocation.deferred.set_result(frame);
            }
            None => {
                warn!(
                    correlation_id = frame.correlation_id,
                    "response for unknown or already-completed correlation id"
                );
            }
        }
    }

    /// Hard-fails an invocation -- used only by the deadline timer itself,
    /// which is already the thing firing, so there is no `deadline_timer`
    /// left to cancel.
    fn fail(&self, correlation_id: i64, error: ClientError) {
        if let Some(invocation) = self.in_flight.lock().unwrap().remove(&correlation_id) {
            cancel(invocation.retry_timer);
            invocation.deferred.set_exception(error);
        }
    }

    /// Reacts to `connection_id` dying: every invocation bound to it is
    /// either retried on a freshly resolved connection (if the failure is
    /// retryable, a deadline remains, and a `resend` function is
    /// installed) or failed outright. Unbound invocations are left
    /// untouched.
    pub fn fail_connection(self: &Arc<Self>, connection_id: u64, error_factory: impl Fn() -> ClientError) {
        let bound_ids: Vec<i64> = {
            let in_flight = self.in_flight.lock().unwrap();
            in_flight
                .iter()
                .filter(|(_, inv)| inv.bound_connection == Some(connection_id))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in bound_ids {
            let invocation = self.in_flight.lock().unwrap().remove(&id);
            if let Some(invocation) = invocation {
                self.retry_or_fail(id, invocation, error_factory());
            }
        }
    }

    /// Either reschedules `invocation` for a backed-off retry, or fails it
    /// for good. `invocation` must already be removed from `in_flight`.
    fn retry_or_fail(self: &Arc<Self>, correlation_id: i64, invocation: Invocation, error: ClientError) {
        let within_deadline = Instant::now() < invocation.deadline;
        let resend = if is_retryable(&error) && within_deadline {
            self.resend.lock().unwrap().clone()
        } else {
            None
        };

        let Some(resend) = resend else {
            cancel(invocation.deadline_timer);
            cancel(invocation.retry_timer);
            invocation.deferred.set_exception(error);
            return;
        };

        let attempt = invocation.attempt;
        let delay = self.backoff_delay(attempt);
        debug!(correlation_id, attempt, ?delay, %error, "retrying invocation after a retryable failure");

        let this = self.clone();
        let routing = invocation.routing.clone();
        let request = invocation.request.clone();
        let retry_timer = self.reactor.add_timer(delay, move || {
            this.attempt_resend(correlation_id, resend, routing, request);
        });

        self.in_flight.lock().unwrap().insert(
            correlation_id,
            Invocation {
                attempt: attempt + 1,
                bound_connection: None,
                retry_timer: Some(retry_timer),
                ..invocation
            },
        );
    }

    /// Runs on the reactor thread once a retry's backoff elapses. If the
    /// invocation is gone (completed or timed out while waiting) this is a
    /// no-op; a resend that itself fails goes back through
    /// `retry_or_fail`.
    fn attempt_resend(self: &Arc<Self>, correlation_id: i64, resend: Arc<ResendFn>, routing: RoutingMode, request: Frame) {
        match resend(&routing, &request) {
            Ok(connection_id) => {
                if let Some(invocation) = self.in_flight.lock().unwrap().get_mut(&correlation_id) {
                    invocation.bound_connection = Some(connection_id);
                }
            }
            Err(e) => {
                let invocation = self.in_flight.lock().unwrap().remove(&correlation_id);
                if let Some(invocation) = invocation {
                    self.retry_or_fail(correlation_id, invocation, e);
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Backoff delay for a given (zero-based) retry attempt: capped
    /// exponential with +/-20% jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_pause.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(20));
        let capped = exp.min(self.max_backoff.as_millis() as u64).max(base);
        let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered = (capped as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
        Duration::from_millis(jittered)
    }
}

fn cancel(timer: Option<TimerHandle>) {
    if let Some(timer) = timer {
        timer.cancel();
    }
}

/// Retry classification for a failed invocation attempt.
pub fn is_retryable(error: &ClientError) -> bool {
    error.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn request(correlation_id: i64) -> Frame {
        Frame::new(correlation_id, -1, 1, Bytes::from_static(b"payload"))
    }

    #[test]
    fn complete_resolves_the_matching_invocation() {
        let mut reactor = Reactor::start().unwrap();
        let service = Arc::new(InvocationService::new(
            reactor.handle(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        ));
        let deferred = service.register(request(1), RoutingMode::Random, Duration::from_secs(5), None);
        service.complete(request(1));
        assert_eq!(deferred.wait(None).unwrap().correlation_id, 1);
        reactor.shutdown();
    }

    #[test]
    fn unmatched_response_is_dropped_silently() {
        let mut reactor = Reactor::start().unwrap();
        let service = Arc::new(InvocationService::new(
            reactor.handle(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        ));
        service.complete(request(999));
        assert_eq!(service.pending_count(), 0);
        reactor.shutdown();
    }

    #[test]
    fn invocation_times_out_after_its_deadline() {
        let mut reactor = Reactor::start().unwrap();
        let service = Arc::new(InvocationService::new(
            reactor.handle(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        ));
        let deferred = service.register(
            request(5),
            RoutingMode::Random,
            Duration::from_millis(30),
            None,
        );
        let result = deferred.wait(Some(Duration::from_secs(2)));
        assert!(matches!(result, Err(ClientError::OperationTimeout(_))));
        assert_eq!(service.pending_count(), 0);
        reactor.shutdown();
    }

    #[test]
    fn fail_connection_only_fails_bound_invocations() {
        let mut reactor = Reactor::start().unwrap();
        let service = Arc::new(InvocationService::new(
            reactor.handle(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        ));
        let bound = service.register(request(1), RoutingMode::Random, Duration::from_secs(5), Some(42));
        let unbound = service.register(request(2), RoutingMode::Random, Duration::from_secs(5), None);

        service.fail_connection(42, || ClientError::TargetDisconnected);

        assert!(bound.wait(Some(Duration::from_millis(200))).is_err());
        assert_eq!(service.pending_count(), 1);
        let _ = unbound;
        reactor.shutdown();
    }

    #[test]
    fn backoff_grows_but_stays_capped() {
        let mut reactor = Reactor::start().unwrap();
        let service = InvocationService::new(
            reactor.handle(),
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        let small = service.backoff_delay(0);
        let large = service.backoff_delay(10);
        assert!(small <= Duration::from_millis(130));
        assert!(large <= Duration::from_millis(1300));
        reactor.shutdown();
    }

    #[test]
    fn a_retryable_failure_is_resent_instead_of_failing_immediately() {
        let mut reactor = Reactor::start().unwrap();
        let service = Arc::new(InvocationService::new(
            reactor.handle(),
            Duration::from_millis(5),
            Duration::from_millis(50),
        ));

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_resend = calls.clone();
        service.set_resend(Arc::new(move |_routing: &RoutingMode, _request: &Frame| {
            calls_in_resend.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        }));

        let deferred = service.register(request(1), RoutingMode::Random, Duration::from_secs(5), Some(42));
        service.fail_connection(42, || ClientError::TargetDisconnected);
        assert_eq!(service.pending_count(), 1);

        // The invocation is still pending after the resend, rebound to the
        // connection the resend function reported.
        std::thread::sleep(Duration::from_millis(40));
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(service.pending_count(), 1);

        service.complete(request(1));
        assert_eq!(deferred.wait(Some(Duration::from_millis(200))).unwrap().correlation_id, 1);
        reactor.shutdown();
    }

    #[test]
    fn retries_stop_once_the_resend_reports_a_non_retryable_error() {
        let mut reactor = Reactor::start().unwrap();
        let service = Arc::new(InvocationService::new(
            reactor.handle(),
            Duration::from_millis(5),
            Duration::from_millis(50),
        ));

        service.set_resend(Arc::new(|_routing: &RoutingMode, _request: &Frame| {
            Err(ClientError::IllegalState("member gone".into()))
        }));

        let deferred = service.register(request(1), RoutingMode::Random, Duration::from_secs(5), Some(42));
        service.fail_connection(42, || ClientError::TargetDisconnected);

        std::thread::sleep(Duration::from_millis(40));
        let result = deferred.wait(Some(Duration::from_millis(200)));
        assert!(matches!(result, Err(ClientError::IllegalState(_))));
        assert_eq!(service.pending_count(), 0);
        reactor.shutdown();
    }
}
