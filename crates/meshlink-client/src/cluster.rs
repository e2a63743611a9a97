//! Cluster membership tracking.
//!
//! Ground truth: `hazelcast/cluster.py`'s `_InternalClusterService`. Key
//! behaviors reproduced here: snapshots are replaced as whole objects
//! (never mutated in place), removed-member listeners fire before
//! added-member listeners for the same transition, listener exceptions are
//! caught and logged rather than propagated, and `wait_initial_member_list_fetched`
//! blocks (default 120s) until the first non-empty snapshot arrives.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use meshlink_types::{MemberId, MemberInfo, MemberListSnapshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ClientError, ClientResult};
use crate::load_balancer::LoadBalancer;

/// Default timeout for `wait_initial_member_list_fetched`, matching the
/// source's 120-second `threading.Event` wait.
pub const INITIAL_LIST_TIMEOUT: Duration = Duration::from_secs(120);

pub type MembershipListener = Box<dyn Fn(&MemberInfo) + Send + Sync>;

struct ListenerEntry {
    id: Uuid,
    on_added: Option<MembershipListener>,
    on_removed: Option<MembershipListener>,
}

pub struct ClusterService {
    snapshot: Mutex<Arc<MemberListSnapshot>>,
    listeners: Mutex<Vec<ListenerEntry>>,
    initial_fetched: AtomicBool,
    initial_fetched_cv: Condvar,
    initial_fetched_lock: Mutex<()>,
    load_balancer: Arc<dyn LoadBalancer>,
}

impl ClusterService {
    pub fn new(load_balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            snapshot: Mutex::new(Arc::new(MemberListSnapshot::initial())),
            listeners: Mutex::new(Vec::new()),
            initial_fetched: AtomicBool::new(false),
            initial_fetched_cv: Condvar::new(),
            initial_fetched_lock: Mutex::new(()),
            load_balancer,
        }
    }

    pub fn snapshot(&self) -> Arc<MemberListSnapshot> {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn member(&self, id: &MemberId) -> Option<MemberInfo> {
        self.snapshot.lock().unwrap().get(id).cloned()
    }

    /// The member-selection policy backing `RoutingMode::Random`.
    pub fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.load_balancer
    }

    /// Registers a listener. If `fire_for_existing`, `on_added` is
    /// immediately invoked for every member already present, matching the
    /// load balancer's own subscription behavior.
    pub fn add_membership_listener(
        &self,
        on_added: Option<MembershipListener>,
        on_removed: Option<MembershipListener>,
        fire_for_existing: bool,
    ) -> Uuid {
        let id = Uuid::new_v4();
        if fire_for_existing {
            if let Some(cb) = &on_added {
                for member in self.snapshot().members() {
                    cb(member);
                }
            }
        }
        self.listeners.lock().unwrap().push(ListenerEntry {
            id,
            on_added,
            on_removed,
        });
        id
    }

    pub fn remove_membership_listener(&self, id: Uuid) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Applies an incoming members-view event, diffing against the current
    /// snapshot and dispatching removed-then-added in registration order.
    /// Ignores views with a version older than the current one.
    pub fn handle_members_view(&self, version: i64, members: Vec<MemberInfo>) {
        let new_snapshot = Arc::new(MemberListSnapshot::new(version, members));
        let previous = {
            let mut current = self.snapshot.lock().unwrap();
            if new_snapshot.version() < current.version() {
                return;
            }
            std::mem::replace(&mut *current, new_snapshot.clone())
        };

        let removed = new_snapshot.removed_since(&previous);
        let added = new_snapshot.added_since(&previous);

        let listeners = self.listeners.lock().unwrap();
        for member in &removed {
            for listener in listeners.iter() {
                if let Some(cb) = &listener.on_removed {
                    dispatch(cb, member);
                }
            }
        }
        for member in &added {
            for listener in listeners.iter() {
                if let Some(cb) = &listener.on_added {
                    dispatch(cb, member);
                }
            }
        }
        drop(listeners);

        self.load_balancer
            .members_changed(new_snapshot.members().cloned().collect());

        if !new_snapshot.is_empty() && !self.initial_fetched.load(Ordering::SeqCst) {
            let _guard = self.initial_fetched_lock.lock().unwrap();
            self.initial_fetched.store(true, Ordering::SeqCst);
            self.initial_fetched_cv.notify_all();
        }

        info!(version, removed = removed.len(), added = added.len(), "members view applied");
    }

    pub fn wait_initial_member_list_fetched(&self, timeout: Duration) -> ClientResult<()> {
        if self.initial_fetched.load(Ordering::SeqCst) {
            return Ok(());
        }
        let guard = self.initial_fetched_lock.lock().unwrap();
        let (_guard, result) = self
            .initial_fetched_cv
            .wait_timeout_while(guard, timeout, |_| {
                !self.initial_fetched.load(Ordering::SeqCst)
            })
            .unwrap();
        if result.timed_out() {
            warn!("timed out waiting for initial member list");
            return Err(ClientError::IllegalState(
                "timed out waiting for initial member list".into(),
            ));
        }
        Ok(())
    }

    /// Resets only the version counter (to force re-acceptance of a fresh
    /// view) while leaving the cached member map intact until the next
    /// view arrives. Used when the connection manager detects a cluster-id
    /// change.
    pub fn clear_member_list_version(&self) {
        let mut current = self.snapshot.lock().unwrap();
        let members: Vec<MemberInfo> = current.members().cloned().collect();
        *current = Arc::new(MemberListSnapshot::new(0, members));
    }
}

fn dispatch(cb: &MembershipListener, member: &MemberInfo) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| cb(member)));
    if result.is_err() {
        error!("membership listener panicked");
    }
}
