//! Member selection policy for `RoutingMode::Random` invocations.
//!
//! Ground truth: `hazelcast/cluster.py`'s `AbstractLoadBalancer`,
//! `RoundRobinLB`, and `RandomLB`. Each balancer subscribes to cluster
//! membership as a listener and keeps its own cached copy of the member
//! list, rather than reaching into `ClusterService` on every call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use meshlink_types::MemberInfo;
use rand::Rng;

/// Implemented by any member-selection policy. `members_changed` is called
/// by the cluster service whenever a new snapshot is published (fired for
/// the existing list too, on initial subscription).
pub trait LoadBalancer: Send + Sync {
    fn members_changed(&self, members: Vec<MemberInfo>);
    fn next(&self) -> Option<MemberInfo>;
}

/// Cycles through the cached member list; concurrent callers may observe a
/// racy index (best-effort, matching the source's lack of locking around
/// its counter).
pub struct RoundRobinLoadBalancer {
    members: Mutex<Vec<MemberInfo>>,
    index: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(Vec::new()),
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinLoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn members_changed(&self, members: Vec<MemberInfo>) {
        *self.members.lock().unwrap() = members;
    }

    fn next(&self) -> Option<MemberInfo> {
        let members = self.members.lock().unwrap();
        if members.is_empty() {
            return None;
        }
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % members.len();
        Some(members[idx].clone())
    }
}

/// Picks a uniformly random member from the cached list on every call.
pub struct RandomLoadBalancer {
    members: Mutex<Vec<MemberInfo>>,
}

impl RandomLoadBalancer {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(Vec::new()),
        }
    }
}

impl Default for RandomLoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RandomLoadBalancer {
    fn members_changed(&self, members: Vec<MemberInfo>) {
        *self.members.lock().unwrap() = members;
    }

    fn next(&self) -> Option<MemberInfo> {
        let members = self.members.lock().unwrap();
        if members.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..members.len());
        Some(members[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_types::MemberId;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn member(n: u128) -> MemberInfo {
        MemberInfo {
            id: MemberId(Uuid::from_u128(n)),
            address: "127.0.0.1:5701".parse().unwrap(),
            lite: false,
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn round_robin_cycles_through_all_members() {
        let lb = RoundRobinLoadBalancer::new();
        lb.members_changed(vec![member(1), member(2), member(3)]);
        let picks: Vec<_> = (0..6).map(|_| lb.next().unwrap().id).collect();
        assert_eq!(
            picks,
            vec![
                MemberId(Uuid::from_u128(1)),
                MemberId(Uuid::from_u128(2)),
                MemberId(Uuid::from_u128(3)),
                MemberId(Uuid::from_u128(1)),
                MemberId(Uuid::from_u128(2)),
                MemberId(Uuid::from_u128(3)),
            ]
        );
    }

    #[test]
    fn empty_member_list_yields_none() {
        let lb = RoundRobinLoadBalancer::new();
        assert!(lb.next().is_none());
    }

    #[test]
    fn random_always_picks_from_current_list() {
        let lb = RandomLoadBalancer::new();
        lb.members_changed(vec![member(1)]);
        assert_eq!(lb.next().unwrap().id, MemberId(Uuid::from_u128(1)));
    }
}
