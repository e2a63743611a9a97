//! Shared data types for the meshlink cluster client.
//!
//! This crate holds the value types that flow between the wire protocol, the
//! connection fabric, and the cluster/partition tracking layers: member and
//! client identity, versioned membership and partition snapshots, and vector
//! clocks. None of these types perform I/O.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a cluster member for the lifetime of its incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub Uuid);

impl MemberId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifies this client process for the lifetime of one client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifies one cluster incarnation. Changes when a cluster is wiped and
/// restarted; a client observing a new cluster id must discard membership
/// and partition state accumulated under the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub Uuid);

/// Immutable description of this client process, exposed to listeners and
/// to the authentication handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub local_address: Option<SocketAddr>,
    pub name: String,
    pub labels: Vec<String>,
}

impl ClientInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ClientId::generate(),
            local_address: None,
            name: name.into(),
            labels: Vec::new(),
        }
    }
}

/// Immutable description of a cluster member. Equality and hashing are by
/// [`MemberId`] only; two `MemberInfo` values with the same id but different
/// addresses are the same member (e.g. after a rolling restart).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: MemberId,
    pub address: SocketAddr,
    pub lite: bool,
    pub attributes: BTreeMap<String, String>,
}

impl PartialEq for MemberInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for MemberInfo {}

impl std::hash::Hash for MemberInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A versioned, immutable view of cluster membership.
///
/// A new snapshot is never mutated in place; the cluster service always
/// replaces the whole object. `version` is monotonic per membership source;
/// `ordering` preserves the server-reported member order, which is the same
/// on every client.
#[derive(Debug, Clone)]
pub struct MemberListSnapshot {
    version: i64,
    members: BTreeMap<MemberId, MemberInfo>,
    ordering: Vec<MemberId>,
}

impl MemberListSnapshot {
    /// The sentinel snapshot a client starts with before any members-view
    /// event has been applied.
    pub fn initial() -> Self {
        Self {
            version: -1,
            members: BTreeMap::new(),
            ordering: Vec::new(),
        }
    }

    pub fn new(version: i64, members: Vec<MemberInfo>) -> Self {
        let ordering = members.iter().map(|m| m.id).collect();
        let members = members.into_iter().map(|m| (m.id, m)).collect();
        Self {
            version,
            members,
            ordering,
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, id: &MemberId) -> Option<&MemberInfo> {
        self.members.get(id)
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    /// Members in canonical server order.
    pub fn members(&self) -> impl Iterator<Item = &MemberInfo> {
        self.ordering.iter().filter_map(|id| self.members.get(id))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Members present in `self` but not in `other`.
    pub fn removed_since(&self, other: &Self) -> Vec<MemberInfo> {
        self.ordering
            .iter()
            .filter(|id| !other.members.contains_key(id))
            .filter_map(|id| self.members.get(id).cloned())
            .collect()
    }

    /// Members present in `other` but not in `self`.
    pub fn added_since(&self, other: &Self) -> Vec<MemberInfo> {
        other.removed_since(self)
    }
}

impl Default for MemberListSnapshot {
    fn default() -> Self {
        Self::initial()
    }
}

/// A versioned map from partition id to owning member, scoped to the
/// connection it was received on. A table from a different connection is
/// always preferred over a stale one from the current source, regardless of
/// version (see [`PartitionTable::should_apply`]).
#[derive(Debug, Clone, Default)]
pub struct PartitionTable {
    source: Option<u64>,
    version: i64,
    owners: BTreeMap<u32, MemberId>,
}

impl PartitionTable {
    pub fn initial() -> Self {
        Self {
            source: None,
            version: -1,
            owners: BTreeMap::new(),
        }
    }

    /// Whether an incoming view from `source` at `version` should replace
    /// the current table, given `entries` is the flattened ownership map
    /// the view would produce.
    pub fn should_apply(&self, source: u64, version: i64, entries: &BTreeMap<u32, MemberId>) -> bool {
        if entries.is_empty() {
            return false;
        }
        self.source != Some(source) || version > self.version
    }

    pub fn apply(&mut self, source: u64, version: i64, entries: BTreeMap<u32, MemberId>) {
        self.source = Some(source);
        self.version = version;
        self.owners = entries;
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn owner_of(&self, partition_id: u32) -> Option<MemberId> {
        self.owners.get(&partition_id).copied()
    }

    pub fn partition_count(&self) -> usize {
        self.owners.len()
    }
}

/// A vector clock keyed by replica id, with a strict causal-after comparator.
///
/// `a.is_strictly_after(b)` mirrors the classic vector-clock rule: every
/// timestamp `b` has must be matched or exceeded in `a`, at least one must
/// be strictly greater, OR `a` must carry a replica `b` does not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    timestamps: BTreeMap<String, i64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, replica: impl Into<String>, timestamp: i64) {
        self.timestamps.insert(replica.into(), timestamp);
    }

    pub fn get(&self, replica: &str) -> Option<i64> {
        self.timestamps.get(replica).copied()
    }

    pub fn size(&self) -> usize {
        self.timestamps.len()
    }

    /// True iff `self` is strictly causally after `other`.
    pub fn is_strictly_after(&self, other: &Self) -> bool {
        let mut any_greater = false;
        for (replica, &other_ts) in &other.timestamps {
            match self.timestamps.get(replica) {
                None => return false,
                Some(&self_ts) => {
                    if self_ts < other_ts {
                        return false;
                    }
                    if self_ts > other_ts {
                        any_greater = true;
                    }
                }
            }
        }
        any_greater || other.size() < self.size()
    }
}

/// Applies the canonical partition-affinity substring rule: the part of a
/// key after its first `'@'` determines partition placement, so related
/// keys can be co-located by sharing a suffix.
pub fn string_partition_strategy(key: &str) -> &str {
    match key.find('@') {
        Some(idx) => &key[idx + 1..],
        None => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: Uuid, addr: &str) -> MemberInfo {
        MemberInfo {
            id: MemberId(id),
            address: addr.parse().unwrap(),
            lite: false,
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn member_list_diff_finds_removed_and_added() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let c = Uuid::from_u128(3);
        let d = Uuid::from_u128(4);

        let before = MemberListSnapshot::new(
            5,
            vec![
                member(a, "127.0.0.1:5701"),
                member(b, "127.0.0.1:5702"),
                member(c, "127.0.0.1:5703"),
            ],
        );
        let after = MemberListSnapshot::new(
            6,
            vec![
                member(b, "127.0.0.1:5702"),
                member(c, "127.0.0.1:5703"),
                member(d, "127.0.0.1:5704"),
            ],
        );

        let removed = before.removed_since(&after);
        let added = before.added_since(&after);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, MemberId(a));
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].id, MemberId(d));
    }

    #[test]
    fn partition_table_rejects_empty_entries() {
        let table = PartitionTable::initial();
        assert!(!table.should_apply(7, 1, &BTreeMap::new()));
    }

    #[test]
    fn partition_table_rejects_stale_same_source_version() {
        let mut table = PartitionTable::initial();
        let mut entries = BTreeMap::new();
        entries.insert(0u32, MemberId(Uuid::from_u128(1)));
        table.apply(7, 10, entries.clone());

        assert!(!table.should_apply(7, 9, &entries));
        assert!(table.should_apply(7, 11, &entries));
    }

    #[test]
    fn partition_table_accepts_different_source_regardless_of_version() {
        let mut table = PartitionTable::initial();
        let mut entries = BTreeMap::new();
        entries.insert(0u32, MemberId(Uuid::from_u128(1)));
        table.apply(7, 10, entries.clone());

        assert!(table.should_apply(8, 3, &entries));
    }

    #[test]
    fn vector_clock_strictly_after_examples() {
        let mut a = VectorClock::new();
        a.set("r1", 5);
        a.set("r2", 3);
        let mut b = VectorClock::new();
        b.set("r1", 4);
        b.set("r2", 3);
        assert!(a.is_strictly_after(&b));
        assert!(!b.is_strictly_after(&a));

        let mut c = VectorClock::new();
        c.set("r1", 5);
        let mut d = VectorClock::new();
        d.set("r1", 5);
        d.set("r2", 1);
        assert!(!c.is_strictly_after(&d));
    }

    #[test]
    fn partition_strategy_splits_on_first_at() {
        assert_eq!(string_partition_strategy("foo@bar"), "bar");
        assert_eq!(string_partition_strategy("plain"), "plain");
        assert_eq!(string_partition_strategy("a@b@c"), "b@c");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn replica_id() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["r1", "r2", "r3"]).prop_map(String::from)
    }

    fn clock() -> impl Strategy<Value = VectorClock> {
        prop::collection::btree_map(replica_id(), 0i64..20, 0..4).prop_map(|timestamps| {
            let mut clock = VectorClock::new();
            for (replica, ts) in timestamps {
                clock.set(replica, ts);
            }
            clock
        })
    }

    proptest! {
        /// `is_strictly_after` can never hold in both directions at once --
        /// the law the removed/added dispatch ordering in `ClusterService`
        /// ultimately relies on.
        #[test]
        fn strictly_after_is_antisymmetric(a in clock(), b in clock()) {
            prop_assert!(!(a.is_strictly_after(&b) && b.is_strictly_after(&a)));
        }

        /// No clock is strictly after itself.
        #[test]
        fn a_clock_is_never_strictly_after_itself(a in clock()) {
            prop_assert!(!a.is_strictly_after(&a));
        }

        /// A partition id derived from any hash and any positive partition
        /// count is always in range.
        #[test]
        fn partition_table_owner_lookup_never_panics(
            source in any::<u64>(),
            version in any::<i64>(),
            partition_id in any::<u32>(),
            member in any::<u128>(),
        ) {
            let mut table = PartitionTable::initial();
            let mut entries = BTreeMap::new();
            entries.insert(partition_id, MemberId(Uuid::from_u128(member)));
            if table.should_apply(source, version, &entries) {
                table.apply(source, version, entries);
            }
            let _ = table.owner_of(partition_id);
        }
    }
}
