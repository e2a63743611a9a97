//! Partition-table tracking and partition-id derivation.
//!
//! Ground truth: `hazelcast/partition.py`'s `_InternalPartitionService` --
//! `_should_be_applied`'s exact admission rule (reject empty views; accept
//! a different source unconditionally; otherwise require a strictly newer
//! version) lives in `meshlink_types::PartitionTable::should_apply`, reused
//! here rather than duplicated. `check_and_set_partition_count` enforces
//! first-set-or-must-match semantics on the partition count discovered
//! during authentication (§4.11).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use meshlink_types::{MemberId, PartitionTable};
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Standard MurmurHash3 x86-32 seed used across this protocol family. No
/// seed is named in the distributed spec; this is a fixed protocol
/// constant, not something a caller configures.
pub const HASH_SEED: u32 = 0x0100_0193;

/// MurmurHash3 x86-32, per Austin Appleby's reference algorithm.
pub fn murmur_hash3_x86_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut hash = seed;
    let chunks = data.chunks_exact(4);
    let remainder = chunks.remainder();

    for chunk in chunks {
        let mut k = u32::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        hash ^= k;
        hash = hash.rotate_left(13);
        hash = hash.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let mut k1: u32 = 0;
    for (i, &byte) in remainder.iter().enumerate().rev() {
        k1 ^= (byte as u32) << (8 * i);
    }
    if !remainder.is_empty() {
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        hash ^= k1;
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    hash
}

/// Computes the partition hash the cluster uses for partition placement,
/// then resolves it to a partition id given the client's (fixed for its
/// lifetime) `partition_count`.
pub fn partition_id_for_hash(partition_hash: u32, partition_count: u32) -> u32 {
    partition_hash % partition_count
}

/// Tracks the current partition table and the client-wide partition count
/// discovered at authentication.
pub struct PartitionService {
    table: RwLock<PartitionTable>,
    partition_count: AtomicU32,
}

impl PartitionService {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(PartitionTable::initial()),
            partition_count: AtomicU32::new(0),
        }
    }

    /// Sets the partition count on first call; subsequent calls must agree
    /// or this is a fatal protocol error (partition counts never change
    /// within one cluster incarnation).
    pub fn check_and_set_partition_count(&self, count: u32) -> ClientResult<()> {
        loop {
            let current = self.partition_count.load(Ordering::SeqCst);
            if current == count {
                return Ok(());
            }
            if current == 0 {
                if self
                    .partition_count
                    .compare_exchange(0, count, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            return Err(ClientError::PartitionCountMismatch {
                expected: current,
                got: count,
            });
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count.load(Ordering::SeqCst)
    }

    pub fn handle_partitions_view(
        &self,
        source_connection: u64,
        version: i64,
        entries: BTreeMap<u32, MemberId>,
    ) {
        let mut table = self.table.write().unwrap();
        if table.should_apply(source_connection, version, &entries) {
            debug!(source_connection, version, count = entries.len(), "applying partitions view");
            table.apply(source_connection, version, entries);
        }
    }

    pub fn owner_of_partition(&self, partition_id: u32) -> Option<MemberId> {
        self.table.read().unwrap().owner_of(partition_id)
    }

    /// Resolves a precomputed partition hash to the owning member's
    /// partition id. Fails with `ClientOffline` if the partition count has
    /// not yet been discovered.
    pub fn partition_id_for(&self, partition_hash: u32) -> ClientResult<u32> {
        let count = self.partition_count();
        if count == 0 {
            return Err(ClientError::ClientOffline);
        }
        Ok(partition_id_for_hash(partition_hash, count))
    }

    pub fn reset(&self) {
        *self.table.write().unwrap() = PartitionTable::initial();
    }
}

impl Default for PartitionService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn partition_id_matches_the_literal_example() {
        // partitionCount = 271, hash = 0xDEADBEEF
        let id = partition_id_for_hash(0xDEAD_BEEF, 271);
        assert_eq!(id, 0xDEAD_BEEFu32 % 271);
    }

    #[test]
    fn partition_count_first_set_then_must_match() {
        let service = PartitionService::new();
        assert!(service.check_and_set_partition_count(271).is_ok());
        assert!(service.check_and_set_partition_count(271).is_ok());
        assert!(matches!(
            service.check_and_set_partition_count(272),
            Err(ClientError::PartitionCountMismatch { expected: 271, got: 272 })
        ));
    }

    #[test]
    fn offline_before_partition_count_known() {
        let service = PartitionService::new();
        assert!(matches!(
            service.partition_id_for(42),
            Err(ClientError::ClientOffline)
        ));
    }

    #[test]
    fn stale_same_source_view_is_ignored() {
        let service = PartitionService::new();
        let m1 = MemberId(Uuid::from_u128(1));
        let mut entries = BTreeMap::new();
        entries.insert(0u32, m1);
        service.handle_partitions_view(7, 10, entries.clone());
        service.handle_partitions_view(7, 9, entries);
        assert_eq!(service.owner_of_partition(0), Some(m1));
    }

    #[test]
    fn murmur_hash_is_deterministic() {
        let a = murmur_hash3_x86_32(b"hello world", HASH_SEED);
        let b = murmur_hash3_x86_32(b"hello world", HASH_SEED);
        assert_eq!(a, b);
        let c = murmur_hash3_x86_32(b"hello worlD", HASH_SEED);
        assert_ne!(a, c);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The hash itself is a pure function of its input: same bytes, same
        /// seed, same output, regardless of what the bytes are.
        #[test]
        fn murmur_hash_is_deterministic_for_any_input(data in prop::collection::vec(any::<u8>(), 0..128)) {
            let a = murmur_hash3_x86_32(&data, HASH_SEED);
            let b = murmur_hash3_x86_32(&data, HASH_SEED);
            prop_assert_eq!(a, b);
        }

        /// A partition id is always in range for any hash and any positive
        /// partition count -- the law `partition_id_for_key` depends on.
        #[test]
        fn partition_id_is_always_in_range(hash in any::<u32>(), count in 1u32..10_000) {
            let id = partition_id_for_hash(hash, count);
            prop_assert!(id < count);
        }
    }
}
