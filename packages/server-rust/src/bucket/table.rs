//! The bucket table: every bucket this node knows about, indexed by
//! bucket number, plus the mask currently in effect (spec §3, §4.1).

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use opencluster_core::STARTING_MASK;

use crate::bucket::descriptor::{Bucket, BucketLevel};
use crate::ids::NodeId;

/// All buckets a node is tracking, keyed by bucket index. `mask` is
/// `2^n - 1` for the current bucket count; a bucket's index is always
/// `key_hash & mask`.
#[derive(Debug)]
pub struct BucketTable {
    buckets: DashMap<u32, Bucket>,
    mask: AtomicU64,
}

impl BucketTable {
    /// An empty table with no mask set yet (pre-settle).
    #[must_use]
    pub fn empty() -> Self {
        Self { buckets: DashMap::new(), mask: AtomicU64::new(0) }
    }

    /// Founder allocation (spec §3/§9): claims every bucket under
    /// [`STARTING_MASK`] as a local, backup-less primary. Run once, after
    /// the settle timer determines this node is starting a fresh cluster
    /// (`lifecycle::settle`).
    #[must_use]
    pub fn founder(local_node: NodeId) -> Self {
        let table = Self { buckets: DashMap::new(), mask: AtomicU64::new(STARTING_MASK) };
        for index in 0..=u32::try_from(STARTING_MASK).expect("STARTING_MASK fits in u32") {
            table.buckets.insert(index, Bucket::new_local_primary(index, local_node));
        }
        table
    }

    #[must_use]
    pub fn mask(&self) -> u64 {
        self.mask.load(Ordering::Acquire)
    }

    /// Bucket count under the current mask.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// The bucket a key hash routes to under the current mask.
    #[must_use]
    pub fn index_for(&self, key_hash: u64) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            (key_hash & self.mask()) as u32
        }
    }

    #[must_use]
    pub fn get(&self, index: u32) -> Option<dashmap::mapref::one::Ref<'_, u32, Bucket>> {
        self.buckets.get(&index)
    }

    pub fn insert(&self, bucket: Bucket) {
        self.buckets.insert(bucket.index, bucket);
    }

    /// Mutates a bucket in place if present, returning whether it was
    /// found.
    pub fn with_mut<R>(&self, index: u32, f: impl FnOnce(&mut Bucket) -> R) -> Option<R> {
        self.buckets.get_mut(&index).map(|mut b| f(&mut b))
    }

    /// Count of buckets for which this node holds the primary replica.
    #[must_use]
    pub fn primary_count(&self, local_node: NodeId) -> usize {
        self.buckets.iter().filter(|b| b.level == BucketLevel::Primary && b.primary_node == Some(local_node)).count()
    }

    /// Count of buckets for which this node holds the secondary replica.
    #[must_use]
    pub fn secondary_count(&self, local_node: NodeId) -> usize {
        self.buckets
            .iter()
            .filter(|b| b.level == BucketLevel::Secondary && b.secondary_node == Some(local_node))
            .count()
    }

    /// Count of local primaries with no backup node assigned yet
    /// (drives the no-backup-fill branch of the migration decision
    /// procedure, spec §4.4).
    #[must_use]
    pub fn nobackup_count(&self, local_node: NodeId) -> usize {
        self.buckets.iter().filter(|b| b.primary_node == Some(local_node) && b.is_nobackup()).count()
    }

    /// `true` if any bucket is mid-transfer (at most one at a time,
    /// spec §4.5).
    #[must_use]
    pub fn bucket_transfer_active(&self) -> bool {
        self.buckets.iter().any(|b| b.is_transferring())
    }

    /// Replaces the mask after a split (spec §4.2). Callers must have
    /// already inserted the new indices' buckets via [`crate::bucket::split_table`].
    pub fn set_mask(&self, new_mask: u64) {
        self.mask.store(new_mask, Ordering::Release);
    }

    /// Iterates every bucket (used by gossip/stats reporting).
    pub fn iter(&self) -> impl Iterator<Item = dashmap::mapref::multiple::RefMulti<'_, u32, Bucket>> {
        self.buckets.iter()
    }
}

impl Default for BucketTable {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn founder_claims_every_bucket_under_starting_mask() {
        let table = BucketTable::founder(1);
        assert_eq!(table.mask(), STARTING_MASK);
        assert_eq!(table.len(), (STARTING_MASK + 1) as usize);
        assert_eq!(table.primary_count(1), (STARTING_MASK + 1) as usize);
        assert_eq!(table.nobackup_count(1), (STARTING_MASK + 1) as usize);
    }

    #[test]
    fn index_for_masks_key_hash() {
        let table = BucketTable::founder(1);
        let expected = u32::try_from(0xFFu64 & STARTING_MASK).unwrap();
        assert_eq!(table.index_for(0xFF), expected);
    }

    #[test]
    fn empty_table_has_no_buckets_and_zero_mask() {
        let table = BucketTable::empty();
        assert!(table.is_empty());
        assert_eq!(table.mask(), 0);
        assert!(!table.bucket_transfer_active());
    }
}
