//! The migration decision procedure (spec §4.4): given a peer's
//! gossiped loadlevel and this node's own bucket table, decide at most
//! one action to take against that peer this tick.
//!
//! Original to this crate -- the original spec names no teacher
//! counterpart for this procedure. Grounded structurally on the
//! teacher's `cluster/assignment.rs` idiom of a free function over a
//! partition-table-like type returning a decision, adapted to the
//! spec's literal four-rule ordered decision list rather than a
//! from-scratch rebalance planner.

use crate::bucket::{Bucket, BucketLevel, BucketTable};
use crate::ids::NodeId;
use crate::node::LoadLevel;

/// The one action the decision procedure selects this tick, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationAction {
    /// Ask `target` to promote its secondary copy of `bucket_index` to
    /// primary while this node demotes to secondary (spec §4.4 rule 1,
    /// §4.6).
    Switch { bucket_index: u32 },
    /// Stream `bucket_index` to `target` as a new secondary (no-backup
    /// fill, rule 2) or hand it off entirely for balance (rule 3). Both
    /// begin with the same `ACCEPT_BUCKET` handshake (spec §4.5); which
    /// one it is only affects the source-side bookkeeping on
    /// completion, not this decision.
    Stream { bucket_index: u32 },
}

/// Runs the spec §4.4 decision procedure against one peer. `backup_total`
/// looks up a node's total bucket count (`primary + secondary`) given
/// its id, used by rule 3 to confirm a candidate's existing backup is
/// "safely duplicated elsewhere" (heavier-loaded than the target).
///
/// Returns `None` if no rule applies, if a transfer is already latched
/// on this node (`bucket_table.bucket_transfer_active()`), or if a rule
/// applies in principle but no eligible bucket is found.
pub fn decide(
    bucket_table: &BucketTable,
    local_node: NodeId,
    target_node: NodeId,
    target: LoadLevel,
    mask: u64,
    node_count: u32,
    backup_total: impl Fn(NodeId) -> u32,
) -> Option<MigrationAction> {
    if bucket_table.bucket_transfer_active() {
        return None;
    }

    let local = LoadLevel {
        primary_count: u32::try_from(bucket_table.primary_count(local_node)).unwrap_or(u32::MAX),
        secondary_count: u32::try_from(bucket_table.secondary_count(local_node)).unwrap_or(u32::MAX),
        transferring: false,
    };

    // Rule 1: switch primary<->secondary with this peer.
    if local.primary_count >= 1
        && local.primary_count - 1 >= local.secondary_count + 1
        && target.secondary_count > target.primary_count
    {
        if let Some(index) = find_candidate(bucket_table, |b| {
            b.level == BucketLevel::Primary && b.primary_node == Some(local_node) && b.backup_node == Some(target_node)
        }) {
            return Some(MigrationAction::Switch { bucket_index: index });
        }
    }

    let bucket_count = mask + 1;

    // Rule 2: no-backup fill.
    if u64::from(target.total()) < bucket_count && bucket_table.nobackup_count(local_node) > 0 {
        if let Some(index) = find_candidate(bucket_table, |b| {
            b.level == BucketLevel::Primary && b.primary_node == Some(local_node) && b.is_nobackup()
        }) {
            return Some(MigrationAction::Stream { bucket_index: index });
        }
    }

    // Rule 3: transfer for balance.
    let ideal = bucket_count.saturating_mul(2) / u64::from(node_count.max(1));
    if u64::from(local.total()) <= ideal || local.primary_count.saturating_sub(1) <= target.primary_count {
        return None;
    }
    find_candidate(bucket_table, |b| {
        b.level == BucketLevel::Primary
            && b.primary_node == Some(local_node)
            && b.backup_node.is_some_and(|backup| backup_total(backup) > target.total())
    })
    .map(|index| MigrationAction::Stream { bucket_index: index })
}

/// Scans bucket indices in ascending order for the first bucket
/// matching `predicate`, skipping any bucket flagged `last_bucket`
/// (spec §4.4 tie-break: "the bucket most recently involved in a
/// transfer is skipped once").
fn find_candidate(bucket_table: &BucketTable, predicate: impl Fn(&Bucket) -> bool) -> Option<u32> {
    let mut indices: Vec<u32> = bucket_table.iter().map(|e| *e.key()).collect();
    indices.sort_unstable();
    for index in indices {
        let Some(bucket) = bucket_table.get(index) else { continue };
        if !bucket.last_bucket && predicate(&bucket) {
            return Some(index);
        }
    }
    None
}
