//! The bucket descriptor (spec §3).

use std::sync::Arc;

use crate::ids::{ConnId, NodeId};
use crate::store::ValueStore;

/// A bucket's replica role. `Absent` corresponds to the original's
/// `level = -1` ("not present").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketLevel {
    Primary,
    Secondary,
    Absent,
}

impl BucketLevel {
    /// The original's numeric encoding (`primary=0, secondary=1,
    /// not-present=-1`), used on the wire (`HASHMASK`/`CONTROL_BUCKET`
    /// payloads carry `level:int`).
    #[must_use]
    pub const fn wire_value(self) -> i32 {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
            Self::Absent => -1,
        }
    }

    #[must_use]
    pub const fn from_wire_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Primary),
            1 => Some(Self::Secondary),
            -1 => Some(Self::Absent),
            _ => None,
        }
    }
}

/// A single bucket: `index`, replica role, the value store it owns, and
/// the peer/ownership bookkeeping needed to drive migration (spec §3).
#[derive(Debug, Clone)]
pub struct Bucket {
    pub index: u32,
    pub level: BucketLevel,
    pub data: Arc<ValueStore>,
    /// Identity of the primary owner (set regardless of whether this
    /// replica *is* the primary, so a secondary/absent replica still
    /// knows who to redirect to).
    pub primary_node: Option<NodeId>,
    pub secondary_node: Option<NodeId>,
    /// If this replica is a secondary, the node streaming updates to it.
    pub source_node: Option<NodeId>,
    /// If this replica is a primary, the node receiving backup updates.
    pub backup_node: Option<NodeId>,
    /// Non-`None` iff this bucket is currently being migrated out;
    /// identifies the target peer connection.
    pub transfer_client: Option<ConnId>,
    /// `true` between requesting a peer promote its secondary copy and
    /// the swap being acknowledged (spec §4.6).
    pub promoting: bool,
    /// Set after this bucket takes part in a primary/secondary switch,
    /// to stop the decision procedure from immediately switching it
    /// back next tick (spec §4.4 tie-break).
    pub last_bucket: bool,
}

impl Bucket {
    /// A fresh, empty primary bucket owned by `local_node`, with no
    /// backup (spec §3's founder allocation).
    #[must_use]
    pub fn new_local_primary(index: u32, local_node: NodeId) -> Self {
        Self {
            index,
            level: BucketLevel::Primary,
            data: Arc::new(ValueStore::new()),
            primary_node: Some(local_node),
            secondary_node: None,
            source_node: None,
            backup_node: None,
            transfer_client: None,
            promoting: false,
            last_bucket: false,
        }
    }

    /// `true` if this bucket is a primary with no backup -- contributes
    /// to the table's `nobackup_count`.
    #[must_use]
    pub const fn is_nobackup(&self) -> bool {
        matches!(self.level, BucketLevel::Primary) && self.backup_node.is_none()
    }

    #[must_use]
    pub const fn is_transferring(&self) -> bool {
        self.transfer_client.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_wire_values_match_spec() {
        assert_eq!(BucketLevel::Primary.wire_value(), 0);
        assert_eq!(BucketLevel::Secondary.wire_value(), 1);
        assert_eq!(BucketLevel::Absent.wire_value(), -1);
    }

    #[test]
    fn level_wire_values_round_trip() {
        for level in [BucketLevel::Primary, BucketLevel::Secondary, BucketLevel::Absent] {
            assert_eq!(BucketLevel::from_wire_value(level.wire_value()), Some(level));
        }
    }

    #[test]
    fn new_local_primary_has_no_backup() {
        let bucket = Bucket::new_local_primary(3, 1);
        assert!(bucket.is_nobackup());
        assert!(!bucket.is_transferring());
    }
}
