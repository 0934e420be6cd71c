//! The migration controller: decision procedure, protocol state
//! machine, and loadlevel gossip (spec §4.3–§4.6).

mod decision;
mod session;

pub use decision::{decide, MigrationAction};
pub use session::{MigrationSession, PendingSend, Role, SessionState, SourceKind};

use std::sync::Arc;

use parking_lot::RwLock;

use crate::ids::{ConnId, NodeId};

// Re-exported so callers that only deal with migration concerns don't
// need to know the gossip interval constant lives in `config`.
pub use crate::config::LOADLEVEL_INTERVAL;

/// Holds at most one [`MigrationSession`] at a time, matching the spec
/// §4.5 invariant that a node has at most one bucket in transfer. Both
/// the source and target sides of a single migration are represented
/// the same way; which node is playing which role is recorded in
/// [`MigrationSession::role`].
#[derive(Debug, Default)]
pub struct MigrationController {
    session: RwLock<Option<MigrationSession>>,
}

impl MigrationController {
    #[must_use]
    pub fn new() -> Self {
        Self { session: RwLock::new(None) }
    }

    /// `true` iff a migration is currently latched (spec §4.5
    /// `bucket_transfer`).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session.read().is_some()
    }

    /// Attempts to latch a new session. Fails with the existing
    /// session's bucket index if one is already active (spec §4.5:
    /// "any other migration attempt in that window is rejected with
    /// `CANT_ACCEPT_BUCKET`").
    pub fn begin(&self, session: MigrationSession) -> Result<(), u32> {
        let mut guard = self.session.write();
        if let Some(existing) = guard.as_ref() {
            return Err(existing.bucket_index);
        }
        *guard = Some(session);
        Ok(())
    }

    /// Runs `f` against the current session, if any.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut MigrationSession) -> R) -> Option<R> {
        self.session.write().as_mut().map(f)
    }

    #[must_use]
    pub fn current_bucket(&self) -> Option<u32> {
        self.session.read().as_ref().map(|s| s.bucket_index)
    }

    #[must_use]
    pub fn peer_conn(&self) -> Option<ConnId> {
        self.session.read().as_ref().map(|s| s.peer_conn)
    }

    /// Clears the latch, unconditionally. Called on successful
    /// completion, rollback, or idle timeout (spec §4.5 failure paths).
    pub fn clear(&self) {
        *self.session.write() = None;
    }

    /// Clears the latch only if it belongs to the given peer connection
    /// -- used when a connection drops, so an unrelated session isn't
    /// accidentally cleared by a stale event.
    pub fn clear_if_peer(&self, conn_id: ConnId) -> bool {
        let mut guard = self.session.write();
        if guard.as_ref().is_some_and(|s| s.peer_conn == conn_id) {
            *guard = None;
            true
        } else {
            false
        }
    }
}

/// Shared handle used by the lifecycle loadlevel timer and the dispatch
/// handler.
pub type SharedMigrationController = Arc<MigrationController>;

/// The node most recently involved in a transfer, per bucket, used by
/// the decision procedure's tie-break (spec §4.4). Bucket-level state
/// (`last_bucket`) already lives on [`crate::bucket::Bucket`]; this
/// helper just clears it after one decision round so the same bucket
/// isn't excluded forever.
pub fn clear_last_bucket_flag(bucket_table: &crate::bucket::BucketTable, index: u32) {
    bucket_table.with_mut(index, |b| b.last_bucket = false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_rejects_a_second_session_while_one_is_active() {
        let controller = MigrationController::new();
        let session = MigrationSession::new_source(1, 0x0F, 2, 10, SourceKind::PrimaryNoBackup);
        controller.begin(session).unwrap();

        let other = MigrationSession::new_source(2, 0x0F, 3, 11, SourceKind::PrimaryNoBackup);
        assert_eq!(controller.begin(other), Err(1));
    }

    #[test]
    fn clear_if_peer_only_clears_matching_session() {
        let controller = MigrationController::new();
        controller.begin(MigrationSession::new_source(1, 0x0F, 2, 10, SourceKind::PrimaryNoBackup)).unwrap();

        assert!(!controller.clear_if_peer(99));
        assert!(controller.is_active());
        assert!(controller.clear_if_peer(10));
        assert!(!controller.is_active());
    }

    #[test]
    fn node_id_and_conn_id_types_are_distinct_integers() {
        let _n: NodeId = 1;
        let _c: ConnId = 1;
    }
}
