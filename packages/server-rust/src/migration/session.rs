//! The migration protocol state machine (spec §4.5) and promotion/switch
//! (spec §4.6).
//!
//! Original to this crate; no teacher analog exists for a streaming
//! hand-off protocol. Grounded structurally on `cluster/traits.rs`'s
//! `MigrationService` trait boundary (a narrow, explicit set of
//! lifecycle calls) rather than its `ClusterPartitionTable`
//! implementation, which is CRDT/MsgPack-specific.

use std::collections::VecDeque;

use opencluster_core::TRANSIT_MAX;

use crate::ids::{ConnId, NodeId};

/// Which side of a migration this node is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Target,
}

/// One item or label queued to stream but not yet acknowledged (spec
/// §4.5's sliding window, bounded by [`TRANSIT_MAX`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingSend {
    Item { key_hash: u64, map_hash: u64 },
    Label { key_hash: u64, label: Vec<u8> },
}

/// Phase of an in-flight migration, source and target side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Source: `ACCEPT_BUCKET` sent, waiting for `ACCEPTING_BUCKET` or
    /// `CANT_ACCEPT_BUCKET`.
    AwaitingAccept,
    /// Target: accepted, bucket created at `level=-1`, waiting for the
    /// source to begin streaming.
    Accepted,
    /// Source: streaming items, with up to [`TRANSIT_MAX`] outstanding
    /// unacknowledged.
    Streaming { window: VecDeque<PendingSend> },
    /// Source: all items acknowledged, `CONTROL_BUCKET` sent, waiting
    /// for `CONTROL_BUCKET_COMPLETE`/`FAILED`.
    Finalizing,
    /// Done; the session is retained only long enough for the caller to
    /// read the final outcome before being cleared.
    Done,
}

/// Why a bucket was being migrated, needed to pick the right
/// source-side cleanup on completion (spec §4.5 "On
/// `CONTROL_BUCKET_COMPLETE`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A primary with no existing backup.
    PrimaryNoBackup,
    /// A primary that already had a backup elsewhere.
    PrimaryWithBackup { previous_backup: NodeId },
    /// A secondary replica.
    Secondary { primary: NodeId },
    /// A pure promotion/switch (spec §4.6): no data moves, the source
    /// just demotes itself to secondary once the target flips its
    /// bucket to primary.
    Switch,
}

/// A single bucket migration in progress, from either side.
#[derive(Debug, Clone)]
pub struct MigrationSession {
    pub bucket_index: u32,
    pub mask: u64,
    pub peer: NodeId,
    pub peer_conn: ConnId,
    pub role: Role,
    pub state: SessionState,
    pub source_kind: Option<SourceKind>,
    /// Items/labels still waiting for window room, populated up front by
    /// [`Self::load_snapshot`] and drained by [`Self::pump`].
    pub queue: VecDeque<PendingSend>,
}

impl MigrationSession {
    #[must_use]
    pub fn new_source(bucket_index: u32, mask: u64, peer: NodeId, peer_conn: ConnId, source_kind: SourceKind) -> Self {
        Self {
            bucket_index,
            mask,
            peer,
            peer_conn,
            role: Role::Source,
            state: SessionState::AwaitingAccept,
            source_kind: Some(source_kind),
            queue: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn new_target(bucket_index: u32, mask: u64, peer: NodeId, peer_conn: ConnId) -> Self {
        Self {
            bucket_index,
            mask,
            peer,
            peer_conn,
            role: Role::Target,
            state: SessionState::Accepted,
            source_kind: None,
            queue: VecDeque::new(),
        }
    }

    /// Source: the peer accepted; move to streaming with an empty
    /// window.
    pub fn on_accepting(&mut self) {
        self.state = SessionState::Streaming { window: VecDeque::new() };
    }

    /// Source: loads the full set of items/labels to stream, queued
    /// behind the window, items first then labels.
    pub fn load_snapshot(&mut self, items: Vec<(u64, u64)>, labels: Vec<(u64, Vec<u8>)>) {
        self.queue.extend(items.into_iter().map(|(key_hash, map_hash)| PendingSend::Item { key_hash, map_hash }));
        self.queue.extend(labels.into_iter().map(|(key_hash, label)| PendingSend::Label { key_hash, label }));
    }

    /// Source: enqueues one item to stream, respecting [`TRANSIT_MAX`].
    /// Returns `false` if the window is already full -- the caller must
    /// wait for an ack before sending more (spec §4.5 backpressure).
    #[must_use]
    pub fn try_enqueue(&mut self, item: PendingSend) -> bool {
        let SessionState::Streaming { window } = &mut self.state else { return false };
        if window.len() as u32 >= TRANSIT_MAX {
            return false;
        }
        window.push_back(item);
        true
    }

    /// Source: pops one item off the queue into the window, if there is
    /// room and anything left to send. Returns the item moved, so the
    /// caller can encode and transmit it.
    pub fn pump(&mut self) -> Option<PendingSend> {
        if !matches!(&self.state, SessionState::Streaming { window } if (window.len() as u32) < TRANSIT_MAX) {
            return None;
        }
        let next = self.queue.pop_front()?;
        let enqueued = self.try_enqueue(next.clone());
        debug_assert!(enqueued);
        Some(next)
    }

    /// Source: an item was acknowledged. Returns `true` if it matched
    /// the oldest outstanding item.
    pub fn on_item_ack(&mut self) -> bool {
        let SessionState::Streaming { window } = &mut self.state else { return false };
        window.pop_front().is_some()
    }

    /// Source: `true` once the window is empty and streaming can move
    /// to finalizing.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        matches!(&self.state, SessionState::Streaming { window } if window.is_empty())
    }

    /// Source: `true` once both the pending queue and the in-flight
    /// window are empty -- every item has been sent and acknowledged.
    #[must_use]
    pub fn is_fully_drained(&self) -> bool {
        self.queue.is_empty() && self.is_drained()
    }

    pub fn begin_finalizing(&mut self) {
        self.state = SessionState::Finalizing;
    }

    pub fn finish(&mut self) {
        self.state = SessionState::Done;
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.state, SessionState::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_session_progresses_through_accept_stream_finalize() {
        let mut session = MigrationSession::new_source(3, 0x0F, 2, 10, SourceKind::PrimaryNoBackup);
        assert_eq!(session.state, SessionState::AwaitingAccept);

        session.on_accepting();
        assert!(session.try_enqueue(PendingSend::Item { key_hash: 1, map_hash: 1 }));
        assert!(!session.is_drained()); // not drained while holding one item

        assert!(session.on_item_ack());
        assert!(session.is_drained());

        session.begin_finalizing();
        assert_eq!(session.state, SessionState::Finalizing);

        session.finish();
        assert!(session.is_done());
    }

    #[test]
    fn window_respects_transit_max() {
        let mut session = MigrationSession::new_source(0, 0x0F, 2, 10, SourceKind::PrimaryNoBackup);
        session.on_accepting();
        assert!(session.try_enqueue(PendingSend::Item { key_hash: 1, map_hash: 1 }));
        // TRANSIT_MAX is 1 by default (spec §4.5): a second item must wait.
        assert!(!session.try_enqueue(PendingSend::Item { key_hash: 2, map_hash: 2 }));
    }

    #[test]
    fn target_session_starts_accepted() {
        let session = MigrationSession::new_target(5, 0x0F, 1, 4);
        assert_eq!(session.role, Role::Target);
        assert_eq!(session.state, SessionState::Accepted);
    }

    #[test]
    fn load_snapshot_then_pump_drains_items_then_labels() {
        let mut session = MigrationSession::new_source(0, 0x0F, 2, 10, SourceKind::PrimaryNoBackup);
        session.on_accepting();
        session.load_snapshot(vec![(1, 1), (2, 2)], vec![(1, b"label".to_vec())]);

        let first = session.pump();
        assert_eq!(first, Some(PendingSend::Item { key_hash: 1, map_hash: 1 }));
        // Window already has one outstanding item (TRANSIT_MAX == 1).
        assert!(session.pump().is_none());

        assert!(session.on_item_ack());
        let second = session.pump();
        assert_eq!(second, Some(PendingSend::Item { key_hash: 2, map_hash: 2 }));

        assert!(session.on_item_ack());
        let third = session.pump();
        assert_eq!(third, Some(PendingSend::Label { key_hash: 1, label: b"label".to_vec() }));

        assert!(!session.is_fully_drained()); // label still in window
        assert!(session.on_item_ack());
        assert!(session.is_fully_drained());
    }
}
