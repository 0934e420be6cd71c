//! Request dispatch: turns one decoded [`Message`] into zero or one
//! reply, against the shared bucket/hashmask/node/connection state
//! (spec §4, §5, §6, §7).
//!
//! A plain `match`-based async function rather than a `tower::Service`
//! pipeline -- there is exactly one request in flight per connection at
//! a time (spec §5), so there is no router/middleware stack to
//! generalize.

mod codec;
mod message;

pub use codec::{encode_frame, Frame, FrameCodec, MAX_PAYLOAD_LEN};
pub use message::Message;

use std::sync::Arc;

use opencluster_core::{bucket_index as route_bucket_index, fnv1a_hash_str, ConnInfo, Item, Value};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::bucket::{Bucket, BucketLevel, BucketTable};
use crate::connection::{ConnectionRegistry, OutboundMessage};
use crate::error::DispatchError;
use crate::hashmask::{HashmaskEntry, HashmaskTable};
use crate::ids::{ConnId, NodeId, LOCAL_NODE_ID};
use crate::migration::{decide, MigrationAction, MigrationController, MigrationSession, PendingSend, SourceKind};
use crate::node::{LoadLevel, NodeHandle, NodeRegistry};

/// Everything a dispatch call needs, shared across every connection.
/// Cloning is cheap (every field is an `Arc`); one `Dispatcher` is
/// constructed at startup and handed to every connection task.
#[derive(Clone)]
pub struct Dispatcher {
    pub local_conninfo: ConnInfo,
    pub local_secret: Arc<Vec<u8>>,
    pub buckets: Arc<BucketTable>,
    pub hashmask: Arc<HashmaskTable>,
    pub nodes: Arc<NodeRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub migration: Arc<MigrationController>,
}

impl Dispatcher {
    /// Handles one request, returning the reply to send back (if any).
    /// `conn_id`/`peer_node` identify the connection the request arrived
    /// on, needed for handshake bookkeeping and migration session
    /// lookups.
    pub fn handle(&self, conn_id: ConnId, peer_node: Option<NodeId>, msg: Message) -> Option<Message> {
        match msg {
            Message::Hello => Some(Message::Ack),
            Message::Ping => Some(Message::Ack),
            Message::ShuttingDown => {
                if let Some(node) = peer_node.and_then(|id| self.nodes.get(id)) {
                    node.set_conn_id(None);
                }
                None
            }
            Message::ServerHello { conninfo, secret } => Some(self.handle_server_hello(conn_id, &conninfo, &secret)),
            Message::Hashmask { mask, index, level } => {
                self.apply_hashmask(index, level, peer_node);
                let _ = mask; // the hashmask table is not itself masked; only bucket indices are.
                Some(Message::Ack)
            }
            Message::Loadlevels => Some(self.local_loadlevel_reply()),
            Message::LoadlevelsReply { primary, secondary, transferring } => {
                self.record_loadlevel(peer_node, primary, secondary, transferring);
                None
            }
            Message::AcceptBucket { mask, index } => Some(self.handle_accept_bucket(conn_id, peer_node, mask, index)),
            Message::CantAcceptBucket | Message::AcceptingBucket => {
                self.handle_accept_reply(conn_id, matches!(msg, Message::AcceptingBucket));
                None
            }
            Message::ControlBucket { mask, index, level, peer_conninfo } => {
                Some(self.handle_control_bucket(mask, index, level, &peer_conninfo))
            }
            Message::ControlBucketComplete { index, .. } | Message::ControlBucketFailed { index, .. } => {
                self.handle_control_reply(index, matches!(msg, Message::ControlBucketComplete { .. }));
                None
            }
            Message::FinaliseMigration { mask, index, level, conninfo } => {
                Some(self.handle_finalise_migration(mask, index, level, &conninfo))
            }
            Message::SetInt { map, key, expires, value, .. } => {
                Some(self.handle_set(map, key, expires, Value::Int(value)))
            }
            Message::SetStr { map, key, expires, value, .. } => {
                Some(self.handle_set(map, key, expires, Value::String(value)))
            }
            Message::GetInt { map, key } => Some(self.handle_get(map, key, true)),
            Message::GetStr { map, key } => Some(self.handle_get(map, key, false)),
            Message::SyncInt { map, key, expires, value } => {
                Some(self.handle_sync(map, key, expires, Value::Int(value)))
            }
            Message::SyncString { map, key, expires, value } => {
                Some(self.handle_sync(map, key, expires, Value::String(value)))
            }
            Message::SyncKeyValue { key, expires, label } => Some(self.handle_sync_keyvalue(key, expires, label)),
            Message::Ack => {
                self.on_stream_ack(conn_id);
                None
            }
            Message::Fail | Message::DataInt { .. } | Message::DataStr { .. } | Message::Redirect { .. } => None,
            Message::Unknown { code } => {
                warn!(code, "unrecognized command");
                Some(Message::Fail)
            }
        }
    }

    /// `SERVERHELLO` is sent by both sides of a new peer connection, not
    /// request/reply (spec §4.8) -- there is no distinct reply command
    /// code for it. The first `SERVERHELLO` seen on a connection answers
    /// with our own; a second one (the peer's reply to *that*) only
    /// needs to finish the handshake, or every exchange would echo
    /// forever.
    fn handle_server_hello(&self, conn_id: ConnId, conninfo_json: &str, secret: &[u8]) -> Message {
        // Constant-time: a length or byte-timing leak here would let a
        // remote peer brute-force the cluster's shared secret.
        let matches = secret.len() == self.local_secret.len()
            && bool::from(secret.ct_eq(self.local_secret.as_slice()));
        if !matches {
            debug!(conn_id, "peer handshake rejected: secret mismatch");
            return Message::Fail;
        }
        let Ok(peer_info) = opencluster_core::ConnInfo::parse(conninfo_json) else {
            return Message::Fail;
        };
        let node = self.nodes.register(peer_info);
        node.set_conn_id(Some(conn_id));
        node.set_state(crate::node::NodeState::Ready);

        let already_greeted = self.connections.get(conn_id).is_some_and(|handle| {
            handle.metadata.try_write().map_or(true, |mut meta| std::mem::replace(&mut meta.authenticated, true))
        });
        if already_greeted {
            return Message::Ack;
        }
        Message::ServerHello {
            conninfo: self.local_conninfo.normalized(),
            secret: self.local_secret.as_ref().clone(),
        }
    }

    fn apply_hashmask(&self, index: u64, level: i32, source: Option<NodeId>) {
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        let Some(level) = BucketLevel::from_wire_value(level) else { return };
        let Some(name) = source.and_then(|id| self.nodes.get(id)).map(|n| n.conninfo.normalized()) else { return };
        match level {
            BucketLevel::Primary => self.hashmask.set_primary(index, Some(name)),
            BucketLevel::Secondary => self.hashmask.set_secondary(index, Some(name)),
            BucketLevel::Absent => {}
        }
    }

    fn local_loadlevel_reply(&self) -> Message {
        Message::LoadlevelsReply {
            #[allow(clippy::cast_possible_wrap)]
            primary: self.buckets.primary_count(LOCAL_NODE_ID) as i32,
            #[allow(clippy::cast_possible_wrap)]
            secondary: self.buckets.secondary_count(LOCAL_NODE_ID) as i32,
            transferring: i32::from(self.buckets.bucket_transfer_active()),
        }
    }

    fn record_loadlevel(&self, peer_node: Option<NodeId>, primary: i32, secondary: i32, transferring: i32) {
        let Some(node) = peer_node.and_then(|id| self.nodes.get(id)) else { return };
        node.record_loadlevel(LoadLevel {
            primary_count: primary.try_into().unwrap_or(0),
            secondary_count: secondary.try_into().unwrap_or(0),
            transferring: transferring != 0,
        });
        self.try_migrate(peer_node);
    }

    /// Runs the spec §4.4 decision procedure against the peer whose
    /// loadlevel was just updated, and begins executing whatever action
    /// it selects (spec §4.3 "on receipt... runs the migration decision
    /// procedure").
    fn try_migrate(&self, peer_node: Option<NodeId>) {
        let Some(peer_node) = peer_node else { return };
        if self.migration.is_active() {
            return;
        }
        let Some(peer) = self.nodes.get(peer_node) else { return };
        if !peer.state().is_ready() {
            return;
        }
        let target = peer.loadlevel();
        let node_count = self.nodes.active_node_count();
        let mask = self.buckets.mask();
        let action = decide(&self.buckets, LOCAL_NODE_ID, peer_node, target, mask, node_count, |node_id| {
            self.nodes.get(node_id).map_or(0, |n| n.loadlevel().total())
        });
        match action {
            Some(MigrationAction::Switch { bucket_index }) => self.begin_switch(bucket_index, peer_node, &peer),
            Some(MigrationAction::Stream { bucket_index }) => self.begin_stream(bucket_index, peer_node, &peer),
            None => {}
        }
    }

    /// Spec §4.4 rule 1 / §4.6: ask `peer` to promote its secondary copy
    /// of `bucket_index` to primary. No data moves, so the session jumps
    /// straight to `Finalizing`.
    fn begin_switch(&self, bucket_index: u32, peer_node: NodeId, peer: &NodeHandle) {
        let Some(conn_id) = peer.conn_id() else { return };
        let Some(handle) = self.connections.get(conn_id) else { return };
        let mut session = MigrationSession::new_source(bucket_index, self.buckets.mask(), peer_node, conn_id, SourceKind::Switch);
        session.begin_finalizing();
        if self.migration.begin(session).is_err() {
            return;
        }
        self.buckets.with_mut(bucket_index, |b| b.promoting = true);
        let message = Message::ControlBucket {
            mask: self.buckets.mask(),
            index: u64::from(bucket_index),
            level: BucketLevel::Primary.wire_value(),
            peer_conninfo: self.local_conninfo.normalized(),
        };
        if !handle.try_send(OutboundMessage::Frame(encode_frame(message.into_request_frame(0)))) {
            self.migration.clear();
            self.buckets.with_mut(bucket_index, |b| b.promoting = false);
        }
    }

    /// Spec §4.4 rule 2/3: offer `bucket_index` to `peer` via
    /// `ACCEPT_BUCKET`. Streaming begins once the peer replies
    /// `ACCEPTING_BUCKET` (see [`Self::handle_accept_reply`]).
    fn begin_stream(&self, bucket_index: u32, peer_node: NodeId, peer: &NodeHandle) {
        let Some(conn_id) = peer.conn_id() else { return };
        let Some(handle) = self.connections.get(conn_id) else { return };
        let source_kind = match self.buckets.get(bucket_index).and_then(|b| b.backup_node) {
            Some(previous_backup) => SourceKind::PrimaryWithBackup { previous_backup },
            None => SourceKind::PrimaryNoBackup,
        };
        let session = MigrationSession::new_source(bucket_index, self.buckets.mask(), peer_node, conn_id, source_kind);
        if self.migration.begin(session).is_err() {
            return;
        }
        self.buckets.with_mut(bucket_index, |b| b.transfer_client = Some(conn_id));
        let message = Message::AcceptBucket { mask: self.buckets.mask(), index: u64::from(bucket_index) };
        if !handle.try_send(OutboundMessage::Frame(encode_frame(message.into_request_frame(0)))) {
            self.migration.clear();
            self.buckets.with_mut(bucket_index, |b| b.transfer_client = None);
        }
    }

    /// Target side of `ACCEPT_BUCKET` (spec §4.5): latch a migration
    /// session for this bucket unless one is already active, and create
    /// the bucket locally at `level=-1` so arriving `SYNC_*` messages
    /// have somewhere to land.
    fn handle_accept_bucket(&self, conn_id: ConnId, peer_node: Option<NodeId>, mask: u64, index: u64) -> Message {
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        let Some(peer) = peer_node else { return Message::CantAcceptBucket };
        if self.buckets.mask() != mask {
            return Message::CantAcceptBucket;
        }
        let session = MigrationSession::new_target(index, mask, peer, conn_id);
        if self.migration.begin(session).is_err() {
            return Message::CantAcceptBucket;
        }
        self.buckets.insert(Bucket {
            level: BucketLevel::Absent,
            primary_node: Some(peer),
            transfer_client: Some(conn_id),
            ..Bucket::new_local_primary(index, LOCAL_NODE_ID)
        });
        Message::AcceptingBucket
    }

    /// Source side: the target accepted or refused our `ACCEPT_BUCKET`.
    /// On acceptance, loads the bucket's current contents and starts
    /// streaming (spec §4.5 `STREAMING`).
    fn handle_accept_reply(&self, conn_id: ConnId, accepted: bool) {
        if !accepted {
            self.migration.clear();
            return;
        }
        self.migration.with_session(MigrationSession::on_accepting);
        let Some(bucket_index) = self.migration.current_bucket() else { return };
        let Some(bucket) = self.buckets.get(bucket_index) else { return };
        let items: Vec<(u64, u64)> = bucket
            .data
            .snapshot()
            .into_iter()
            .filter(|(_, _, item)| !item.value.is_deleted())
            .map(|(key_hash, map_hash, _)| (key_hash, map_hash))
            .collect();
        let labels = bucket.data.label_snapshot();
        drop(bucket);
        self.migration.with_session(|s| s.load_snapshot(items, labels));
        if self.pump_stream(conn_id) {
            self.begin_finalize(conn_id);
        }
    }

    /// Source: pushes as many queued items/labels as the sliding window
    /// currently allows (spec §4.5). Returns `true` once both the window
    /// and the backlog are empty.
    fn pump_stream(&self, conn_id: ConnId) -> bool {
        let Some(bucket_index) = self.migration.current_bucket() else { return true };
        let Some(bucket) = self.buckets.get(bucket_index) else { return true };
        let Some(handle) = self.connections.get(conn_id) else { return true };
        while let Some(next) = self.migration.with_session(MigrationSession::pump).flatten() {
            let message = match &next {
                PendingSend::Item { key_hash, map_hash } => {
                    bucket.data.get(*key_hash, *map_hash).and_then(|item| sync_message_for(*map_hash, *key_hash, &item))
                }
                PendingSend::Label { key_hash, label } => Some(Message::SyncKeyValue { key: *key_hash, expires: 0, label: label.clone() }),
            };
            match message {
                Some(message) => {
                    if !handle.try_send(OutboundMessage::Frame(encode_frame(message.into_request_frame(0)))) {
                        break;
                    }
                }
                None => {
                    // Vanished or was deleted since the snapshot was
                    // taken; nothing to ship, free its window slot.
                    self.migration.with_session(MigrationSession::on_item_ack);
                }
            }
        }
        self.migration.with_session(MigrationSession::is_fully_drained).unwrap_or(true)
    }

    /// Source: an item/label was acknowledged. Sends the next queued one
    /// if the window has room, or moves to `Finalizing` once the backlog
    /// is drained (spec §4.5).
    fn on_stream_ack(&self, conn_id: ConnId) {
        if self.migration.peer_conn() != Some(conn_id) {
            return;
        }
        let acked = self.migration.with_session(MigrationSession::on_item_ack).unwrap_or(false);
        if !acked {
            return;
        }
        if !self.pump_stream(conn_id) {
            return;
        }
        self.begin_finalize(conn_id);
    }

    /// Source: the backlog is drained; ask the target to take over as
    /// primary (spec §4.5 `FINALIZING`).
    fn begin_finalize(&self, conn_id: ConnId) {
        let Some(bucket_index) = self.migration.current_bucket() else { return };
        let Some(handle) = self.connections.get(conn_id) else { return };
        self.migration.with_session(MigrationSession::begin_finalizing);
        let message = Message::ControlBucket {
            mask: self.buckets.mask(),
            index: u64::from(bucket_index),
            level: BucketLevel::Primary.wire_value(),
            peer_conninfo: self.local_conninfo.normalized(),
        };
        if !handle.try_send(OutboundMessage::Frame(encode_frame(message.into_request_frame(0)))) {
            self.migration.clear();
        }
    }

    /// Promotion/switch and migration finalization both travel over
    /// `CONTROL_BUCKET` (spec §4.6): flips which side is primary for
    /// `index` with no data movement.
    fn handle_control_bucket(&self, mask: u64, index: u64, level: i32, peer_conninfo: &str) -> Message {
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        let Some(new_level) = BucketLevel::from_wire_value(level) else { return Message::ControlBucketFailed { mask, index: u64::from(index) } };
        let Ok(peer_info) = opencluster_core::ConnInfo::parse(peer_conninfo) else {
            return Message::ControlBucketFailed { mask, index: u64::from(index) };
        };
        let peer = self.nodes.register(peer_info);
        let applied = self.buckets.with_mut(index, |b| {
            b.level = new_level;
            b.last_bucket = true;
            match new_level {
                BucketLevel::Primary => {
                    b.primary_node = Some(LOCAL_NODE_ID);
                    b.secondary_node = Some(peer.id);
                    b.backup_node = Some(peer.id);
                }
                BucketLevel::Secondary => {
                    b.secondary_node = Some(LOCAL_NODE_ID);
                    b.primary_node = Some(peer.id);
                    b.source_node = Some(peer.id);
                }
                BucketLevel::Absent => {}
            }
            b.promoting = false;
        });
        if applied.is_some() {
            Message::ControlBucketComplete { mask, index: u64::from(index) }
        } else {
            Message::ControlBucketFailed { mask, index: u64::from(index) }
        }
    }

    fn handle_control_reply(&self, index: u64, completed: bool) {
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        if completed {
            self.apply_source_completion(index);
        } else {
            warn!(index, "control_bucket rejected by peer, rolling back");
            self.buckets.with_mut(index, |b| {
                b.promoting = false;
                b.transfer_client = None;
            });
        }
        self.migration.clear();
    }

    /// Spec §4.5 "On `CONTROL_BUCKET_COMPLETE`": what the source does
    /// with its own copy of the bucket differs by why it was migrating
    /// away (spec §4.4).
    fn apply_source_completion(&self, index: u32) {
        let Some(peer) = self.migration.with_session(|s| s.peer) else { return };
        let Some(kind) = self.migration.with_session(|s| s.source_kind).flatten() else { return };
        match kind {
            SourceKind::Switch | SourceKind::PrimaryNoBackup => {
                // The source keeps the bucket but demotes to secondary,
                // backed by the node it just promoted (spec §4.5, §4.6).
                self.buckets.with_mut(index, |b| {
                    b.level = BucketLevel::Secondary;
                    b.primary_node = Some(peer);
                    b.secondary_node = Some(LOCAL_NODE_ID);
                    b.source_node = Some(peer);
                    b.backup_node = None;
                    b.transfer_client = None;
                    b.promoting = false;
                    b.last_bucket = true;
                });
            }
            SourceKind::PrimaryWithBackup { previous_backup } => {
                // A backup already exists elsewhere; the source has no
                // further use for its own copy.
                self.buckets.with_mut(index, |b| {
                    b.level = BucketLevel::Absent;
                    b.primary_node = None;
                    b.secondary_node = None;
                    b.backup_node = None;
                    b.source_node = None;
                    b.transfer_client = None;
                    b.promoting = false;
                    b.last_bucket = true;
                });
                self.notify_new_primary(previous_backup, index, peer);
            }
            SourceKind::Secondary { primary } => {
                self.buckets.with_mut(index, |b| {
                    b.level = BucketLevel::Absent;
                    b.primary_node = None;
                    b.secondary_node = None;
                    b.backup_node = None;
                    b.source_node = None;
                    b.transfer_client = None;
                    b.promoting = false;
                    b.last_bucket = true;
                });
                let _ = primary;
            }
        }
    }

    /// Tells `previous_backup` that `new_primary` now owns `index`, so it
    /// re-points itself as that node's secondary (spec §4.5 "the source
    /// notifies the previous backup node of the new primary").
    fn notify_new_primary(&self, previous_backup: NodeId, index: u32, new_primary: NodeId) {
        let Some(backup_node) = self.nodes.get(previous_backup) else { return };
        let Some(conn_id) = backup_node.conn_id() else { return };
        let Some(handle) = self.connections.get(conn_id) else { return };
        let Some(primary_conninfo) = self.nodes.get(new_primary).map(|n| n.conninfo.normalized()) else { return };
        let message = Message::FinaliseMigration {
            mask: self.buckets.mask(),
            index: u64::from(index),
            level: BucketLevel::Secondary.wire_value(),
            conninfo: primary_conninfo,
        };
        let _ = handle.try_send(OutboundMessage::Frame(encode_frame(message.into_request_frame(0))));
    }

    /// Final step of a bucket hand-off (spec §4.5): the target takes
    /// over as the given level and the source relinquishes the bucket
    /// entirely.
    fn handle_finalise_migration(&self, mask: u64, index: u64, level: i32, conninfo: &str) -> Message {
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        let Some(new_level) = BucketLevel::from_wire_value(level) else { return Message::Fail };
        let Ok(source_info) = opencluster_core::ConnInfo::parse(conninfo) else { return Message::Fail };
        let source = self.nodes.register(source_info);
        self.buckets.with_mut(index, |b| {
            b.level = new_level;
            b.transfer_client = None;
            match new_level {
                BucketLevel::Primary => {
                    b.primary_node = Some(LOCAL_NODE_ID);
                    b.source_node = None;
                }
                BucketLevel::Secondary => {
                    b.secondary_node = Some(LOCAL_NODE_ID);
                    b.source_node = Some(source.id);
                }
                BucketLevel::Absent => {}
            }
        });
        self.migration.clear();
        let _ = mask;
        Message::Ack
    }

    fn handle_set(&self, map: u64, key: u64, expires: i32, value: Value) -> Message {
        let index = self.buckets.index_for(key);
        let Some(bucket) = self.buckets.get(index) else { return Message::Fail };
        if bucket.level != BucketLevel::Primary || bucket.primary_node != Some(LOCAL_NODE_ID) {
            drop(bucket);
            return self.redirect_or_fail(index, map, key);
        }
        bucket.data.set(key, map, Item::new(key, map, value, expires));
        Message::Ack
    }

    fn handle_get(&self, map: u64, key: u64, as_int: bool) -> Message {
        let index = self.buckets.index_for(key);
        let Some(bucket) = self.buckets.get(index) else { return self.redirect_or_fail(index, map, key) };
        if bucket.level != BucketLevel::Primary || bucket.primary_node != Some(LOCAL_NODE_ID) {
            drop(bucket);
            return self.redirect_or_fail(index, map, key);
        }
        let Some(item) = bucket.data.get(key, map) else { return Message::Fail };
        if item.value.is_deleted() {
            return Message::Fail;
        }
        match (as_int, item.value) {
            (true, Value::Int(v) | Value::Short(v)) => Message::DataInt { map, key, value: v },
            (false, Value::String(v)) => Message::DataStr { map, key, value: v },
            _ => Message::Fail,
        }
    }

    /// Spec §4.7/§7 "routing error": a `GET`/`SET` addressed a bucket
    /// this node does not hold at `level=0` replies with a redirect
    /// naming the known primary's conninfo from the hashmask table, or a
    /// generic failure if no owner is known yet and the client must
    /// retry later.
    fn redirect_or_fail(&self, index: u32, map: u64, key: u64) -> Message {
        let entry = self.hashmask.get(index);
        match entry.primary_name {
            Some(conninfo) => Message::Redirect { map, key, conninfo },
            None => Message::Fail,
        }
    }

    /// `SYNC_*` (spec §4.5): the source streaming one item during an
    /// active migration. Applied unconditionally to the local bucket
    /// store -- ownership is established by the `ACCEPT_BUCKET`
    /// handshake that preceded this, not re-checked per item.
    /// Target side: applies the item unconditionally. The acknowledgment
    /// this returns travels back to the source as a plain `Message::Ack`,
    /// which is what actually advances the source's streaming window
    /// (see [`Self::on_stream_ack`]) -- there is no session to update
    /// here since only the source tracks the in-flight window.
    fn handle_sync(&self, map: u64, key: u64, expires: i32, value: Value) -> Message {
        let index = self.buckets.index_for(key);
        if let Some(bucket) = self.buckets.get(index) {
            bucket.data.set(key, map, Item::new(key, map, value, expires));
        }
        Message::Ack
    }

    fn handle_sync_keyvalue(&self, key: u64, expires: i32, label: Vec<u8>) -> Message {
        let index = self.buckets.index_for(key);
        if let Some(bucket) = self.buckets.get(index) {
            bucket.data.set_label(key, label);
        }
        let _ = expires;
        Message::Ack
    }
}

/// The `SYNC_*` message that carries one stored item, or `None` if the
/// item has no wire representation (a tombstone, or the storage-only
/// `Long` tag -- spec §6 only defines `SYNC_INT`/`SYNC_STRING`).
fn sync_message_for(map_hash: u64, key_hash: u64, item: &Item) -> Option<Message> {
    #[allow(clippy::cast_possible_wrap)]
    let expires = item.expires as i32;
    match &item.value {
        Value::Int(v) | Value::Short(v) => Some(Message::SyncInt { map: map_hash, key: key_hash, expires, value: *v }),
        Value::String(v) => Some(Message::SyncString { map: map_hash, key: key_hash, expires, value: v.clone() }),
        Value::Long(_) | Value::Deleted => None,
    }
}

/// Convenience used by connection tasks and tests: hashes a string key
/// the same way a client would, for routing without a pre-hashed id.
#[must_use]
pub fn hash_key(key: &str) -> u64 {
    fnv1a_hash_str(key)
}

/// Exposed for tests that need to compute a bucket index the same way
/// [`BucketTable::index_for`] does, without constructing a full table.
#[must_use]
pub fn bucket_index_for(key_hash: u64, mask: u64) -> u64 {
    route_bucket_index(key_hash, mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use opencluster_core::ConnInfo;

    fn dispatcher() -> Dispatcher {
        Dispatcher {
            local_conninfo: ConnInfo::new("local", "127.0.0.1", Some(31336)),
            local_secret: Arc::new(b"sekret".to_vec()),
            buckets: Arc::new(BucketTable::founder(LOCAL_NODE_ID)),
            hashmask: Arc::new(HashmaskTable::new()),
            nodes: Arc::new(NodeRegistry::new()),
            connections: Arc::new(ConnectionRegistry::new()),
            migration: Arc::new(MigrationController::new()),
        }
    }

    #[test]
    fn ping_replies_ack() {
        let d = dispatcher();
        assert_eq!(d.handle(1, None, Message::Ping), Some(Message::Ack));
    }

    #[test]
    fn server_hello_with_wrong_secret_fails() {
        let d = dispatcher();
        let (handle, _rx) = d.connections.register(crate::connection::ConnectionKind::Peer, 8);
        let reply = d.handle(handle.id, None, Message::ServerHello { conninfo: ConnInfo::new("peer", "127.0.0.1", Some(1)).normalized(), secret: b"wrong".to_vec() });
        assert_eq!(reply, Some(Message::Fail));
    }

    #[test]
    fn server_hello_replies_once_then_only_acks() {
        let d = dispatcher();
        let (handle, _rx) = d.connections.register(crate::connection::ConnectionKind::Peer, 8);
        let hello = Message::ServerHello { conninfo: ConnInfo::new("peer", "127.0.0.1", Some(1)).normalized(), secret: b"sekret".to_vec() };

        let first = d.handle(handle.id, None, hello.clone());
        assert!(matches!(first, Some(Message::ServerHello { .. })));

        let second = d.handle(handle.id, None, hello);
        assert_eq!(second, Some(Message::Ack));
    }

    #[test]
    fn set_then_get_round_trips_through_dispatch() {
        let d = dispatcher();
        let reply = d.handle(1, None, Message::SetInt { map: 5, key: 5, expires: 0, fullwait: 0, label: vec![], value: 42 });
        assert_eq!(reply, Some(Message::Ack));

        let reply = d.handle(1, None, Message::GetInt { map: 5, key: 5 });
        assert_eq!(reply, Some(Message::DataInt { map: 5, key: 5, value: 42 }));
    }

    #[test]
    fn get_on_empty_key_fails() {
        let d = dispatcher();
        assert_eq!(d.handle(1, None, Message::GetInt { map: 5, key: 5 }), Some(Message::Fail));
    }

    #[test]
    fn set_is_rejected_when_bucket_is_not_owned_as_primary() {
        let d = dispatcher();
        d.buckets.with_mut(0, |b| b.primary_node = Some(99));
        let reply = d.handle(1, None, Message::SetInt { map: 0, key: 0, expires: 0, fullwait: 0, label: vec![], value: 1 });
        assert_eq!(reply, Some(Message::Fail));
    }

    #[test]
    fn set_and_get_route_by_key_hash_not_map_hash() {
        let d = dispatcher();
        let reply = d.handle(1, None, Message::SetInt { map: 9, key: 5, expires: 0, fullwait: 0, label: vec![], value: 7 });
        assert_eq!(reply, Some(Message::Ack));

        // Filed under key 5's bucket and key_hash, not map 9's.
        let item = d.buckets.get(5).unwrap().data.get(5, 9).unwrap();
        assert_eq!(item.value, Value::Int(7));
        assert!(d.buckets.get(9).unwrap().data.get(5, 9).is_none());

        let reply = d.handle(1, None, Message::GetInt { map: 9, key: 5 });
        assert_eq!(reply, Some(Message::DataInt { map: 9, key: 5, value: 7 }));
    }

    #[test]
    fn item_and_keyvalue_label_share_the_same_key_hashed_maplist() {
        let d = dispatcher();
        assert_eq!(d.handle(1, None, Message::SetInt { map: 9, key: 5, expires: 0, fullwait: 0, label: vec![], value: 1 }), Some(Message::Ack));
        assert_eq!(d.handle(1, None, Message::SyncKeyValue { key: 5, expires: 0, label: b"client".to_vec() }), Some(Message::Ack));

        let bucket = d.buckets.get(5).unwrap();
        assert!(bucket.data.get(5, 9).is_some());
        assert_eq!(bucket.data.label(5), Some(b"client".to_vec()));
    }

    #[test]
    fn get_on_a_bucket_owned_elsewhere_redirects_to_the_known_primary() {
        let d = dispatcher();
        d.buckets.with_mut(5, |b| b.primary_node = Some(99));
        d.hashmask.set_primary(5, Some("peer:127.0.0.1:1".to_string()));

        let reply = d.handle(1, None, Message::GetInt { map: 9, key: 5 });
        assert_eq!(reply, Some(Message::Redirect { map: 9, key: 5, conninfo: "peer:127.0.0.1:1".to_string() }));
    }

    #[test]
    fn get_on_a_bucket_with_unknown_owner_fails_generically() {
        let d = dispatcher();
        d.buckets.with_mut(5, |b| b.primary_node = Some(99));

        let reply = d.handle(1, None, Message::GetInt { map: 9, key: 5 });
        assert_eq!(reply, Some(Message::Fail));
    }

    #[test]
    fn loadlevels_reports_local_counts() {
        let d = dispatcher();
        let reply = d.handle(1, None, Message::Loadlevels);
        let Some(Message::LoadlevelsReply { primary, secondary, transferring }) = reply else { panic!("wrong reply") };
        assert_eq!(primary, i32::try_from(d.buckets.len()).unwrap());
        assert_eq!(secondary, 0);
        assert_eq!(transferring, 0);
    }

    #[test]
    fn unknown_command_replies_fail() {
        let d = dispatcher();
        assert_eq!(d.handle(1, None, Message::Unknown { code: 12345 }), Some(Message::Fail));
    }

    /// Registers a `Ready` peer with its own connection, returning the
    /// peer's `NodeId` and the outbound receiver so a test can inspect
    /// what dispatch sends it.
    fn ready_peer(d: &Dispatcher) -> (NodeId, tokio::sync::mpsc::Receiver<crate::connection::OutboundMessage>) {
        let peer = d.nodes.register(ConnInfo::new("peer", "127.0.0.1", Some(1)));
        let (handle, rx) = d.connections.register(crate::connection::ConnectionKind::Peer, 8);
        peer.set_conn_id(Some(handle.id));
        peer.set_state(crate::node::NodeState::Ready);
        (peer.id, rx)
    }

    fn recv_message(rx: &mut tokio::sync::mpsc::Receiver<crate::connection::OutboundMessage>) -> Message {
        let crate::connection::OutboundMessage::Frame(bytes) = rx.try_recv().expect("expected an outbound frame") else {
            panic!("expected a frame, got a close")
        };
        let header = opencluster_core::Header::decode(&bytes[..opencluster_core::HEADER_LEN]).unwrap();
        Message::decode(&header, &bytes[opencluster_core::HEADER_LEN..]).unwrap()
    }

    #[test]
    fn record_loadlevel_streams_a_no_backup_bucket_to_an_empty_peer() {
        let d = dispatcher(); // founder: 16 local no-backup primaries
        let (peer_id, mut rx) = ready_peer(&d);

        d.record_loadlevel(Some(peer_id), 0, 0, 0);

        assert!(d.migration.is_active());
        assert_eq!(d.migration.current_bucket(), Some(0));
        let bucket = d.buckets.get(0).unwrap();
        assert!(bucket.is_transferring());
        drop(bucket);
        assert_eq!(recv_message(&mut rx), Message::AcceptBucket { mask: d.buckets.mask(), index: 0 });
    }

    #[test]
    fn accepting_bucket_streams_its_contents_then_finalizes() {
        let d = dispatcher();
        let (peer_id, mut rx) = ready_peer(&d);
        d.buckets.get(0).unwrap().data.set(1, 1, Item::new(1, 1, Value::Int(42), 0));

        d.record_loadlevel(Some(peer_id), 0, 0, 0);
        let accept_bucket_index = match recv_message(&mut rx) {
            Message::AcceptBucket { index, .. } => index,
            other => panic!("expected ACCEPT_BUCKET, got {other:?}"),
        };
        #[allow(clippy::cast_possible_truncation)]
        let accept_bucket_index = accept_bucket_index as u32;

        let conn_id = d.migration.peer_conn().unwrap();
        assert!(d.handle(conn_id, Some(peer_id), Message::AcceptingBucket).is_none());

        assert_eq!(recv_message(&mut rx), Message::SyncInt { map: 1, key: 1, expires: 0, value: 42 });

        // Acking the item drains the window, so dispatch moves straight
        // to CONTROL_BUCKET without waiting for another tick.
        assert!(d.handle(conn_id, Some(peer_id), Message::Ack).is_none());
        assert_eq!(
            recv_message(&mut rx),
            Message::ControlBucket {
                mask: d.buckets.mask(),
                index: u64::from(accept_bucket_index),
                level: BucketLevel::Primary.wire_value(),
                peer_conninfo: d.local_conninfo.normalized(),
            }
        );
    }

    #[test]
    fn control_bucket_complete_demotes_a_no_backup_source_to_secondary() {
        let d = dispatcher();
        let peer = d.nodes.register(ConnInfo::new("peer", "127.0.0.1", Some(1)));
        let conn_id = 7;
        let session = MigrationSession::new_source(0, d.buckets.mask(), peer.id, conn_id, SourceKind::PrimaryNoBackup);
        d.migration.begin(session).unwrap();

        assert!(d.handle(conn_id, Some(peer.id), Message::ControlBucketComplete { mask: d.buckets.mask(), index: 0 }).is_none());

        assert!(!d.migration.is_active());
        let bucket = d.buckets.get(0).unwrap();
        assert_eq!(bucket.level, BucketLevel::Secondary);
        assert_eq!(bucket.primary_node, Some(peer.id));
        assert_eq!(bucket.secondary_node, Some(LOCAL_NODE_ID));
    }
}
