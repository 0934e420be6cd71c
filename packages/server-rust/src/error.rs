//! Server-level error taxonomy (spec §7).
//!
//! Two tiers, matching the teacher's `thiserror` + `anyhow` split: a
//! `thiserror` enum per protocol-facing boundary (`DispatchError`,
//! `MigrationError`) for errors a handler inspects and reacts to, and
//! `ServerError`/`anyhow::Error` at the outer edges (`main`, lifecycle
//! startup) for errors that are only ever logged and turned into an
//! exit code.

use thiserror::Error;

use crate::ids::NodeId;

/// Errors surfaced while decoding or routing a single frame (spec §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The frame's header or payload could not be parsed. The
    /// connection is closed immediately; a peer entry, if any, moves to
    /// `NodeState::Unknown` and enters wait-retry.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// An unrecognized command code. The connection replies `UNKNOWN`
    /// and stays open, allowing forward-compatible probing.
    #[error("unknown command code {0}")]
    UnknownCommand(u16),

    /// A `GET`/`SET` addressed a bucket this node does not hold at
    /// `level=0`. The canonical response is a redirect, not this error;
    /// callers that see this still own replying to the client.
    #[error("bucket {index} is not owned locally at the required level")]
    NotOwner { index: u32 },

    /// The client addressed a bucket index with no known owner in the
    /// local hashmask table.
    #[error("bucket {index} has no known owner")]
    UnknownOwner { index: u32 },
}

/// Errors surfaced by the migration protocol state machine (spec §4.5,
/// §7 "migration conflict").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// A second migration was attempted while `bucket_transfer` was
    /// already latched on this node.
    #[error("cannot accept bucket {index}: a transfer is already in progress")]
    CantAccept { index: u32 },

    /// The target already owns the requested bucket index.
    #[error("bucket {index} is already owned by the target")]
    AlreadyOwned { index: u32 },

    /// The requester's mask did not match the receiver's; the receiver
    /// must split before the transfer can proceed.
    #[error("mask mismatch: requester has {requester_mask:#x}, local is {local_mask:#x}")]
    MaskMismatch { requester_mask: u64, local_mask: u64 },

    /// The migration timed out or the connection was lost mid-transfer;
    /// both sides roll back to their pre-migration state.
    #[error("migration of bucket {index} with peer {peer:?} was rolled back")]
    RolledBack { index: u32, peer: NodeId },
}

/// Top-level error type for configuration and fatal startup failures
/// (spec §7 "Fatal" class, §6 exit code `1`).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] opencluster_core::CoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("fatal: {0}")]
    Fatal(#[from] anyhow::Error),
}
