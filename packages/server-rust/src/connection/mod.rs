//! Connection registry: every open TCP socket, client or peer, tracked
//! by a stable [`ConnId`] rather than a live reference (spec §9).

mod registry;

pub use registry::{ConnectionHandle, ConnectionKind, ConnectionMetadata, ConnectionRegistry, OutboundMessage, SendError};
