//! Node registry: every known peer, its connection state machine, and
//! its cached loadlevel gossip (spec §3 "Node", §4.3, §4.8).

mod registry;

pub use registry::{LoadLevel, NodeHandle, NodeRegistry, NodeState};
