//! OpenCluster core -- hashing, connection descriptors, wire framing, and
//! value/item types shared between the daemon and its tests.
//!
//! - **Hash** ([`hash`]): FNV-1a 64-bit hashing used for map/key hashes
//!   and bucket routing.
//! - **Conninfo** ([`conninfo`]): node connection descriptors, parsed from
//!   and normalized to JSON.
//! - **Wire** ([`wire`]): the 12-byte message header, payload field
//!   codecs, and canonical command codes.
//! - **Value / Item** ([`value`], [`item`]): the tagged value stored per
//!   `(map, key)` and the item record wrapping it.

pub mod conninfo;
pub mod error;
pub mod hash;
pub mod item;
pub mod value;
pub mod wire;

pub use conninfo::ConnInfo;
pub use error::CoreError;
pub use hash::{bucket_index, fnv1a_hash_bytes, fnv1a_hash_long, fnv1a_hash_str};
pub use item::Item;
pub use value::Value;
pub use wire::{command, Header, PayloadReader, PayloadWriter, HEADER_LEN};

/// Starting bucket mask for a founder node (`2^4 - 1` = 16 buckets).
pub const STARTING_MASK: u64 = 0x0F;

/// Minimum number of buckets a node should hold before a split is
/// triggered.
pub const MIN_BUCKETS: u32 = 6;

/// Idle-timeout multiple of the client keepalive interval (spec §5).
pub const CLIENT_TIMEOUT_LIMIT: u32 = 6;

/// Maximum outstanding unacknowledged migration items per bucket.
pub const TRANSIT_MAX: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_exports_are_accessible() {
        let info = ConnInfo::new("n", "127.0.0.1", None);
        assert_eq!(fnv1a_hash_str("n"), fnv1a_hash_bytes(b"n"));
        assert!(!info.normalized().is_empty());
        assert_eq!(STARTING_MASK, 0x0F);
    }
}
