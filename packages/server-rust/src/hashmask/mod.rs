//! The hashmask table: per-bucket primary/secondary owner *names*,
//! gossiped between nodes so everyone can route a key without asking the
//! owner first (spec §4.1).
//!
//! Distinct from [`crate::bucket::BucketTable`]: the bucket table is this
//! node's own bucket storage and ownership bookkeeping; the hashmask
//! table is the cluster-wide routing view every node maintains for every
//! bucket, keyed by conninfo name rather than connection.

use dashmap::DashMap;

/// The primary/secondary owner names for one bucket index, as carried in
/// `HASHMASK` messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashmaskEntry {
    pub primary_name: Option<String>,
    pub secondary_name: Option<String>,
}

/// Cluster-wide routing table: bucket index -> owner names, plus the
/// mask it was built under. Doubling the mask (a local split) remaps
/// every existing entry to its pair of new indices, carrying the same
/// names forward until ownership actually changes (spec §4.1, §4.2).
#[derive(Debug)]
pub struct HashmaskTable {
    entries: DashMap<u32, HashmaskEntry>,
}

impl HashmaskTable {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    #[must_use]
    pub fn get(&self, index: u32) -> HashmaskEntry {
        self.entries.get(&index).map(|e| e.clone()).unwrap_or_default()
    }

    pub fn set(&self, index: u32, entry: HashmaskEntry) {
        self.entries.insert(index, entry);
    }

    pub fn set_primary(&self, index: u32, name: Option<String>) {
        self.entries.entry(index).or_default().primary_name = name;
    }

    pub fn set_secondary(&self, index: u32, name: Option<String>) {
        self.entries.entry(index).or_default().secondary_name = name;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remaps entries across a mask doubling: every existing index `i`
    /// keeps its name assignment at both `i` and its new sibling
    /// `i | (old_mask + 1)`, since a split does not itself change which
    /// node owns the data, only how finely it is chunked (spec §4.2).
    pub fn remap_for_split(&self, old_mask: u64) {
        let sibling_bit = old_mask + 1;
        let existing: Vec<(u32, HashmaskEntry)> = self.entries.iter().map(|e| (*e.key(), e.value().clone())).collect();
        for (index, entry) in existing {
            let sibling = index | u32::try_from(sibling_bit).expect("sibling bit fits in u32");
            self.entries.insert(sibling, entry);
        }
    }
}

impl Default for HashmaskTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_entry_defaults_to_unowned() {
        let table = HashmaskTable::new();
        assert_eq!(table.get(3), HashmaskEntry::default());
    }

    #[test]
    fn set_primary_and_secondary_round_trip() {
        let table = HashmaskTable::new();
        table.set_primary(1, Some("nodeA".to_string()));
        table.set_secondary(1, Some("nodeB".to_string()));
        let entry = table.get(1);
        assert_eq!(entry.primary_name.as_deref(), Some("nodeA"));
        assert_eq!(entry.secondary_name.as_deref(), Some("nodeB"));
    }

    #[test]
    fn remap_for_split_carries_names_to_both_siblings() {
        let table = HashmaskTable::new();
        table.set_primary(0, Some("nodeA".to_string()));
        table.remap_for_split(0x0F);
        assert_eq!(table.get(0).primary_name.as_deref(), Some("nodeA"));
        assert_eq!(table.get(0x10).primary_name.as_deref(), Some("nodeA"));
    }
}
