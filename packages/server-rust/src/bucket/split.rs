//! Bucket-table mask doubling (spec §4.2).
//!
//! Splitting doubles the mask and, for every newly addressable index,
//! creates a bucket whose value store chains back to the sibling it was
//! carved out of rather than copying data up front. Both the original
//! index and its new sibling keep draining the shared old generation in
//! the background (`ValueStore::drain_one_old_item_matching`) until it
//! is empty.

use std::sync::Arc;

use crate::bucket::descriptor::Bucket;
use crate::bucket::table::BucketTable;
use crate::store::ValueStore;

/// Doubles `table`'s mask and materializes every new sibling bucket,
/// chaining its store to the existing bucket it splits off from. Returns
/// the new mask.
///
/// Triggered once a node's primary bucket count exceeds the configured
/// split threshold (spec §4.2); the caller is responsible for deciding
/// *when* to split, this only performs the mechanical split itself.
pub fn split_table(table: &BucketTable) -> u64 {
    let old_mask = table.mask();
    let new_mask = (old_mask << 1) | 1;
    let new_index_count = new_mask - old_mask;

    for offset in 0..new_index_count {
        let new_index = u32::try_from(old_mask + 1 + offset).expect("bucket index fits in u32");
        let sibling_index = new_index & u32::try_from(old_mask).expect("mask fits in u32");

        let Some(sibling) = table.get(sibling_index) else { continue };
        let split_off = Bucket {
            index: new_index,
            level: sibling.level,
            data: Arc::new(ValueStore::new_with_previous_generation(Arc::clone(&sibling.data))),
            primary_node: sibling.primary_node,
            secondary_node: sibling.secondary_node,
            source_node: sibling.source_node,
            backup_node: sibling.backup_node,
            transfer_client: None,
            promoting: false,
            last_bucket: false,
        };
        drop(sibling);
        table.insert(split_off);

        // The original index keeps its bucket record but gets a fresh
        // generation chained to the same pre-split data, so it too only
        // serves (and drains) the half of the keyspace that still routes
        // to it.
        table.with_mut(sibling_index, |bucket| {
            bucket.data = Arc::new(ValueStore::new_with_previous_generation(Arc::clone(&bucket.data)));
        });
    }

    table.set_mask(new_mask);
    new_mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::descriptor::BucketLevel as Level;

    #[test]
    fn split_doubles_mask_and_count() {
        let table = BucketTable::founder(1);
        let old_mask = table.mask();
        let old_len = table.len();
        let new_mask = split_table(&table);

        assert_eq!(new_mask, (old_mask << 1) | 1);
        assert_eq!(table.mask(), new_mask);
        assert_eq!(table.len(), old_len * 2);
    }

    #[test]
    fn split_siblings_both_chain_to_the_pre_split_generation() {
        let table = BucketTable::founder(1);
        split_table(&table);

        let sibling = table.get(0).unwrap();
        assert!(sibling.data.has_old_generation());
        drop(sibling);

        let new_index = 0 | (opencluster_core::STARTING_MASK as u32 + 1);
        let new_bucket = table.get(new_index).unwrap();
        assert!(new_bucket.data.has_old_generation());
        assert_eq!(new_bucket.level, Level::Primary);
    }
}
