//! Per-bucket two-level value store with the "chained old-bucket"
//! generation structure used while splitting (spec §3, §4.2).
//!
//! Grounded on the DashMap-backed storage idiom in the teacher's
//! `storage/engines/hashmap.rs`, scaled down from its 3-layer
//! Hazelcast-style engine to the spec's simpler
//! `key_hash -> maplist -> (map_hash -> item)` shape, with an `Arc`-linked
//! `next` generation original to this crate (the teacher has no
//! split/chain concept).

use std::sync::Arc;

use dashmap::DashMap;
use opencluster_core::Item;

/// A `maplist`: the set of items under one key hash, plus an optional
/// human-readable label set by `SET-KEYVALUE` (spec §4.7).
#[derive(Debug, Default)]
pub struct MapList {
    pub label: Option<Vec<u8>>,
    maps: DashMap<u64, Item>,
}

impl MapList {
    fn new() -> Self {
        Self { label: None, maps: DashMap::new() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty() && self.label.is_none()
    }
}

/// One generation of a bucket's data. The head generation is where all
/// new writes land; `next` optionally chains to the generation that
/// existed before the last mask-split for this index's sibling, kept
/// alive only by this reference (spec §4.2).
#[derive(Debug)]
pub struct ValueStore {
    head: DashMap<u64, MapList>,
    next: Option<Arc<ValueStore>>,
}

impl ValueStore {
    /// A fresh, empty store with no older generation.
    #[must_use]
    pub fn new() -> Self {
        Self { head: DashMap::new(), next: None }
    }

    /// A fresh, empty head generation chained to an older store, as
    /// created by a bucket-table split (spec §4.2).
    #[must_use]
    pub fn new_with_previous_generation(previous: Arc<Self>) -> Self {
        Self { head: DashMap::new(), next: Some(previous) }
    }

    /// `true` if this store has an older generation still linked behind
    /// it (i.e. it was produced by a split and has not finished draining).
    #[must_use]
    pub fn has_old_generation(&self) -> bool {
        self.next.is_some()
    }

    /// Looks up `(key_hash, map_hash)`. A hit in an older generation is
    /// lazily migrated into the head before being returned, per spec
    /// §3/§4.2.
    #[must_use]
    pub fn get(&self, key_hash: u64, map_hash: u64) -> Option<Item> {
        if let Some(maplist) = self.head.get(&key_hash) {
            if let Some(item) = maplist.maps.get(&map_hash) {
                return Some(item.clone());
            }
        }
        // Fall through the generation chain; migrate a hit back to head.
        let mut cursor = self.next.as_ref();
        while let Some(gen) = cursor {
            if let Some(maplist) = gen.head.get(&key_hash) {
                if let Some(item) = maplist.maps.get(&map_hash) {
                    let item = item.clone();
                    self.migrate_item_to_head(key_hash, map_hash, item.clone());
                    return Some(item);
                }
            }
            cursor = gen.next.as_ref();
        }
        None
    }

    fn migrate_item_to_head(&self, key_hash: u64, map_hash: u64, item: Item) {
        self.head
            .entry(key_hash)
            .or_insert_with(MapList::new)
            .maps
            .insert(map_hash, item);
    }

    /// Inserts or overwrites an item in the head generation, creating its
    /// maplist lazily.
    pub fn set(&self, key_hash: u64, map_hash: u64, item: Item) {
        self.head.entry(key_hash).or_insert_with(MapList::new).maps.insert(map_hash, item);
    }

    /// Marks an item deleted in place (spec §4.7 DELETE semantics).
    /// Returns `true` if an item was found (in head or an older
    /// generation) and marked.
    pub fn delete(&self, key_hash: u64, map_hash: u64) -> bool {
        if let Some(maplist) = self.head.get(&key_hash) {
            if let Some(mut item) = maplist.maps.get_mut(&map_hash) {
                item.value.clear();
                return true;
            }
        }
        // Deleting from an older generation still requires migrating it
        // to head first so the tombstone is visible to future splits.
        if let Some(mut item) = self.get(key_hash, map_hash) {
            item.value.clear();
            self.set(key_hash, map_hash, item);
            return true;
        }
        false
    }

    /// Attaches (or clears) the human-readable label for a key hash
    /// (`SET-KEYVALUE`, spec §4.7).
    pub fn set_label(&self, key_hash: u64, label: Vec<u8>) {
        self.head.entry(key_hash).or_insert_with(MapList::new).label = Some(label);
    }

    #[must_use]
    pub fn label(&self, key_hash: u64) -> Option<Vec<u8>> {
        self.head.get(&key_hash).and_then(|m| m.label.clone())
    }

    /// Removes every expired item in the head generation whose `expires`
    /// has passed `now`, returning the count removed. Does not walk older
    /// generations; the background drain (below) surfaces those.
    pub fn evict_expired(&self, now: u32) -> usize {
        let mut removed = 0;
        self.head.retain(|_key_hash, maplist| {
            maplist.maps.retain(|_map_hash, item| {
                if item.has_expired(now) {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            !maplist.is_empty()
        });
        removed
    }

    /// Migrates one arbitrary item from the oldest reachable generation
    /// into the head, for the "background tick walks one old-bucket item
    /// per second" behavior named in spec §3. Returns `true` if an item
    /// was migrated, `false` if there was nothing left to drain.
    pub fn drain_one_old_item(&self) -> bool {
        let Some(oldest) = self.next.as_ref() else { return false };
        let Some(entry) = oldest.head.iter().next() else { return false };
        let key_hash = *entry.key();
        drop(entry);
        let Some((map_hash, item)) = oldest
            .head
            .get(&key_hash)
            .and_then(|maplist| maplist.maps.iter().next().map(|e| (*e.key(), e.value().clone())))
        else {
            return false;
        };
        self.set(key_hash, map_hash, item);
        if let Some(maplist) = oldest.head.get(&key_hash) {
            maplist.maps.remove(&map_hash);
        }
        true
    }

    /// Like [`Self::drain_one_old_item`], but only considers items whose
    /// key hash still routes to `own_index` under `mask` -- used after a
    /// split, where the old generation is shared between two sibling
    /// buckets and each must only claim its own half of the keyspace
    /// (spec §4.2).
    pub fn drain_one_old_item_matching(&self, own_index: u32, mask: u64) -> bool {
        let Some(oldest) = self.next.as_ref() else { return false };
        let Some(found) = oldest.head.iter().find_map(|entry| {
            let key_hash = *entry.key();
            if opencluster_core::bucket_index(key_hash, mask) != u64::from(own_index) {
                return None;
            }
            entry.maps.iter().next().map(|m| (key_hash, *m.key(), m.value().clone()))
        }) else {
            return false;
        };
        let (key_hash, map_hash, item) = found;
        self.set(key_hash, map_hash, item);
        if let Some(maplist) = oldest.head.get(&key_hash) {
            maplist.maps.remove(&map_hash);
        }
        true
    }

    /// `true` once every older generation has been fully drained and can
    /// be unlinked.
    #[must_use]
    pub fn old_generation_is_empty(&self) -> bool {
        self.next.as_ref().is_none_or(|gen| gen.head.is_empty() && gen.old_generation_is_empty())
    }

    /// A full, deduplicated snapshot of every live (non-deleted) item
    /// across the whole generation chain, for streaming a bucket's
    /// contents to a migration target (spec §4.5). Head entries shadow
    /// older-generation entries with the same `(key_hash, map_hash)`.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(u64, u64, Item)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        self.collect_snapshot(&mut seen, &mut out);
        out
    }

    fn collect_snapshot(&self, seen: &mut std::collections::HashSet<(u64, u64)>, out: &mut Vec<(u64, u64, Item)>) {
        for entry in self.head.iter() {
            let key_hash = *entry.key();
            for item_entry in entry.maps.iter() {
                let map_hash = *item_entry.key();
                if !seen.insert((key_hash, map_hash)) {
                    continue;
                }
                let item = item_entry.value().clone();
                if item.value.is_deleted() {
                    continue;
                }
                out.push((key_hash, map_hash, item));
            }
        }
        if let Some(older) = &self.next {
            older.collect_snapshot(seen, out);
        }
    }

    /// A snapshot of every key-hash label set in the head generation, for
    /// carrying `SET-KEYVALUE` labels across a migration (spec §4.5,
    /// §4.7).
    #[must_use]
    pub fn label_snapshot(&self) -> Vec<(u64, Vec<u8>)> {
        self.head
            .iter()
            .filter_map(|entry| entry.value().label.clone().map(|label| (*entry.key(), label)))
            .collect()
    }
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencluster_core::Value;

    fn item(key: u64, map: u64, v: i32) -> Item {
        Item::new(key, map, Value::Int(v), 0)
    }

    #[test]
    fn set_then_get_returns_the_value() {
        let store = ValueStore::new();
        store.set(1, 1, item(1, 1, 42));
        assert_eq!(store.get(1, 1), Some(item(1, 1, 42)));
    }

    #[test]
    fn missing_key_returns_none() {
        let store = ValueStore::new();
        assert_eq!(store.get(1, 1), None);
    }

    #[test]
    fn delete_marks_value_deleted_in_place() {
        let store = ValueStore::new();
        store.set(1, 1, item(1, 1, 42));
        assert!(store.delete(1, 1));
        assert!(store.get(1, 1).unwrap().value.is_deleted());
    }

    #[test]
    fn delete_missing_key_returns_false() {
        let store = ValueStore::new();
        assert!(!store.delete(1, 1));
    }

    #[test]
    fn label_round_trips() {
        let store = ValueStore::new();
        store.set_label(1, b"clientname".to_vec());
        assert_eq!(store.label(1), Some(b"clientname".to_vec()));
    }

    #[test]
    fn chained_generation_hit_is_lazily_migrated_to_head() {
        let old = Arc::new(ValueStore::new());
        old.set(5, 5, item(5, 5, 7));
        let head = ValueStore::new_with_previous_generation(Arc::clone(&old));

        assert!(head.has_old_generation());
        assert_eq!(head.get(5, 5), Some(item(5, 5, 7)));

        // After the lazy migration, the item is reachable even if the
        // old generation is dropped.
        let head = ValueStore { head: head.head, next: None };
        assert_eq!(head.get(5, 5), Some(item(5, 5, 7)));
    }

    #[test]
    fn evict_expired_removes_only_expired_items() {
        let store = ValueStore::new();
        store.set(1, 1, Item::new(1, 1, Value::Int(1), 50));
        store.set(1, 2, Item::new(1, 2, Value::Int(2), 0));
        let removed = store.evict_expired(100);
        assert_eq!(removed, 1);
        assert_eq!(store.get(1, 1), None);
        assert!(store.get(1, 2).is_some());
    }

    #[test]
    fn drain_one_old_item_matching_only_claims_own_route() {
        let old = Arc::new(ValueStore::new());
        old.set(0b00, 1, item(0b00, 1, 1)); // routes to index 0 under mask 0b1
        old.set(0b01, 2, item(0b01, 2, 2)); // routes to index 1 under mask 0b1

        let sibling_zero = ValueStore::new_with_previous_generation(Arc::clone(&old));
        let sibling_one = ValueStore::new_with_previous_generation(Arc::clone(&old));

        assert!(sibling_zero.drain_one_old_item_matching(0, 0b1));
        assert_eq!(sibling_zero.get(0b00, 1), Some(item(0b00, 1, 1)));
        assert!(!sibling_zero.drain_one_old_item_matching(0, 0b1));

        assert!(sibling_one.drain_one_old_item_matching(1, 0b1));
        assert_eq!(sibling_one.get(0b01, 2), Some(item(0b01, 2, 2)));
    }

    #[test]
    fn drain_one_old_item_migrates_a_single_entry_at_a_time() {
        let old = Arc::new(ValueStore::new());
        old.set(1, 1, item(1, 1, 1));
        old.set(2, 2, item(2, 2, 2));
        let head = ValueStore::new_with_previous_generation(Arc::clone(&old));

        assert!(!head.old_generation_is_empty());
        assert!(head.drain_one_old_item());
        assert!(head.drain_one_old_item());
        assert!(!head.drain_one_old_item());
        assert!(head.old_generation_is_empty());
    }
}
