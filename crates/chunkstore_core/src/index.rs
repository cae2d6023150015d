//! The in-memory key index.
//!
//! The index is the authoritative map from logical key to record location.
//! All mutations are atomic with respect to concurrent readers; per-key
//! operations are compare-and-swap-like, which is what linearizes writes to
//! a single key.

use crate::key::RecordKey;
use crate::types::SegmentId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Location descriptor for one live (or tombstoned) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Segment holding the record.
    pub segment: SegmentId,
    /// Byte offset of the record within the segment.
    pub offset: u64,
    /// Value length in bytes.
    pub length: u32,
    /// Whether the key has been deleted.
    pub tombstone: bool,
}

impl IndexEntry {
    /// Creates a live entry.
    #[must_use]
    pub fn new(segment: SegmentId, offset: u64, length: u32) -> Self {
        Self {
            segment,
            offset,
            length,
            tombstone: false,
        }
    }
}

/// Concurrent map from key to [`IndexEntry`].
///
/// At most one entry exists per key at any time. Tombstoned entries are kept
/// until compaction purges them; they are never returned to readers as live.
#[derive(Debug)]
pub struct KeyIndex<K: RecordKey> {
    map: RwLock<HashMap<K, IndexEntry>>,
}

impl<K: RecordKey> Default for KeyIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: RecordKey> KeyIndex<K> {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the entry for a key, tombstoned or not.
    pub fn get(&self, key: &K) -> Option<IndexEntry> {
        self.map.read().get(key).copied()
    }

    /// Inserts an entry only if the key has no live entry.
    ///
    /// Returns `false` without mutating state when a live entry exists.
    /// A tombstoned entry does not block insertion; deleted keys may be
    /// written again.
    pub fn put_if_absent(&self, key: K, entry: IndexEntry) -> bool {
        let mut map = self.map.write();
        match map.get(&key) {
            Some(existing) if !existing.tombstone => false,
            _ => {
                map.insert(key, entry);
                true
            }
        }
    }

    /// Inserts or replaces the entry for a key, returning the previous one.
    pub fn upsert(&self, key: K, entry: IndexEntry) -> Option<IndexEntry> {
        self.map.write().insert(key, entry)
    }

    /// Marks a live entry as tombstoned, returning its pre-mutation state.
    ///
    /// Returns `None` when the key is absent or already tombstoned.
    pub fn mark_tombstone(&self, key: &K) -> Option<IndexEntry> {
        let mut map = self.map.write();
        let entry = map.get_mut(key)?;
        if entry.tombstone {
            return None;
        }
        let previous = *entry;
        entry.tombstone = true;
        Some(previous)
    }

    /// Marks a live entry as tombstoned, but only if it still points at
    /// the given location. Returns whether the mark happened.
    pub fn mark_tombstone_at(&self, key: &K, segment: SegmentId, offset: u64) -> bool {
        let mut map = self.map.write();
        let Some(entry) = map.get_mut(key) else {
            return false;
        };
        if entry.tombstone || entry.segment != segment || entry.offset != offset {
            return false;
        }
        entry.tombstone = true;
        true
    }

    /// Removes the entry for a key entirely.
    pub fn remove(&self, key: &K) -> Option<IndexEntry> {
        self.map.write().remove(key)
    }

    /// Whether a live entry for `key` currently points at this location.
    pub fn confirms(&self, key: &K, segment: SegmentId, offset: u64) -> bool {
        self.map
            .read()
            .get(key)
            .is_some_and(|e| !e.tombstone && e.segment == segment && e.offset == offset)
    }

    /// Replaces the entry for `key` only if it is live and still points at
    /// the expected location. Returns whether the swap happened.
    pub fn compare_and_update(
        &self,
        key: &K,
        expected_segment: SegmentId,
        expected_offset: u64,
        new_entry: IndexEntry,
    ) -> bool {
        let mut map = self.map.write();
        let Some(entry) = map.get_mut(key) else {
            return false;
        };
        if entry.tombstone
            || entry.segment != expected_segment
            || entry.offset != expected_offset
        {
            return false;
        }
        *entry = new_entry;
        true
    }

    /// Applies the outcome of a segment-local compaction.
    ///
    /// Surviving records have their offsets rewritten (only when the entry
    /// still points at the pre-compaction location); entries still pointing
    /// at dropped tombstoned records are purged whether or not the
    /// tombstone flag has reached the index yet.
    pub fn apply_segment_compaction(
        &self,
        segment: SegmentId,
        remapped: &[(K, u64, u64)],
        dropped: &[(K, u64)],
    ) {
        let mut map = self.map.write();

        for (key, old_offset, new_offset) in remapped {
            if let Some(entry) = map.get_mut(key) {
                if !entry.tombstone && entry.segment == segment && entry.offset == *old_offset {
                    entry.offset = *new_offset;
                }
            }
        }

        for (key, old_offset) in dropped {
            if let Some(entry) = map.get(key) {
                if entry.segment == segment && entry.offset == *old_offset {
                    map.remove(key);
                }
            }
        }
    }

    /// Removes a tombstoned entry, but only if it still points at the
    /// given location. Returns whether an entry was removed.
    pub fn remove_tombstone_at(&self, key: &K, segment: SegmentId, offset: u64) -> bool {
        let mut map = self.map.write();
        let Some(entry) = map.get(key) else {
            return false;
        };
        if entry.tombstone && entry.segment == segment && entry.offset == offset {
            map.remove(key);
            true
        } else {
            false
        }
    }

    /// Returns every entry at a single consistent point in time.
    pub fn snapshot(&self) -> Vec<(K, IndexEntry)> {
        self.map
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), *e))
            .collect()
    }

    /// Returns every live key.
    pub fn live_keys(&self) -> Vec<K> {
        self.map
            .read()
            .iter()
            .filter(|(_, e)| !e.tombstone)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Total entry count, including tombstoned entries.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Live entry count.
    pub fn live_len(&self) -> usize {
        self.map.read().values().filter(|e| !e.tombstone).count()
    }

    /// Whether the index has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
