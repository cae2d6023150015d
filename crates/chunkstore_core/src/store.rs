//! The store facade.
//!
//! [`Store`] composes the allocator, index, hint log, and compactor into
//! the put/get/delete surface external collaborators consume. Two
//! instantiations cover the two places the engine is embedded:
//!
//! - [`ChunkStore`] (`Store<String>`): byte-addressed records under string
//!   keys, used for object payloads and name-keyed metadata.
//! - [`BlockStore`] (`Store<u64>`): id-addressed records, used for block
//!   data keyed by numeric ids.
//!
//! All components are constructed at open time and passed by handle; there
//! are no process-wide singletons. `close` stops the background worker,
//! syncs segments, and writes a hint snapshot for the next startup.

use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::hint::{HintLog, HintSnapshot};
use crate::index::{IndexEntry, KeyIndex};
use crate::key::RecordKey;
use crate::maintenance::MaintenanceWorker;
use crate::segment::{
    AppendOutcome, Compactor, MarkOutcome, MergeStats, ReadOutcome, ScannedRecord,
    SegmentAllocator,
};
use crate::types::SegmentId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// How many times a read retries after observing a stale index offset.
///
/// A retry re-reads the index, which a concurrent compaction updates
/// inside the segment's exclusive section, so one retry normally
/// suffices.
const STALE_READ_RETRIES: usize = 3;

/// Where a record was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// Segment holding the record.
    pub segment: SegmentId,
    /// Record offset within the segment.
    pub offset: u64,
}

/// Store-level counters.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    /// Number of segments.
    pub segments: usize,
    /// Live keys in the index.
    pub live_keys: usize,
    /// Total bytes written across segments.
    pub used_bytes: u64,
    /// Total bytes awaiting reclamation.
    pub removed_bytes: u64,
}

/// A byte-addressed store under string keys.
pub type ChunkStore = Store<String>;

/// An id-addressed store under 64-bit keys.
pub type BlockStore = Store<u64>;

/// An embedded log-structured store.
pub struct Store<K: RecordKey> {
    config: StoreConfig,
    dir: Arc<StoreDir>,
    allocator: Arc<SegmentAllocator<K>>,
    index: Arc<KeyIndex<K>>,
    hint: Arc<HintLog>,
    compactor: Arc<Compactor<K>>,
    /// Request paths hold this shared; the store-wide merge takes it
    /// exclusively around its quiesce and swap phases.
    gate: Arc<RwLock<()>>,
    maintenance: Mutex<Option<MaintenanceWorker>>,
    is_open: RwLock<bool>,
}

impl<K: RecordKey> Store<K> {
    /// Opens a store in `path` with the given configuration.
    ///
    /// Recovery order: resolve any merge scratch left by a crash, load
    /// segments by filename convention, then rebuild the index from the
    /// hint log, or from a full scan of every segment when the hint is
    /// absent or unusable.
    ///
    /// # Errors
    ///
    /// Startup failures (directory missing, lock held elsewhere, initial
    /// segment not creatable) are fatal and abort the open.
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        config.validate()?;

        let dir = Arc::new(StoreDir::open(path, &config.name, config.create_if_missing)?);
        dir.cleanup_merge_scratch()?;

        let allocator = Arc::new(SegmentAllocator::load(Arc::clone(&dir), &config)?);
        let index = Arc::new(KeyIndex::new());
        let hint = Arc::new(HintLog::new(dir.hint_path(), dir.hint_temp_path()));

        Self::recover(&allocator, &index, &hint)?;

        if allocator.is_empty() {
            let initial = allocator.create_segment()?;
            allocator.release(&initial);
        }

        let gate = Arc::new(RwLock::new(()));
        let compactor = Arc::new(Compactor::new(
            Arc::clone(&dir),
            Arc::clone(&allocator),
            Arc::clone(&index),
            Arc::clone(&hint),
            Arc::clone(&gate),
            config.deleted_ratio,
        ));

        let maintenance = if config.auto_maintenance {
            Some(MaintenanceWorker::spawn(
                Arc::clone(&compactor),
                config.maintenance_interval,
            )?)
        } else {
            None
        };

        debug!(
            store = %config.name,
            segments = allocator.len(),
            keys = index.live_len(),
            "store opened"
        );

        Ok(Self {
            config,
            dir,
            allocator,
            index,
            hint,
            compactor,
            gate,
            maintenance: Mutex::new(maintenance),
            is_open: RwLock::new(true),
        })
    }

    /// The store's directory handle.
    #[must_use]
    pub fn dir(&self) -> &StoreDir {
        &self.dir
    }

    /// The store's configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Writes a record, replacing any previous record under the key.
    ///
    /// The superseded record's bytes are tombstoned in place so that at
    /// most one live on-disk record exists per key.
    pub fn put(&self, key: K, value: &[u8]) -> CoreResult<Location> {
        self.ensure_open()?;
        self.check_record(&key, value)?;
        let record = key.encode_record(value);
        let _gate = self.gate.read();

        loop {
            let segment = self.allocator.acquire(record.len() as u64)?;

            let mut previous = None;
            let outcome = segment.append_indexed(&record, |offset| {
                previous = self.index.upsert(
                    key.clone(),
                    IndexEntry::new(segment.id(), offset, value.len() as u32),
                );
                true
            });
            self.allocator.release(&segment);

            match outcome? {
                AppendOutcome::Written(offset) => {
                    if let Some(prev) = previous {
                        let same_spot =
                            prev.segment == segment.id() && prev.offset == offset;
                        if !prev.tombstone && !same_spot {
                            self.mark_superseded(&key, prev);
                        }
                    }
                    return Ok(Location {
                        segment: segment.id(),
                        offset,
                    });
                }
                // Destroyed while pooled; pick another segment.
                AppendOutcome::Unavailable => continue,
                AppendOutcome::RolledBack => {
                    return Err(CoreError::invalid_operation(
                        "unconditional append was rolled back",
                    ))
                }
            }
        }
    }

    /// Writes a record only if the key has no live record yet.
    ///
    /// This is the at-most-once acceptance path for duplicate upload
    /// retries: the losing call reports `None` and leaves no trace.
    pub fn put_if_absent(&self, key: K, value: &[u8]) -> CoreResult<Option<Location>> {
        self.ensure_open()?;
        self.check_record(&key, value)?;

        if self.index.get(&key).is_some_and(|e| !e.tombstone) {
            return Ok(None);
        }

        let record = key.encode_record(value);
        let _gate = self.gate.read();

        loop {
            let segment = self.allocator.acquire(record.len() as u64)?;

            let outcome = segment.append_indexed(&record, |offset| {
                self.index.put_if_absent(
                    key.clone(),
                    IndexEntry::new(segment.id(), offset, value.len() as u32),
                )
            });
            self.allocator.release(&segment);

            match outcome? {
                AppendOutcome::Written(offset) => {
                    return Ok(Some(Location {
                        segment: segment.id(),
                        offset,
                    }))
                }
                AppendOutcome::RolledBack => return Ok(None),
                AppendOutcome::Unavailable => continue,
            }
        }
    }

    /// Reads the value under a key.
    ///
    /// Returns `Ok(None)` for absent and tombstoned keys alike.
    pub fn get(&self, key: &K) -> CoreResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        let _gate = self.gate.read();
        self.get_inner(key)
    }

    /// Deletes the record under a key.
    ///
    /// The on-disk record is tombstoned first; only a durable mark flips
    /// the index entry. Returns whether a live record was deleted.
    pub fn delete(&self, key: &K) -> CoreResult<bool> {
        self.ensure_open()?;
        let _gate = self.gate.read();

        let mut last_segment = SegmentId::new(0);
        for _ in 0..STALE_READ_RETRIES {
            let Some(entry) = self.index.get(key) else {
                return Ok(false);
            };
            if entry.tombstone {
                return Ok(false);
            }
            last_segment = entry.segment;

            let Some(segment) = self.allocator.get(entry.segment) else {
                continue;
            };

            match segment.mark_removed(key, entry.offset) {
                Ok(MarkOutcome::Marked | MarkOutcome::AlreadyRemoved) => {
                    self.index.mark_tombstone_at(key, entry.segment, entry.offset);
                    return Ok(true);
                }
                // Stale location; re-read the index and retry.
                Ok(MarkOutcome::KeyMismatch) => continue,
                Err(CoreError::SegmentGone { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(CoreError::segment_corruption(
            last_segment,
            "index entry does not resolve to its record",
        ))
    }

    /// Lists every live key, in no particular order.
    pub fn list_keys(&self) -> CoreResult<Vec<K>> {
        self.ensure_open()?;
        Ok(self.index.live_keys())
    }

    /// Reads every live record at one index snapshot.
    ///
    /// Used by higher-level stores to serialize current state and by
    /// replication to ship full copies.
    pub fn snapshot(&self) -> CoreResult<Vec<(K, Vec<u8>)>> {
        self.ensure_open()?;
        let _gate = self.gate.read();

        let mut records = Vec::new();
        for (key, entry) in self.index.snapshot() {
            if entry.tombstone {
                continue;
            }
            if let Some(value) = self.get_inner(&key)? {
                records.push((key, value));
            }
        }
        Ok(records)
    }

    /// Compacts every segment over the deleted-bytes threshold, returning
    /// how many were compacted.
    pub fn compact_now(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        Ok(self.compactor.run_threshold_pass())
    }

    /// Runs a store-wide merge: every live record is rewritten, key-sorted,
    /// into the segment-0 slot and all other segments are destroyed.
    pub fn merge_now(&self) -> CoreResult<MergeStats> {
        self.ensure_open()?;
        self.compactor.merge()
    }

    /// Store-level counters.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        self.ensure_open()?;

        let mut used_bytes = 0;
        let mut removed_bytes = 0;
        let segments = self.allocator.segments();
        for segment in &segments {
            let stats = segment.stats();
            used_bytes += stats.used_bytes;
            removed_bytes += stats.removed_bytes;
        }

        Ok(StoreStats {
            segments: segments.len(),
            live_keys: self.index.live_len(),
            used_bytes,
            removed_bytes,
        })
    }

    /// Closes the store: stops maintenance, syncs segments, and writes a
    /// hint snapshot so the next open can skip the full scan.
    pub fn close(&self) -> CoreResult<()> {
        {
            let mut open = self.is_open.write();
            if !*open {
                return Ok(());
            }
            *open = false;
        }

        if let Some(mut worker) = self.maintenance.lock().take() {
            worker.stop();
        }

        for segment in self.allocator.segments() {
            if let Err(e) = segment.sync() {
                warn!(segment = %segment.id(), error = %e, "sync on close failed");
            }
        }

        if let Err(e) = self.compactor.write_hint_snapshot() {
            warn!(error = %e, "hint snapshot on close failed");
        }

        debug!(store = %self.config.name, "store closed");
        Ok(())
    }

    /// Rejects invalid keys and oversized records before any allocation.
    fn check_record(&self, key: &K, value: &[u8]) -> CoreResult<()> {
        key.validate().map_err(CoreError::invalid_key)?;

        let record_len = (K::PREFIX_LEN + key.key_material_len()) as u64 + value.len() as u64;
        if record_len > self.config.segment_capacity {
            return Err(CoreError::RecordTooLarge {
                size: record_len,
                max: self.config.segment_capacity,
            });
        }
        Ok(())
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::StoreClosed)
        }
    }

    /// Read path without the gate; callers hold it.
    fn get_inner(&self, key: &K) -> CoreResult<Option<Vec<u8>>> {
        let mut last_segment = SegmentId::new(0);
        for _ in 0..STALE_READ_RETRIES {
            let Some(entry) = self.index.get(key) else {
                return Ok(None);
            };
            if entry.tombstone {
                return Ok(None);
            }
            last_segment = entry.segment;

            let Some(segment) = self.allocator.get(entry.segment) else {
                continue;
            };

            match segment.read_value(key, entry.offset) {
                Ok(ReadOutcome::Value(value)) => return Ok(Some(value)),
                Ok(ReadOutcome::Tombstoned) => return Ok(None),
                // Stale location; re-read the index and retry.
                Ok(ReadOutcome::KeyMismatch) => continue,
                Err(CoreError::SegmentGone { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(CoreError::segment_corruption(
            last_segment,
            "index entry does not resolve to its record",
        ))
    }

    /// Best-effort tombstone of a superseded record. A failure here only
    /// delays reclamation; compaction drops unconfirmed records anyway.
    fn mark_superseded(&self, key: &K, prev: IndexEntry) {
        let Some(segment) = self.allocator.get(prev.segment) else {
            return;
        };
        match segment.mark_removed(key, prev.offset) {
            Ok(_) => {}
            Err(e) => {
                warn!(
                    segment = %prev.segment,
                    error = %e,
                    "failed to tombstone superseded record"
                );
            }
        }
    }

    /// Rebuilds the index at startup.
    fn recover(
        allocator: &Arc<SegmentAllocator<K>>,
        index: &Arc<KeyIndex<K>>,
        hint: &Arc<HintLog>,
    ) -> CoreResult<()> {
        match hint.load::<K>() {
            Ok(Some(snapshot)) => {
                match Self::recover_from_hint(allocator, index, snapshot) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(error = %e, "hint log unusable; falling back to full scan");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "hint log unreadable; falling back to full scan");
            }
        }

        Self::recover_from_scan(allocator, index)
    }

    /// Fast path: hint entries plus a tail scan per covered segment.
    fn recover_from_hint(
        allocator: &Arc<SegmentAllocator<K>>,
        index: &Arc<KeyIndex<K>>,
        snapshot: HintSnapshot<K>,
    ) -> CoreResult<()> {
        let mut builder = RecoveryBuilder::new();

        let mut covered: HashMap<u32, u64> = HashMap::new();
        for hs in &snapshot.segments {
            if allocator.get(hs.segment).is_none() {
                return Err(CoreError::hint_corruption(format!(
                    "hint covers missing segment {}",
                    hs.segment
                )));
            }
            covered.insert(hs.segment.as_u32(), hs.watermark);
            builder.add_removed(hs.segment, hs.removed_bytes);
        }

        // Validate every entry against the record header it points at; the
        // record also supplies the value length the hint format omits.
        for (key, segment_id, offset) in snapshot.entries {
            let Some(segment) = allocator.get(segment_id) else {
                return Err(CoreError::hint_corruption(format!(
                    "hint entry references missing segment {segment_id}"
                )));
            };
            let Some(probe) = segment.probe_record(offset)? else {
                return Err(CoreError::hint_corruption(
                    "hint entry does not point at a record",
                ));
            };
            if probe.key != key {
                return Err(CoreError::hint_corruption(
                    "hint entry key does not match stored record",
                ));
            }

            if probe.tombstone {
                // Deleted after the hint was written.
                builder.add_removed(segment_id, u64::from(probe.record_len));
            } else {
                builder.add_hint(key, segment_id, offset, probe.value_len, probe.record_len);
            }
        }

        // Records past each watermark are newer than the hint.
        for hs in &snapshot.segments {
            let Some(segment) = allocator.get(hs.segment) else {
                continue;
            };
            for record in segment.recover_scan(hs.watermark)? {
                builder.add_scanned(hs.segment, record);
            }
        }

        // Segments the hint doesn't know about get a full scan.
        for segment in allocator.segments() {
            if covered.contains_key(&segment.id().as_u32()) {
                continue;
            }
            for record in segment.recover_scan(0)? {
                builder.add_scanned(segment.id(), record);
            }
        }

        builder.commit(allocator, index);
        Ok(())
    }

    /// Slow path: full sequential scan of every segment.
    fn recover_from_scan(
        allocator: &Arc<SegmentAllocator<K>>,
        index: &Arc<KeyIndex<K>>,
    ) -> CoreResult<()> {
        let mut builder = RecoveryBuilder::new();

        for segment in allocator.segments() {
            for record in segment.recover_scan(0)? {
                builder.add_scanned(segment.id(), record);
            }
        }

        builder.commit(allocator, index);
        Ok(())
    }
}

impl<K: RecordKey> std::fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.config.name)
            .field("segments", &self.allocator.len())
            .field("keys", &self.index.len())
            .finish_non_exhaustive()
    }
}

/// Accumulates recovery candidates and resolves duplicates.
///
/// Hint entries form the base; scanned records override them. Among
/// scanned duplicates of one key, a record in the same segment wins by
/// scan order, a live record beats a tombstoned one across segments, and
/// remaining ties go to the higher segment id. Losing live records are
/// superseded garbage; their bytes count toward their segment's
/// removed-bytes so threshold compaction reclaims them.
struct RecoveryBuilder<K> {
    candidates: HashMap<K, Candidate>,
    removed: HashMap<u32, u64>,
}

struct Candidate {
    segment: SegmentId,
    offset: u64,
    value_len: u32,
    record_len: u32,
    tombstone: bool,
    from_scan: bool,
}

impl<K: RecordKey> RecoveryBuilder<K> {
    fn new() -> Self {
        Self {
            candidates: HashMap::new(),
            removed: HashMap::new(),
        }
    }

    fn add_removed(&mut self, segment: SegmentId, bytes: u64) {
        *self.removed.entry(segment.as_u32()).or_default() += bytes;
    }

    fn add_hint(
        &mut self,
        key: K,
        segment: SegmentId,
        offset: u64,
        value_len: u32,
        record_len: u32,
    ) {
        self.candidates.insert(
            key,
            Candidate {
                segment,
                offset,
                value_len,
                record_len,
                tombstone: false,
                from_scan: false,
            },
        );
    }

    fn add_scanned(&mut self, segment: SegmentId, record: ScannedRecord<K>) {
        if record.tombstone {
            // Tombstoned bytes always count as garbage, whatever the
            // candidate resolution says.
            self.add_removed(segment, u64::from(record.record_len));
        }

        let incoming = Candidate {
            segment,
            offset: record.offset,
            value_len: record.value_len,
            record_len: record.record_len,
            tombstone: record.tombstone,
            from_scan: true,
        };

        match self.candidates.entry(record.key) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(incoming);
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let current = slot.get();

                // The same record can surface twice (hint entry at or past
                // the watermark, then the tail scan). Not a conflict.
                if current.segment == incoming.segment && current.offset == incoming.offset {
                    slot.insert(incoming);
                    return;
                }

                let incoming_wins = if !current.from_scan {
                    true
                } else if current.segment == incoming.segment {
                    // Scan order within a segment is append order.
                    true
                } else if current.tombstone != incoming.tombstone {
                    current.tombstone
                } else {
                    incoming.segment > current.segment
                };

                if incoming_wins {
                    let loser = slot.get();
                    if !loser.tombstone {
                        *self.removed.entry(loser.segment.as_u32()).or_default() +=
                            u64::from(loser.record_len);
                    }
                    slot.insert(incoming);
                } else if !incoming.tombstone {
                    *self.removed.entry(incoming.segment.as_u32()).or_default() +=
                        u64::from(incoming.record_len);
                }
            }
        }
    }

    fn commit(self, allocator: &Arc<SegmentAllocator<K>>, index: &Arc<KeyIndex<K>>) {
        for (segment_id, bytes) in self.removed {
            if bytes == 0 {
                continue;
            }
            if let Some(segment) = allocator.get(SegmentId::new(segment_id)) {
                segment.add_removed_bytes(bytes);
            }
        }

        for (key, candidate) in self.candidates {
            if candidate.tombstone {
                continue;
            }
            index.upsert(
                key,
                IndexEntry::new(candidate.segment, candidate.offset, candidate.value_len),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadStrategy;
    use tempfile::tempdir;

    fn config(capacity: u64) -> StoreConfig {
        StoreConfig::new()
            .segment_capacity(capacity)
            .auto_maintenance(false)
    }

    fn open_chunks(path: &Path, capacity: u64) -> ChunkStore {
        Store::open(path, config(capacity)).unwrap()
    }

    #[test]
    fn round_trip() {
        let tmp = tempdir().unwrap();
        let store = open_chunks(tmp.path(), 1024 * 1024);

        store.put("a.png".to_string(), b"payload-a").unwrap();
        store.put("b.png".to_string(), b"payload-b").unwrap();

        assert_eq!(
            store.get(&"a.png".to_string()).unwrap(),
            Some(b"payload-a".to_vec())
        );
        assert_eq!(
            store.get(&"b.png".to_string()).unwrap(),
            Some(b"payload-b".to_vec())
        );
        assert_eq!(store.get(&"missing".to_string()).unwrap(), None);
        store.close().unwrap();
    }

    #[test]
    fn duplicate_put_if_absent_not_accepted() {
        let tmp = tempdir().unwrap();
        let store = open_chunks(tmp.path(), 1024 * 1024);

        store.put("k".to_string(), b"v1").unwrap();
        let second = store.put_if_absent("k".to_string(), b"v2").unwrap();
        assert!(second.is_none());
        assert_eq!(store.get(&"k".to_string()).unwrap(), Some(b"v1".to_vec()));

        // A fresh key is accepted.
        assert!(store.put_if_absent("other".to_string(), b"v").unwrap().is_some());

        // And so is a deleted one.
        store.delete(&"k".to_string()).unwrap();
        assert!(store.put_if_absent("k".to_string(), b"v3").unwrap().is_some());
        assert_eq!(store.get(&"k".to_string()).unwrap(), Some(b"v3".to_vec()));
        store.close().unwrap();
    }

    #[test]
    fn tombstone_hides_key_before_compaction() {
        let tmp = tempdir().unwrap();
        let store = open_chunks(tmp.path(), 1024 * 1024);

        store.put("k".to_string(), b"value").unwrap();
        let used_before = store.stats().unwrap().used_bytes;

        assert!(store.delete(&"k".to_string()).unwrap());
        assert_eq!(store.get(&"k".to_string()).unwrap(), None);
        assert!(!store.delete(&"k".to_string()).unwrap());

        // The bytes are still on disk, just marked.
        let stats = store.stats().unwrap();
        assert_eq!(stats.used_bytes, used_before);
        assert!(stats.removed_bytes > 0);
        store.close().unwrap();
    }

    #[test]
    fn put_over_existing_key_supersedes_old_record() {
        let tmp = tempdir().unwrap();
        let store = open_chunks(tmp.path(), 1024 * 1024);

        store.put("k".to_string(), b"old-value").unwrap();
        store.put("k".to_string(), b"new-value").unwrap();

        assert_eq!(
            store.get(&"k".to_string()).unwrap(),
            Some(b"new-value".to_vec())
        );
        // The superseded record counts as garbage.
        assert!(store.stats().unwrap().removed_bytes > 0);
        store.close().unwrap();
    }

    #[test]
    fn compaction_preserves_live_set() {
        let tmp = tempdir().unwrap();
        let store = Store::open(
            tmp.path(),
            config(4096).deleted_ratio(0.0),
        )
        .unwrap();

        for i in 0..50u32 {
            store
                .put(format!("key-{i}"), format!("value-{i}").as_bytes())
                .unwrap();
        }
        for i in (0..50u32).step_by(3) {
            store.delete(&format!("key-{i}")).unwrap();
        }

        let mut live_before: Vec<String> = store.list_keys().unwrap();
        live_before.sort();

        let compacted = store.compact_now().unwrap();
        assert!(compacted > 0);

        let mut live_after: Vec<String> = store.list_keys().unwrap();
        live_after.sort();
        assert_eq!(live_before, live_after);

        for key in &live_after {
            let i: u32 = key.strip_prefix("key-").unwrap().parse().unwrap();
            assert_eq!(
                store.get(key).unwrap(),
                Some(format!("value-{i}").into_bytes())
            );
        }
        store.close().unwrap();
    }

    #[test]
    fn concrete_two_record_scenario() {
        let tmp = tempdir().unwrap();
        let store = Store::open(
            tmp.path(),
            config(1024).deleted_ratio(0.0),
        )
        .unwrap();

        let loc_a = store.put("a.png".to_string(), &[0xAA; 100]).unwrap();
        let loc_b = store.put("b.png".to_string(), &[0xBB; 50]).unwrap();

        // Both land in segment 0; a.png's record is 8 + 5 + 100 bytes.
        assert_eq!(loc_a.segment, SegmentId::new(0));
        assert_eq!(loc_a.offset, 0);
        assert_eq!(loc_b.segment, SegmentId::new(0));
        assert_eq!(loc_b.offset, 113);

        assert!(store.delete(&"a.png".to_string()).unwrap());
        assert_eq!(store.get(&"a.png".to_string()).unwrap(), None);
        assert_eq!(
            store.get(&"b.png".to_string()).unwrap(),
            Some(vec![0xBB; 50])
        );

        // With the threshold at 0%, compaction shifts b.png to offset 0.
        assert_eq!(store.compact_now().unwrap(), 1);
        let stats = store.stats().unwrap();
        assert_eq!(stats.used_bytes, 63);
        assert_eq!(stats.removed_bytes, 0);
        assert_eq!(
            store.get(&"b.png".to_string()).unwrap(),
            Some(vec![0xBB; 50])
        );
        store.close().unwrap();
    }

    #[test]
    fn full_segment_rolls_over() {
        let tmp = tempdir().unwrap();
        // Exactly 1024 id records of 16 bytes (12-byte header + 4-byte
        // value) fill one segment.
        let store: BlockStore = Store::open(tmp.path(), config(16 * 1024)).unwrap();

        for id in 0..1024u64 {
            let location = store.put(id, &(id as u32).to_le_bytes()).unwrap();
            assert_eq!(location.segment, SegmentId::new(0));
        }

        let overflow = store.put(9999, &[0xFF; 4]).unwrap();
        assert_eq!(overflow.segment, SegmentId::new(1));

        assert_eq!(store.get(&0).unwrap(), Some(0u32.to_le_bytes().to_vec()));
        assert_eq!(store.get(&9999).unwrap(), Some(vec![0xFF; 4]));
        store.close().unwrap();
    }

    #[test]
    fn oversized_record_rejected() {
        let tmp = tempdir().unwrap();
        let store = open_chunks(tmp.path(), 256);

        let result = store.put("big".to_string(), &[0u8; 512]);
        assert!(matches!(result, Err(CoreError::RecordTooLarge { .. })));
        assert_eq!(store.get(&"big".to_string()).unwrap(), None);
        store.close().unwrap();
    }

    #[test]
    fn empty_key_rejected() {
        let tmp = tempdir().unwrap();
        let store = open_chunks(tmp.path(), 1024);

        let result = store.put(String::new(), b"v");
        assert!(matches!(result, Err(CoreError::InvalidKey { .. })));
        assert_eq!(store.stats().unwrap().used_bytes, 0);
        store.close().unwrap();
    }

    #[test]
    fn recovery_from_hint() {
        let tmp = tempdir().unwrap();

        {
            let store = open_chunks(tmp.path(), 4096);
            for i in 0..20u32 {
                store.put(format!("k{i}"), format!("v{i}").as_bytes()).unwrap();
            }
            for i in 0..5u32 {
                store.delete(&format!("k{i}")).unwrap();
            }
            store.close().unwrap();
        }
        assert!(tmp.path().join("hint.log").exists());

        let store = open_chunks(tmp.path(), 4096);
        for i in 0..5u32 {
            assert_eq!(store.get(&format!("k{i}")).unwrap(), None);
        }
        for i in 5..20u32 {
            assert_eq!(
                store.get(&format!("k{i}")).unwrap(),
                Some(format!("v{i}").into_bytes())
            );
        }
        store.close().unwrap();
    }

    #[test]
    fn recovery_without_hint_scans_segments() {
        let tmp = tempdir().unwrap();

        {
            let store = open_chunks(tmp.path(), 4096);
            for i in 0..20u32 {
                store.put(format!("k{i}"), format!("v{i}").as_bytes()).unwrap();
            }
            store.delete(&"k3".to_string()).unwrap();
            store.close().unwrap();
        }

        // Deleting the hint must never lose data.
        std::fs::remove_file(tmp.path().join("hint.log")).unwrap();

        let store = open_chunks(tmp.path(), 4096);
        assert_eq!(store.get(&"k3".to_string()).unwrap(), None);
        for i in (0..20u32).filter(|i| *i != 3) {
            assert_eq!(
                store.get(&format!("k{i}")).unwrap(),
                Some(format!("v{i}").into_bytes())
            );
        }
        store.close().unwrap();
    }

    #[test]
    fn recovery_after_unclean_shutdown() {
        let tmp = tempdir().unwrap();

        {
            let store = open_chunks(tmp.path(), 4096);
            store.put("kept".to_string(), b"value").unwrap();
            store.put("deleted".to_string(), b"gone").unwrap();
            store.delete(&"deleted".to_string()).unwrap();
            // Dropped without close: no hint snapshot is written.
            drop(store);
        }
        assert!(!tmp.path().join("hint.log").exists());

        let store = open_chunks(tmp.path(), 4096);
        assert_eq!(
            store.get(&"kept".to_string()).unwrap(),
            Some(b"value".to_vec())
        );
        assert_eq!(store.get(&"deleted".to_string()).unwrap(), None);
        store.close().unwrap();
    }

    #[test]
    fn hint_plus_tail_recovers_post_hint_writes() {
        let tmp = tempdir().unwrap();

        {
            let store = Store::open(
                tmp.path(),
                config(4096).deleted_ratio(0.0),
            )
            .unwrap();
            store.put("old".to_string(), b"1").unwrap();
            store.delete(&"old".to_string()).unwrap();
            // Compaction writes a hint snapshot...
            store.compact_now().unwrap();
            // ...and these land after its watermarks.
            store.put("tail-1".to_string(), b"2").unwrap();
            store.put("tail-2".to_string(), b"3").unwrap();
            store.delete(&"tail-1".to_string()).unwrap();
            drop(store);
        }
        assert!(tmp.path().join("hint.log").exists());

        let store = open_chunks(tmp.path(), 4096);
        assert_eq!(store.get(&"old".to_string()).unwrap(), None);
        assert_eq!(store.get(&"tail-1".to_string()).unwrap(), None);
        assert_eq!(store.get(&"tail-2".to_string()).unwrap(), Some(b"3".to_vec()));
        store.close().unwrap();
    }

    #[test]
    fn merge_collapses_to_segment_zero() {
        let tmp = tempdir().unwrap();
        // Small capacity forces several segments.
        let store = open_chunks(tmp.path(), 256);

        for i in 0..20u32 {
            store.put(format!("k{i:02}"), vec![i as u8; 64].as_slice()).unwrap();
        }
        for i in (0..20u32).step_by(2) {
            store.delete(&format!("k{i:02}")).unwrap();
        }
        assert!(store.stats().unwrap().segments > 1);

        let stats = store.merge_now().unwrap();
        assert_eq!(stats.migrated_records, 10);
        assert!(stats.segments_destroyed > 0);

        // One segment remains, named <store>_chunk_0, plus a fresh hint.
        assert_eq!(store.stats().unwrap().segments, 1);
        assert!(tmp.path().join("chunks_chunk_0").exists());
        assert!(!tmp.path().join("chunks_merged_chunks").exists());
        assert!(tmp.path().join("hint.log").exists());

        for i in 0..20u32 {
            let expected = if i % 2 == 0 {
                None
            } else {
                Some(vec![i as u8; 64])
            };
            assert_eq!(store.get(&format!("k{i:02}")).unwrap(), expected);
        }

        // The store keeps working after the merge.
        store.put("post-merge".to_string(), b"ok").unwrap();
        assert_eq!(
            store.get(&"post-merge".to_string()).unwrap(),
            Some(b"ok".to_vec())
        );
        store.close().unwrap();
    }

    #[test]
    fn merge_then_reopen() {
        let tmp = tempdir().unwrap();

        {
            let store = open_chunks(tmp.path(), 256);
            for i in 0..12u32 {
                store.put(format!("k{i}"), vec![i as u8; 48].as_slice()).unwrap();
            }
            store.delete(&"k0".to_string()).unwrap();
            store.merge_now().unwrap();
            store.close().unwrap();
        }

        let store = open_chunks(tmp.path(), 256);
        assert_eq!(store.get(&"k0".to_string()).unwrap(), None);
        for i in 1..12u32 {
            assert_eq!(
                store.get(&format!("k{i}")).unwrap(),
                Some(vec![i as u8; 48])
            );
        }
        store.close().unwrap();
    }

    #[test]
    fn mmap_strategy_matches_direct() {
        let tmp = tempdir().unwrap();

        {
            let store = Store::open(
                tmp.path(),
                config(4096).read_strategy(ReadStrategy::Mmap),
            )
            .unwrap();
            store.put("m1".to_string(), b"mapped-1").unwrap();
            store.put("m2".to_string(), b"mapped-2").unwrap();
            store.delete(&"m1".to_string()).unwrap();
            assert_eq!(store.get(&"m2".to_string()).unwrap(), Some(b"mapped-2".to_vec()));
            store.close().unwrap();
        }

        // Reopen with the direct strategy; results must be identical.
        let store = open_chunks(tmp.path(), 4096);
        assert_eq!(store.get(&"m1".to_string()).unwrap(), None);
        assert_eq!(store.get(&"m2".to_string()).unwrap(), Some(b"mapped-2".to_vec()));
        store.close().unwrap();
    }

    #[test]
    fn closed_store_rejects_operations() {
        let tmp = tempdir().unwrap();
        let store = open_chunks(tmp.path(), 1024);
        store.close().unwrap();

        assert!(matches!(
            store.put("k".to_string(), b"v"),
            Err(CoreError::StoreClosed)
        ));
        assert!(matches!(
            store.get(&"k".to_string()),
            Err(CoreError::StoreClosed)
        ));
        // Closing twice is fine.
        store.close().unwrap();
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashMap;

        #[derive(Debug, Clone)]
        enum Op {
            Put(u8, Vec<u8>),
            Delete(u8),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (any::<u8>(), prop::collection::vec(any::<u8>(), 0..64))
                    .prop_map(|(k, v)| Op::Put(k, v)),
                any::<u8>().prop_map(Op::Delete),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]

            /// Any op sequence leaves the store equivalent to a plain map,
            /// and compaction, merge, and reopen all preserve that state.
            #[test]
            fn store_matches_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
                let tmp = tempdir().unwrap();
                let mut model: HashMap<String, Vec<u8>> = HashMap::new();

                {
                    let store = Store::open(
                        tmp.path(),
                        config(2048).deleted_ratio(0.0),
                    )
                    .unwrap();

                    for op in &ops {
                        match op {
                            Op::Put(k, v) => {
                                let key = format!("key-{k}");
                                store.put(key.clone(), v).unwrap();
                                model.insert(key, v.clone());
                            }
                            Op::Delete(k) => {
                                let key = format!("key-{k}");
                                let removed = store.delete(&key).unwrap();
                                prop_assert_eq!(removed, model.remove(&key).is_some());
                            }
                        }
                    }

                    for k in 0..=u8::MAX {
                        let key = format!("key-{k}");
                        prop_assert_eq!(store.get(&key).unwrap(), model.get(&key).cloned());
                    }

                    store.compact_now().unwrap();
                    for (key, value) in &model {
                        let got = store.get(key).unwrap();
                        prop_assert_eq!(got.as_ref(), Some(value));
                    }

                    store.merge_now().unwrap();
                    for (key, value) in &model {
                        let got = store.get(key).unwrap();
                        prop_assert_eq!(got.as_ref(), Some(value));
                    }

                    store.close().unwrap();
                }

                let store = Store::open(tmp.path(), config(2048)).unwrap();
                for k in 0..=u8::MAX {
                    let key = format!("key-{k}");
                    prop_assert_eq!(store.get(&key).unwrap(), model.get(&key).cloned());
                }
                store.close().unwrap();
            }
        }
    }
}
