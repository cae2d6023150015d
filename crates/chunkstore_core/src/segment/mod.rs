//! Append-only segment files.
//!
//! A segment is one backing file holding a sequence of length-prefixed
//! records (see [`crate::key`] for the two record layouts). Records are
//! immutable once written; deletion flips the value-length field to its
//! tombstone form in place and never rewrites payload bytes.
//!
//! Each segment is protected by a single read/write lock: reads share it,
//! appends and tombstone marks take it exclusively for one file operation,
//! and compaction holds it exclusively for the whole rewrite so no reader
//! can observe a stale offset.

mod allocator;
mod compaction;

pub use allocator::SegmentAllocator;
pub use compaction::{CompactionStats, Compactor, MergeStats};

use crate::error::{CoreError, CoreResult};
use crate::index::KeyIndex;
use crate::key::{tombstone_value_len, RecordKey};
use crate::types::SegmentId;
use chunkstore_storage::{StorageBackend, StorageError};
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::path::PathBuf;
use tracing::warn;

/// Outcome of an indexed append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The record was written at this offset and the index was updated.
    Written(u64),
    /// The index callback rejected the write; the bytes were rolled back.
    RolledBack,
    /// The segment can no longer accept writes (destroyed by compaction).
    Unavailable,
}

/// Outcome of a positional record read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The record is live; here is its value.
    Value(Vec<u8>),
    /// The record is tombstoned.
    Tombstoned,
    /// The record at this offset does not belong to the requested key.
    ///
    /// Seen when an index offset went stale across a concurrent
    /// compaction; callers re-read the index and retry.
    KeyMismatch,
}

/// Outcome of an in-place tombstone mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The record was live and is now tombstoned.
    Marked,
    /// The record was already tombstoned.
    AlreadyRemoved,
    /// The record at this offset does not belong to the requested key.
    KeyMismatch,
}

/// One record found by a sequential scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRecord<K> {
    /// The record's key.
    pub key: K,
    /// Record start offset.
    pub offset: u64,
    /// Value length in bytes.
    pub value_len: u32,
    /// Full record length (prefix + key material + value).
    pub record_len: u32,
    /// Whether the record is tombstoned.
    pub tombstone: bool,
}

/// A record header probed at a known offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedRecord<K> {
    /// The record's key.
    pub key: K,
    /// Value length in bytes.
    pub value_len: u32,
    /// Full record length.
    pub record_len: u32,
    /// Whether the record is tombstoned.
    pub tombstone: bool,
}

/// Counters for one segment, taken at a single point in time.
#[derive(Debug, Clone, Copy)]
pub struct SegmentStats {
    /// Segment id.
    pub id: SegmentId,
    /// Maximum file size.
    pub capacity: u64,
    /// Bytes written so far.
    pub used_bytes: u64,
    /// Bytes belonging to tombstoned or superseded records.
    pub removed_bytes: u64,
    /// Whether the segment has been destroyed.
    pub dead: bool,
}

impl SegmentStats {
    /// Remaining writable capacity.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.capacity.saturating_sub(self.used_bytes)
    }

    /// Deleted-bytes ratio; 0.0 for an empty segment.
    #[must_use]
    pub fn deleted_ratio(&self) -> f64 {
        if self.used_bytes == 0 {
            0.0
        } else {
            self.removed_bytes as f64 / self.used_bytes as f64
        }
    }
}

struct SegmentInner {
    backend: Box<dyn StorageBackend>,
    used_bytes: u64,
    removed_bytes: u64,
    dead: bool,
}

/// One append-only segment file.
pub struct Segment<K: RecordKey> {
    id: SegmentId,
    capacity: u64,
    path: Option<PathBuf>,
    sync_on_write: bool,
    inner: RwLock<SegmentInner>,
    _key: PhantomData<K>,
}

impl<K: RecordKey> Segment<K> {
    /// Creates a segment over an opened backend.
    ///
    /// `path` is the backing file to delete on [`Self::destroy`]; `None`
    /// for in-memory segments.
    pub fn new(
        id: SegmentId,
        capacity: u64,
        backend: Box<dyn StorageBackend>,
        path: Option<PathBuf>,
        sync_on_write: bool,
    ) -> CoreResult<Self> {
        let used_bytes = backend.size()?;
        Ok(Self {
            id,
            capacity,
            path,
            sync_on_write,
            inner: RwLock::new(SegmentInner {
                backend,
                used_bytes,
                removed_bytes: 0,
                dead: false,
            }),
            _key: PhantomData,
        })
    }

    /// Segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Maximum file size.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current counters.
    pub fn stats(&self) -> SegmentStats {
        let inner = self.inner.read();
        SegmentStats {
            id: self.id,
            capacity: self.capacity,
            used_bytes: inner.used_bytes,
            removed_bytes: inner.removed_bytes,
            dead: inner.dead,
        }
    }

    /// Remaining writable capacity.
    pub fn free_bytes(&self) -> u64 {
        self.stats().free_bytes()
    }

    /// Adds to the removed-bytes counter (recovery bookkeeping).
    pub fn add_removed_bytes(&self, bytes: u64) {
        self.inner.write().removed_bytes += bytes;
    }

    /// Appends an encoded record and lets `decide` update the index while
    /// the segment's write lock is still held.
    ///
    /// `decide` receives the record's offset and returns whether to keep
    /// the write; on `false` the bytes are truncated away again. Holding
    /// the lock across both the file append and the index update is what
    /// keeps compaction from remapping a record the index doesn't know
    /// about yet.
    pub fn append_indexed<F>(&self, record: &[u8], decide: F) -> CoreResult<AppendOutcome>
    where
        F: FnOnce(u64) -> bool,
    {
        let mut inner = self.inner.write();
        if inner.dead {
            return Ok(AppendOutcome::Unavailable);
        }

        let offset = inner.backend.append(record)?;

        if decide(offset) {
            inner.used_bytes += record.len() as u64;
            if self.sync_on_write {
                inner.backend.flush()?;
            }
            Ok(AppendOutcome::Written(offset))
        } else {
            inner.backend.truncate(offset)?;
            Ok(AppendOutcome::RolledBack)
        }
    }

    /// Reads the record at `offset`, validating that it belongs to `key`.
    ///
    /// The stored key is always re-checked against the requested one before
    /// any payload byte is returned, which is what catches stale offsets
    /// left behind by a concurrent compaction.
    pub fn read_value(&self, key: &K, offset: u64) -> CoreResult<ReadOutcome> {
        let inner = self.inner.read();
        if inner.dead {
            return Err(CoreError::SegmentGone { segment: self.id });
        }

        let Some((found_key, value_len, tombstone, _)) = Self::header_at(&inner, offset)?
        else {
            return Ok(ReadOutcome::KeyMismatch);
        };
        if found_key != *key {
            return Ok(ReadOutcome::KeyMismatch);
        }
        if tombstone {
            return Ok(ReadOutcome::Tombstoned);
        }

        let value_offset = offset + K::PREFIX_LEN as u64 + key.key_material_len() as u64;
        match inner.backend.read_at(value_offset, value_len as usize) {
            Ok(value) => Ok(ReadOutcome::Value(value)),
            Err(StorageError::ReadPastEnd { .. }) => Ok(ReadOutcome::KeyMismatch),
            Err(e) => Err(e.into()),
        }
    }

    /// Tombstones the record at `offset` in place.
    ///
    /// The stored key is re-validated against `key` first; the mark itself
    /// is a 4-byte patch of the value-length field.
    pub fn mark_removed(&self, key: &K, offset: u64) -> CoreResult<MarkOutcome> {
        let mut inner = self.inner.write();
        if inner.dead {
            return Err(CoreError::SegmentGone { segment: self.id });
        }

        let Some((found_key, value_len, tombstone, record_len)) =
            Self::header_at(&inner, offset)?
        else {
            return Ok(MarkOutcome::KeyMismatch);
        };
        if found_key != *key {
            return Ok(MarkOutcome::KeyMismatch);
        }
        if tombstone {
            return Ok(MarkOutcome::AlreadyRemoved);
        }

        let raw = tombstone_value_len(value_len);
        inner
            .backend
            .write_at(offset + K::VALUE_LEN_OFFSET, &raw.to_le_bytes())?;
        if self.sync_on_write {
            inner.backend.flush()?;
        }
        inner.removed_bytes += u64::from(record_len);

        Ok(MarkOutcome::Marked)
    }

    /// Probes the record header at a known offset.
    ///
    /// Returns `Ok(None)` when the bytes at `offset` do not parse as a
    /// record. Used by hint-log validation, which knows offsets but not
    /// lengths.
    pub fn probe_record(&self, offset: u64) -> CoreResult<Option<ProbedRecord<K>>> {
        let inner = self.inner.read();
        if inner.dead {
            return Err(CoreError::SegmentGone { segment: self.id });
        }

        Ok(Self::header_at(&inner, offset)?.map(|(key, value_len, tombstone, record_len)| {
            ProbedRecord {
                key,
                value_len,
                tombstone,
                record_len,
            }
        }))
    }

    /// Sequentially scans records starting at `from`.
    ///
    /// Stops at the first structurally invalid record and returns the
    /// records before it together with the offset where scanning stopped.
    pub fn scan(&self, from: u64) -> CoreResult<(Vec<ScannedRecord<K>>, u64)> {
        let inner = self.inner.read();
        if inner.dead {
            return Err(CoreError::SegmentGone { segment: self.id });
        }
        Self::scan_inner(&inner, from)
    }

    /// Scans from `from` and truncates any invalid tail left by an unclean
    /// shutdown.
    ///
    /// Everything before the first structurally invalid record is valid;
    /// everything after it is lost.
    pub fn recover_scan(&self, from: u64) -> CoreResult<Vec<ScannedRecord<K>>> {
        let mut inner = self.inner.write();
        if inner.dead {
            return Err(CoreError::SegmentGone { segment: self.id });
        }

        let (records, valid_end) = Self::scan_inner(&inner, from)?;

        if valid_end < inner.used_bytes {
            warn!(
                segment = %self.id,
                lost = inner.used_bytes - valid_end,
                "truncating invalid segment tail"
            );
            inner.backend.truncate(valid_end)?;
            inner.used_bytes = valid_end;
        }

        Ok(records)
    }

    /// Compacts the segment in place, holding the exclusive lock for the
    /// whole rewrite.
    ///
    /// Tombstoned records and records the index no longer confirms at their
    /// current location are dropped by shifting the following live bytes
    /// left (one read-modify-write per contiguous run, not per record);
    /// the file is then truncated to its new size. Index entries for the
    /// survivors are rewritten before the lock is released, so no reader
    /// observes a stale offset.
    pub fn compact_indexed(&self, index: &KeyIndex<K>) -> CoreResult<CompactionStats> {
        let mut inner = self.inner.write();
        if inner.dead {
            return Err(CoreError::SegmentGone { segment: self.id });
        }

        // Tail garbage past the last valid record is dropped along with
        // the tombstoned runs by the truncate below.
        let (records, _) = Self::scan_inner(&inner, 0)?;
        let old_used = inner.used_bytes;

        // Surviving records are coalesced into contiguous runs; each run is
        // shifted left with one read and one write.
        fn close_run<K: RecordKey>(
            inner: &mut SegmentInner,
            run_start: &mut Option<u64>,
            run_end: u64,
            pending: &mut Vec<(K, u64)>,
            remapped: &mut Vec<(K, u64, u64)>,
            write_cursor: &mut u64,
        ) -> CoreResult<()> {
            let Some(start) = run_start.take() else {
                return Ok(());
            };
            let len = run_end - start;
            if start != *write_cursor {
                let bytes = inner.backend.read_at(start, len as usize)?;
                inner.backend.write_at(*write_cursor, &bytes)?;
            }
            for (key, old_offset) in pending.drain(..) {
                let new_offset = *write_cursor + (old_offset - start);
                remapped.push((key, old_offset, new_offset));
            }
            *write_cursor += len;
            Ok(())
        }

        let mut remapped: Vec<(K, u64, u64)> = Vec::new();
        let mut dropped_tombstones: Vec<(K, u64)> = Vec::new();
        let mut live_records = 0usize;
        let mut dropped_records = 0usize;

        let mut write_cursor: u64 = 0;
        let mut run_start: Option<u64> = None;
        let mut run_end: u64 = 0;
        let mut pending: Vec<(K, u64)> = Vec::new();

        for record in &records {
            let keep =
                !record.tombstone && index.confirms(&record.key, self.id, record.offset);

            if keep {
                live_records += 1;
                if run_start.is_none() {
                    run_start = Some(record.offset);
                }
                run_end = record.offset + u64::from(record.record_len);
                pending.push((record.key.clone(), record.offset));
            } else {
                dropped_records += 1;
                if record.tombstone {
                    dropped_tombstones.push((record.key.clone(), record.offset));
                }
                close_run(
                    &mut inner,
                    &mut run_start,
                    run_end,
                    &mut pending,
                    &mut remapped,
                    &mut write_cursor,
                )?;
            }
        }
        close_run(
            &mut inner,
            &mut run_start,
            run_end,
            &mut pending,
            &mut remapped,
            &mut write_cursor,
        )?;

        inner.backend.truncate(write_cursor)?;
        inner.backend.sync()?;

        let reclaimed = old_used - write_cursor;
        inner.used_bytes = write_cursor;
        inner.removed_bytes = 0;

        // Index rewrite happens inside the same critical section.
        index.apply_segment_compaction(self.id, &remapped, &dropped_tombstones);

        Ok(CompactionStats {
            segment: self.id,
            live_records,
            dropped_records,
            reclaimed_bytes: reclaimed,
        })
    }

    /// Flushes pending writes to the OS.
    pub fn flush(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.backend.flush()?;
        Ok(())
    }

    /// Syncs data and metadata to disk.
    pub fn sync(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        inner.backend.sync()?;
        Ok(())
    }

    /// Destroys the segment: marks it dead and deletes the backing file.
    ///
    /// Subsequent reads and writes fail with `SegmentGone` /
    /// [`AppendOutcome::Unavailable`].
    pub fn destroy(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        if inner.dead {
            return Ok(());
        }
        inner.dead = true;

        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Whether the segment has been destroyed.
    pub fn is_dead(&self) -> bool {
        self.inner.read().dead
    }

    /// Parses the record header at `offset`: `(key, value_len, tombstone,
    /// record_len)`, or `None` when the bytes do not form a record for
    /// this key kind.
    fn header_at(
        inner: &SegmentInner,
        offset: u64,
    ) -> CoreResult<Option<(K, u32, bool, u32)>> {
        let prefix_buf = match inner.backend.read_at(offset, K::PREFIX_LEN) {
            Ok(buf) => buf,
            Err(StorageError::ReadPastEnd { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(prefix) = K::parse_prefix(&prefix_buf) else {
            return Ok(None);
        };

        let value_len = prefix.value_len();
        let record_len = K::PREFIX_LEN + prefix.key_material_len + value_len as usize;
        if offset + record_len as u64 > inner.used_bytes {
            return Ok(None);
        }

        let is_tombstone = prefix.is_tombstone();
        let key = match prefix.inline_key {
            Some(key) => key,
            None => {
                let material = match inner
                    .backend
                    .read_at(offset + K::PREFIX_LEN as u64, prefix.key_material_len)
                {
                    Ok(buf) => buf,
                    Err(StorageError::ReadPastEnd { .. }) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                match K::decode_key(&material) {
                    Some(key) => key,
                    None => return Ok(None),
                }
            }
        };

        Ok(Some((key, value_len, is_tombstone, record_len as u32)))
    }

    fn scan_inner(
        inner: &SegmentInner,
        from: u64,
    ) -> CoreResult<(Vec<ScannedRecord<K>>, u64)> {
        let size = inner.used_bytes;
        let mut records = Vec::new();
        let mut offset = from;

        while offset + K::PREFIX_LEN as u64 <= size {
            let prefix_buf = inner.backend.read_at(offset, K::PREFIX_LEN)?;
            let Some(prefix) = K::parse_prefix(&prefix_buf) else {
                break;
            };

            let value_len = prefix.value_len();
            let record_len = K::PREFIX_LEN + prefix.key_material_len + value_len as usize;
            if offset + record_len as u64 > size {
                break;
            }

            let is_tombstone = prefix.is_tombstone();
            let key = match prefix.inline_key {
                Some(key) => key,
                None => {
                    let material = inner
                        .backend
                        .read_at(offset + K::PREFIX_LEN as u64, prefix.key_material_len)?;
                    match K::decode_key(&material) {
                        Some(key) => key,
                        None => break,
                    }
                }
            };

            records.push(ScannedRecord {
                key,
                offset,
                value_len,
                record_len: record_len as u32,
                tombstone: is_tombstone,
            });

            offset += record_len as u64;
        }

        Ok((records, offset))
    }
}

impl<K: RecordKey> std::fmt::Debug for Segment<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("used_bytes", &stats.used_bytes)
            .field("removed_bytes", &stats.removed_bytes)
            .field("dead", &stats.dead)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkstore_storage::InMemoryBackend;

    fn mem_segment() -> Segment<String> {
        Segment::new(
            SegmentId::new(0),
            1024 * 1024,
            Box::new(InMemoryBackend::new()),
            None,
            false,
        )
        .unwrap()
    }

    fn put(seg: &Segment<String>, index: &KeyIndex<String>, key: &str, value: &[u8]) -> u64 {
        let key_owned = key.to_string();
        let record = key_owned.encode_record(value);
        match seg
            .append_indexed(&record, |offset| {
                index.upsert(
                    key_owned.clone(),
                    crate::index::IndexEntry::new(seg.id(), offset, value.len() as u32),
                );
                true
            })
            .unwrap()
        {
            AppendOutcome::Written(offset) => offset,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn append_and_read_roundtrip() {
        let seg = mem_segment();
        let index = KeyIndex::new();

        let offset = put(&seg, &index, "a.png", b"payload");
        assert_eq!(offset, 0);

        let outcome = seg.read_value(&"a.png".to_string(), offset).unwrap();
        assert_eq!(outcome, ReadOutcome::Value(b"payload".to_vec()));
    }

    #[test]
    fn read_validates_key() {
        let seg = mem_segment();
        let index = KeyIndex::new();

        let offset = put(&seg, &index, "a.png", b"payload");

        let outcome = seg.read_value(&"b.png".to_string(), offset).unwrap();
        assert_eq!(outcome, ReadOutcome::KeyMismatch);

        // An offset into the middle of a record doesn't parse as one.
        let outcome = seg.read_value(&"a.png".to_string(), offset + 3).unwrap();
        assert_eq!(outcome, ReadOutcome::KeyMismatch);
    }

    #[test]
    fn mark_removed_flips_tombstone_in_place() {
        let seg = mem_segment();
        let index = KeyIndex::new();

        let offset = put(&seg, &index, "a.png", b"payload");
        let used_before = seg.stats().used_bytes;

        let outcome = seg.mark_removed(&"a.png".to_string(), offset).unwrap();
        assert_eq!(outcome, MarkOutcome::Marked);

        // Bytes still on disk, record reads as tombstoned.
        assert_eq!(seg.stats().used_bytes, used_before);
        assert_eq!(
            seg.read_value(&"a.png".to_string(), offset).unwrap(),
            ReadOutcome::Tombstoned
        );
        assert_eq!(seg.stats().removed_bytes, used_before);

        // Second mark is a no-op.
        assert_eq!(
            seg.mark_removed(&"a.png".to_string(), offset).unwrap(),
            MarkOutcome::AlreadyRemoved
        );
    }

    #[test]
    fn mark_removed_validates_key() {
        let seg = mem_segment();
        let index = KeyIndex::new();

        let offset = put(&seg, &index, "a.png", b"payload");
        assert_eq!(
            seg.mark_removed(&"z.png".to_string(), offset).unwrap(),
            MarkOutcome::KeyMismatch
        );
        assert_eq!(seg.stats().removed_bytes, 0);
    }

    #[test]
    fn rolled_back_append_leaves_no_bytes() {
        let seg = mem_segment();
        let record = "dup".to_string().encode_record(b"v2");

        let before = seg.stats().used_bytes;
        let outcome = seg.append_indexed(&record, |_| false).unwrap();
        assert_eq!(outcome, AppendOutcome::RolledBack);
        assert_eq!(seg.stats().used_bytes, before);
    }

    #[test]
    fn scan_finds_all_records() {
        let seg = mem_segment();
        let index = KeyIndex::new();

        put(&seg, &index, "a", b"1");
        put(&seg, &index, "b", b"22");
        let offset_c = put(&seg, &index, "c", b"333");

        let (records, end) = seg.scan(0).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].offset, offset_c);
        assert_eq!(end, seg.stats().used_bytes);
    }

    #[test]
    fn scan_stops_at_corrupt_record() {
        let seg = mem_segment();
        let index = KeyIndex::new();

        put(&seg, &index, "good", b"data");
        let used = seg.stats().used_bytes;

        // Append garbage that cannot parse as a record prefix.
        let garbage = vec![0u8; 12];
        seg.append_indexed(&garbage, |_| true).unwrap();

        let (records, end) = seg.scan(0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(end, used);
    }

    #[test]
    fn recover_scan_truncates_tail() {
        let seg = mem_segment();
        let index = KeyIndex::new();

        put(&seg, &index, "good", b"data");
        let used = seg.stats().used_bytes;

        let garbage = vec![0u8; 12];
        seg.append_indexed(&garbage, |_| true).unwrap();
        assert!(seg.stats().used_bytes > used);

        let records = seg.recover_scan(0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(seg.stats().used_bytes, used);
    }

    #[test]
    fn compact_shifts_survivors_left() {
        let seg = mem_segment();
        let index = KeyIndex::new();

        let offset_a = put(&seg, &index, "a.png", b"a".repeat(100).as_slice());
        let offset_b = put(&seg, &index, "b.png", b"b".repeat(50).as_slice());
        assert_eq!(offset_a, 0);
        // 8-byte prefix + 5-byte key + 100-byte value.
        assert_eq!(offset_b, 113);

        seg.mark_removed(&"a.png".to_string(), offset_a).unwrap();
        index.mark_tombstone(&"a.png".to_string());

        let stats = seg.compact_indexed(&index).unwrap();
        assert_eq!(stats.live_records, 1);
        assert_eq!(stats.dropped_records, 1);
        assert_eq!(stats.reclaimed_bytes, 113);

        // b.png now lives at offset 0 and the index agrees.
        let entry = index.get(&"b.png".to_string()).unwrap();
        assert_eq!(entry.offset, 0);
        assert_eq!(
            seg.read_value(&"b.png".to_string(), 0).unwrap(),
            ReadOutcome::Value(b"b".repeat(50))
        );

        // a.png's tombstoned entry was purged.
        assert!(index.get(&"a.png".to_string()).is_none());
        assert_eq!(seg.stats().removed_bytes, 0);
        assert_eq!(seg.stats().used_bytes, 63);
    }

    #[test]
    fn compact_preserves_record_order() {
        let seg = mem_segment();
        let index = KeyIndex::new();

        for i in 0..10u32 {
            put(&seg, &index, &format!("k{i}"), format!("v{i}").as_bytes());
        }
        // Delete every other key.
        for i in (0..10u32).step_by(2) {
            let key = format!("k{i}");
            let entry = index.get(&key).unwrap();
            seg.mark_removed(&key, entry.offset).unwrap();
            index.mark_tombstone(&key);
        }

        seg.compact_indexed(&index).unwrap();

        let (records, _) = seg.scan(0).unwrap();
        let keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec!["k1", "k3", "k5", "k7", "k9"]);

        for record in &records {
            assert_eq!(
                index.get(&record.key).unwrap().offset,
                record.offset,
                "index must agree with post-compaction layout"
            );
        }
    }

    #[test]
    fn compact_drops_unconfirmed_records() {
        let seg = mem_segment();
        let index = KeyIndex::new();

        // A record whose index entry points elsewhere is superseded garbage.
        let offset = put(&seg, &index, "moved", b"old");
        index.upsert(
            "moved".to_string(),
            crate::index::IndexEntry::new(SegmentId::new(9), 0, 3),
        );

        let stats = seg.compact_indexed(&index).unwrap();
        assert_eq!(stats.live_records, 0);
        assert_eq!(stats.dropped_records, 1);
        assert_eq!(seg.stats().used_bytes, 0);

        // The foreign entry is untouched.
        let entry = index.get(&"moved".to_string()).unwrap();
        assert_eq!(entry.segment, SegmentId::new(9));
        let _ = offset;
    }

    #[test]
    fn destroyed_segment_rejects_access() {
        let seg = mem_segment();
        let index = KeyIndex::new();
        let offset = put(&seg, &index, "a", b"1");

        seg.destroy().unwrap();
        assert!(seg.is_dead());

        assert!(matches!(
            seg.read_value(&"a".to_string(), offset),
            Err(CoreError::SegmentGone { .. })
        ));
        let record = "b".to_string().encode_record(b"2");
        assert_eq!(
            seg.append_indexed(&record, |_| true).unwrap(),
            AppendOutcome::Unavailable
        );
    }

    #[test]
    fn id_records_roundtrip() {
        let seg: Segment<u64> = Segment::new(
            SegmentId::new(0),
            1024,
            Box::new(InMemoryBackend::new()),
            None,
            false,
        )
        .unwrap();
        let index: KeyIndex<u64> = KeyIndex::new();

        let record = 7u64.encode_record(b"block-bytes");
        let AppendOutcome::Written(offset) = seg
            .append_indexed(&record, |offset| {
                index.upsert(7, crate::index::IndexEntry::new(seg.id(), offset, 11));
                true
            })
            .unwrap()
        else {
            panic!("append failed");
        };

        assert_eq!(
            seg.read_value(&7, offset).unwrap(),
            ReadOutcome::Value(b"block-bytes".to_vec())
        );
        // Wrong id at a valid offset is a mismatch, not a value.
        assert_eq!(seg.read_value(&8, offset).unwrap(), ReadOutcome::KeyMismatch);
    }
}
