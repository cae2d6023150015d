//! Compaction: segment-local rewrites and the store-wide merge.
//!
//! Two space-reclaim strategies share this module:
//!
//! - **Segment-local compaction** rewrites one segment in place when its
//!   deleted-bytes ratio crosses the configured threshold. The rewrite and
//!   the index update happen under the segment's exclusive lock (see
//!   [`Segment::compact_indexed`]); readers of other segments are
//!   unaffected.
//! - **Store-wide merge** migrates every live record, sorted by key, into
//!   one fresh segment that takes over the id-0 slot, then destroys every
//!   old segment. The hint log is removed before the merge starts and
//!   regenerated only after it completes, so a crash mid-merge is detected
//!   at the next startup by its absence and answered with a full rescan.
//!
//! Neither strategy runs on the request path. Failures are logged and
//! retried on the next scheduled pass.

use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::hint::{HintLog, HintSegment};
use crate::index::{IndexEntry, KeyIndex};
use crate::key::RecordKey;
use crate::segment::{AppendOutcome, ReadOutcome, Segment, SegmentAllocator};
use crate::types::SegmentId;
use chunkstore_storage::FileBackend;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one segment-local compaction.
#[derive(Debug, Clone, Copy)]
pub struct CompactionStats {
    /// The compacted segment.
    pub segment: SegmentId,
    /// Records that survived.
    pub live_records: usize,
    /// Records dropped (tombstoned or superseded).
    pub dropped_records: usize,
    /// Bytes reclaimed by the rewrite.
    pub reclaimed_bytes: u64,
}

/// Result of one store-wide merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeStats {
    /// Live records migrated into the merged segment.
    pub migrated_records: usize,
    /// Entries skipped because they were deleted during the merge.
    pub skipped_entries: usize,
    /// Old segments destroyed.
    pub segments_destroyed: usize,
    /// Size of the merged segment in bytes.
    pub merged_bytes: u64,
}

/// Drives both compaction strategies for one store.
pub struct Compactor<K: RecordKey> {
    dir: Arc<StoreDir>,
    allocator: Arc<SegmentAllocator<K>>,
    index: Arc<KeyIndex<K>>,
    hint: Arc<HintLog>,
    /// Store-level gate: request paths hold it shared, the merge takes it
    /// exclusively for its quiesce and swap phases.
    gate: Arc<RwLock<()>>,
    deleted_ratio: f64,
    /// Serializes merges; only one may run at a time.
    merge_lock: Mutex<()>,
}

impl<K: RecordKey> Compactor<K> {
    /// Creates a compactor over the store's shared components.
    pub fn new(
        dir: Arc<StoreDir>,
        allocator: Arc<SegmentAllocator<K>>,
        index: Arc<KeyIndex<K>>,
        hint: Arc<HintLog>,
        gate: Arc<RwLock<()>>,
        deleted_ratio: f64,
    ) -> Self {
        Self {
            dir,
            allocator,
            index,
            hint,
            gate,
            deleted_ratio,
            merge_lock: Mutex::new(()),
        }
    }

    /// Compacts every segment whose deleted-bytes ratio has crossed the
    /// threshold. Returns how many segments were compacted.
    ///
    /// Per-segment failures are logged and skipped; they will be retried
    /// on the next pass.
    pub fn run_threshold_pass(&self) -> usize {
        // A segment-local rewrite would invalidate the merge's snapshot of
        // record locations; defer to a running merge and retry next pass.
        let Some(_serialize) = self.merge_lock.try_lock() else {
            return 0;
        };

        let mut compacted = 0usize;

        for segment in self.allocator.segments() {
            let stats = segment.stats();
            if stats.dead || stats.removed_bytes == 0 {
                continue;
            }
            if stats.deleted_ratio() < self.deleted_ratio {
                continue;
            }

            match segment.compact_indexed(&self.index) {
                Ok(result) => {
                    debug!(
                        segment = %result.segment,
                        reclaimed = result.reclaimed_bytes,
                        live = result.live_records,
                        "compacted segment"
                    );
                    self.allocator.rebucket(&segment);
                    compacted += 1;
                }
                Err(e) => {
                    warn!(segment = %segment.id(), error = %e, "segment compaction failed");
                }
            }
        }

        if compacted > 0 {
            if let Err(e) = self.write_hint_snapshot() {
                warn!(error = %e, "failed to write hint snapshot after compaction");
            }
        }

        compacted
    }

    /// Writes a hint snapshot covering the current index.
    ///
    /// Watermarks are read before the index snapshot: a record appended in
    /// between then appears both in the entries and past a watermark, which
    /// recovery handles; the reverse order could lose it.
    pub fn write_hint_snapshot(&self) -> CoreResult<()> {
        let mut segments = Vec::new();
        for segment in self.allocator.segments() {
            let stats = segment.stats();
            if stats.dead {
                continue;
            }
            segments.push(HintSegment {
                segment: stats.id,
                watermark: stats.used_bytes,
                removed_bytes: stats.removed_bytes,
            });
        }

        let entries: Vec<(K, SegmentId, u64)> = self
            .index
            .snapshot()
            .into_iter()
            .filter(|(_, entry)| !entry.tombstone)
            .map(|(key, entry)| (key, entry.segment, entry.offset))
            .collect();

        self.hint.write_snapshot(&segments, &entries)
    }

    /// Runs a store-wide merge.
    ///
    /// Writes issued while the merge runs land only in freshly created
    /// segments (the free pool is drained up front), so no update is lost
    /// to the destruction of the old segments.
    pub fn merge(&self) -> CoreResult<MergeStats> {
        let _serialize = self.merge_lock.lock();

        // The hint must be gone before any migration byte is written; its
        // absence is the crash marker.
        self.hint.remove()?;

        // Quiesce writers, then snapshot. After this block every write
        // goes to a segment outside the merge set.
        let (old_segments, snapshot) = {
            let _exclusive = self.gate.write();
            self.allocator.drain_pool();
            (self.allocator.segments(), self.index.snapshot())
        };

        if old_segments.is_empty() {
            self.write_hint_snapshot()?;
            return Ok(MergeStats::default());
        }

        let mut live: Vec<(K, IndexEntry)> = snapshot
            .iter()
            .filter(|(_, entry)| !entry.tombstone)
            .cloned()
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));

        // Copy phase: migrate live records, key-sorted, into the scratch
        // segment. Any failure here aborts the pass with the old segments
        // untouched.
        let scratch_path = self.dir.merge_scratch_path();
        if scratch_path.exists() {
            fs::remove_file(&scratch_path)?;
        }

        let copy_result = (|| -> CoreResult<(Vec<(K, IndexEntry, u64, u32)>, usize)> {
            let scratch: Segment<K> = Segment::new(
                SegmentId::MERGED,
                self.allocator.segment_capacity(),
                Box::new(FileBackend::open(&scratch_path)?),
                Some(scratch_path.clone()),
                false,
            )?;

            let mut migrated = Vec::with_capacity(live.len());
            let mut skipped = 0usize;

            for (key, entry) in &live {
                let Some(segment) = self.allocator.get(entry.segment) else {
                    return Err(CoreError::SegmentGone {
                        segment: entry.segment,
                    });
                };

                match segment.read_value(key, entry.offset)? {
                    ReadOutcome::Value(value) => {
                        let record = key.encode_record(&value);
                        match scratch.append_indexed(&record, |_| true)? {
                            AppendOutcome::Written(new_offset) => {
                                migrated.push((
                                    key.clone(),
                                    *entry,
                                    new_offset,
                                    value.len() as u32,
                                ));
                            }
                            _ => {
                                return Err(CoreError::invalid_operation(
                                    "merge scratch rejected append",
                                ))
                            }
                        }
                    }
                    // Deleted (or superseded) while the merge was running;
                    // the current index entry is authoritative.
                    ReadOutcome::Tombstoned | ReadOutcome::KeyMismatch => {
                        skipped += 1;
                    }
                }
            }

            scratch.sync()?;
            Ok((migrated, skipped))
        })();

        let (migrated, skipped) = match copy_result {
            Ok(done) => done,
            Err(e) => {
                let _ = fs::remove_file(&scratch_path);
                return Err(e);
            }
        };

        let merged_bytes: u64 = migrated
            .iter()
            .map(|(key, _, _, len)| {
                (K::PREFIX_LEN + key.key_material_len() + *len as usize) as u64
            })
            .sum();

        // Swap phase, under the exclusive gate: vacate the id-0 slot,
        // rename the scratch into it, rewrite the index, destroy the rest.
        let mut destroyed = 0usize;
        {
            let _exclusive = self.gate.write();

            if let Some(old_zero) = old_segments
                .iter()
                .find(|s| s.id() == SegmentId::MERGED)
            {
                self.allocator.destroy(old_zero)?;
                destroyed += 1;
            }

            fs::rename(&scratch_path, self.dir.segment_path(0))?;
            let merged = Arc::new(
                self.allocator
                    .open_segment(SegmentId::MERGED, &self.dir.segment_path(0))?,
            );
            self.allocator.register_merged(merged);

            for (key, old_entry, new_offset, length) in &migrated {
                self.index.compare_and_update(
                    key,
                    old_entry.segment,
                    old_entry.offset,
                    IndexEntry::new(SegmentId::MERGED, *new_offset, *length),
                );
            }

            // Tombstoned entries pointing into the merge set are purged;
            // their bytes die with the old segments.
            for (key, entry) in &snapshot {
                self.index.remove_tombstone_at(key, entry.segment, entry.offset);
            }

            for segment in &old_segments {
                if segment.id() == SegmentId::MERGED {
                    continue;
                }
                match self.allocator.destroy(segment) {
                    Ok(()) => destroyed += 1,
                    Err(e) => {
                        warn!(segment = %segment.id(), error = %e, "failed to destroy merged segment")
                    }
                }
            }
        }

        self.write_hint_snapshot()?;

        Ok(MergeStats {
            migrated_records: migrated.len(),
            skipped_entries: skipped,
            segments_destroyed: destroyed,
            merged_bytes,
        })
    }
}

impl<K: RecordKey> std::fmt::Debug for Compactor<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("deleted_ratio", &self.deleted_ratio)
            .finish_non_exhaustive()
    }
}
