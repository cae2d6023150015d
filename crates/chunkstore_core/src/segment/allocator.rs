//! Size-class segment allocation.
//!
//! The allocator owns every segment of a store. Writable segments sit in a
//! free-space pool sorted by remaining capacity; a write checks out the
//! segment whose free space is closest to (but not below) the record size,
//! which keeps writes spread across segments instead of packing the first
//! match. A checked-out segment is absent from the pool, so each segment has
//! at most one writer at a time.

use crate::config::{ReadStrategy, StoreConfig};
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::key::RecordKey;
use crate::segment::Segment;
use crate::types::SegmentId;
use chunkstore_storage::{FileBackend, MmapBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

struct FreePool {
    /// Remaining capacity -> segment ids with that much free space.
    buckets: BTreeMap<u64, VecDeque<u32>>,
    /// Next segment id to assign. Never reused.
    next_id: u32,
}

/// Pool of segments bucketed by remaining free space.
pub struct SegmentAllocator<K: RecordKey> {
    dir: Arc<StoreDir>,
    segment_capacity: u64,
    read_strategy: ReadStrategy,
    mmap_max_capacity: u64,
    sync_on_write: bool,
    by_id: RwLock<HashMap<u32, Arc<Segment<K>>>>,
    pool: Mutex<FreePool>,
}

impl<K: RecordKey> SegmentAllocator<K> {
    /// Loads every segment in the store directory by filename convention
    /// and buckets each by its actual remaining capacity.
    pub fn load(dir: Arc<StoreDir>, config: &StoreConfig) -> CoreResult<Self> {
        let allocator = Self {
            dir,
            segment_capacity: config.segment_capacity,
            read_strategy: config.read_strategy,
            mmap_max_capacity: config.mmap_max_capacity,
            sync_on_write: config.sync_on_write,
            by_id: RwLock::new(HashMap::new()),
            pool: Mutex::new(FreePool {
                buckets: BTreeMap::new(),
                next_id: 0,
            }),
        };

        let files = allocator.dir.list_segment_files()?;
        {
            let mut by_id = allocator.by_id.write();
            let mut pool = allocator.pool.lock();

            for (id, path) in files {
                let segment = allocator.open_segment(SegmentId::new(id), &path)?;
                let free = segment.free_bytes();
                by_id.insert(id, Arc::new(segment));
                pool.buckets.entry(free).or_default().push_back(id);
                pool.next_id = pool.next_id.max(id + 1);
            }
        }

        Ok(allocator)
    }

    /// Checks out a segment with room for an encoded record of `record_len`
    /// bytes, creating a new segment when none qualifies.
    ///
    /// The caller must hand the segment back with [`Self::release`] once its
    /// write (and index update) is done.
    ///
    /// # Errors
    ///
    /// Returns `RecordTooLarge` when the record cannot fit even in an empty
    /// segment; records are never split across segments.
    pub fn acquire(&self, record_len: u64) -> CoreResult<Arc<Segment<K>>> {
        if record_len > self.segment_capacity {
            return Err(CoreError::RecordTooLarge {
                size: record_len,
                max: self.segment_capacity,
            });
        }

        loop {
            let picked = {
                let mut pool = self.pool.lock();
                let bucket_key = pool
                    .buckets
                    .range(record_len..)
                    .next()
                    .map(|(free, _)| *free);
                match bucket_key {
                    Some(free) => {
                        let id = pool
                            .buckets
                            .get_mut(&free)
                            .and_then(VecDeque::pop_front);
                        if pool.buckets.get(&free).is_some_and(VecDeque::is_empty) {
                            pool.buckets.remove(&free);
                        }
                        id
                    }
                    None => None,
                }
            };

            match picked {
                Some(id) => {
                    if let Some(segment) = self.by_id.read().get(&id).cloned() {
                        if !segment.is_dead() {
                            return Ok(segment);
                        }
                    }
                    // Destroyed while pooled; try the next candidate.
                }
                None => return self.create_segment(),
            }
        }
    }

    /// Returns a checked-out segment to the pool, re-bucketed under its new
    /// remaining capacity.
    pub fn release(&self, segment: &Arc<Segment<K>>) {
        if segment.is_dead() {
            return;
        }
        let free = segment.free_bytes();
        let mut pool = self.pool.lock();
        pool.buckets
            .entry(free)
            .or_default()
            .push_back(segment.id().as_u32());
    }

    /// Looks up a segment by id.
    pub fn get(&self, id: SegmentId) -> Option<Arc<Segment<K>>> {
        self.by_id.read().get(&id.as_u32()).cloned()
    }

    /// Snapshot of all segments, sorted by id.
    pub fn segments(&self) -> Vec<Arc<Segment<K>>> {
        let mut segments: Vec<_> = self.by_id.read().values().cloned().collect();
        segments.sort_by_key(|s| s.id());
        segments
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.by_id.read().len()
    }

    /// Whether the store has no segments yet.
    pub fn is_empty(&self) -> bool {
        self.by_id.read().is_empty()
    }

    /// Creates a brand-new empty segment and registers it.
    pub fn create_segment(&self) -> CoreResult<Arc<Segment<K>>> {
        let id = {
            let mut pool = self.pool.lock();
            let id = pool.next_id;
            pool.next_id += 1;
            id
        };

        let path = self.dir.segment_path(id);
        let segment = Arc::new(self.open_segment(SegmentId::new(id), &path)?);
        self.by_id.write().insert(id, Arc::clone(&segment));
        debug!(segment = %segment.id(), "created segment");
        Ok(segment)
    }

    /// Destroys a segment: deletes its backing file and unregisters it.
    pub fn destroy(&self, segment: &Arc<Segment<K>>) -> CoreResult<()> {
        segment.destroy()?;
        let id = segment.id().as_u32();
        self.by_id.write().remove(&id);

        let mut pool = self.pool.lock();
        let mut emptied = Vec::new();
        for (free, bucket) in pool.buckets.iter_mut() {
            bucket.retain(|candidate| *candidate != id);
            if bucket.is_empty() {
                emptied.push(*free);
            }
        }
        for free in emptied {
            pool.buckets.remove(&free);
        }
        Ok(())
    }

    /// Nominal capacity of newly created segments.
    pub fn segment_capacity(&self) -> u64 {
        self.segment_capacity
    }

    /// Re-buckets a pooled segment under its current free space.
    ///
    /// Compaction shrinks a segment while it may be sitting in the pool
    /// under a stale free-space key. A segment that is currently checked
    /// out is left alone; `release` will bucket it correctly.
    pub fn rebucket(&self, segment: &Arc<Segment<K>>) {
        let id = segment.id().as_u32();
        let mut pool = self.pool.lock();

        let mut found = false;
        let mut emptied = Vec::new();
        for (free, bucket) in pool.buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|candidate| *candidate != id);
            if bucket.len() != before {
                found = true;
            }
            if bucket.is_empty() {
                emptied.push(*free);
            }
        }
        for free in emptied {
            pool.buckets.remove(&free);
        }

        if found && !segment.is_dead() {
            pool.buckets
                .entry(segment.free_bytes())
                .or_default()
                .push_back(id);
        }
    }

    /// Empties the free pool without touching the segments themselves.
    ///
    /// Used at the start of a store-wide merge: writes issued while the
    /// merge runs can then only land in freshly created segments, never in
    /// one being merged.
    pub fn drain_pool(&self) {
        self.pool.lock().buckets.clear();
    }

    /// Registers the output segment of a completed merge under id 0 and
    /// makes it writable again.
    pub fn register_merged(&self, segment: Arc<Segment<K>>) {
        self.by_id
            .write()
            .insert(segment.id().as_u32(), Arc::clone(&segment));
        self.release(&segment);
    }

    /// Opens a segment backend per the configured read strategy.
    ///
    /// A merge output can outgrow the single-mapping bound; such a segment
    /// is served with direct reads instead. Both strategies return
    /// identical bytes, so the substitution is not observable.
    pub fn open_segment(&self, id: SegmentId, path: &Path) -> CoreResult<Segment<K>> {
        let file_size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let backend: Box<dyn StorageBackend> = match self.read_strategy {
            ReadStrategy::Mmap if file_size <= self.mmap_max_capacity => {
                Box::new(MmapBackend::open(path, self.mmap_max_capacity)?)
            }
            _ => Box::new(FileBackend::open(path)?),
        };
        Segment::new(
            id,
            self.segment_capacity,
            backend,
            Some(path.to_path_buf()),
            self.sync_on_write,
        )
    }
}

impl<K: RecordKey> std::fmt::Debug for SegmentAllocator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentAllocator")
            .field("segment_capacity", &self.segment_capacity)
            .field("segments", &self.len())
            .finish_non_exhaustive()
    }
}
