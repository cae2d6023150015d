//! Structured-metadata store: a [`ChunkStore`] plus the edit log.
//!
//! Tracker-side stores (bucket and object metadata) persist every mutation
//! twice: as a segment record through the chunk store, and as a [`MetaOp`]
//! in the edit log. At startup the log is replayed over the recovered
//! chunk store (replay is idempotent, so records the chunk store already
//! recovered are simply confirmed) and then compacted down to one `Add`
//! per live record.

use crate::config::StoreConfig;
use crate::error::CoreResult;
use crate::segment::MergeStats;
use crate::store::{ChunkStore, Location, Store, StoreStats};
use crate::wal::{EditLog, MetaOp, ReplayStats};
use std::path::Path;
use tracing::{debug, warn};

/// A metadata store with write-ahead logging.
pub struct MetaStore {
    store: ChunkStore,
    wal: EditLog,
}

impl MetaStore {
    /// Opens the store, replays the edit log, and compacts it.
    ///
    /// # Errors
    ///
    /// Startup failures are fatal. A failed log compaction is not: the old
    /// log remains valid and the rewrite is retried on the next
    /// [`Self::compact`].
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        let store = Store::open(path, config)?;

        let wal = EditLog::open(
            store.dir().edit_log_path(),
            store.dir().edit_log_temp_path(),
            store.config().wal_flush_every,
            store.config().wal_flush_interval,
        )?;

        let stats = Self::replay_into(&wal, &store)?;
        debug!(entries = stats.entries, "metadata log replayed");

        let meta = Self { store, wal };
        if let Err(e) = meta.compact_log() {
            warn!(error = %e, "edit log compaction after replay failed");
        }
        Ok(meta)
    }

    /// Inserts or replaces a metadata record.
    pub fn put(&self, key: &str, value: &[u8]) -> CoreResult<Location> {
        let location = self.store.put(key.to_string(), value)?;
        self.wal.append(&MetaOp::Add {
            key: key.to_string(),
            value: value.to_vec(),
        })?;
        Ok(location)
    }

    /// Inserts a metadata record only if the key is absent.
    ///
    /// Returns `None` (and logs nothing) when the key already exists.
    pub fn put_if_absent(&self, key: &str, value: &[u8]) -> CoreResult<Option<Location>> {
        let Some(location) = self.store.put_if_absent(key.to_string(), value)? else {
            return Ok(None);
        };
        self.wal.append(&MetaOp::Add {
            key: key.to_string(),
            value: value.to_vec(),
        })?;
        Ok(Some(location))
    }

    /// Reads a metadata record.
    pub fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        self.store.get(&key.to_string())
    }

    /// Deletes a metadata record. Returns whether it existed.
    pub fn delete(&self, key: &str) -> CoreResult<bool> {
        let removed = self.store.delete(&key.to_string())?;
        if removed {
            self.wal.append(&MetaOp::Remove {
                key: key.to_string(),
            })?;
        }
        Ok(removed)
    }

    /// Lists every live key.
    pub fn list_keys(&self) -> CoreResult<Vec<String>> {
        self.store.list_keys()
    }

    /// Reads every live record at one consistent snapshot.
    pub fn snapshot(&self) -> CoreResult<Vec<(String, Vec<u8>)>> {
        self.store.snapshot()
    }

    /// Forces the edit log to disk.
    pub fn flush(&self) -> CoreResult<()> {
        self.wal.flush()
    }

    /// Merges the chunk store and rewrites the edit log to the live set.
    pub fn compact(&self) -> CoreResult<MergeStats> {
        let stats = self.store.merge_now()?;
        self.compact_log()?;
        Ok(stats)
    }

    /// Store-level counters.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        self.store.stats()
    }

    /// Closes the log and the store.
    pub fn close(&self) -> CoreResult<()> {
        self.wal.close()?;
        self.store.close()
    }

    fn compact_log(&self) -> CoreResult<()> {
        let ops: Vec<MetaOp> = self
            .store
            .snapshot()?
            .into_iter()
            .map(|(key, value)| MetaOp::Add { key, value })
            .collect();
        self.wal.compact(&ops)
    }

    /// Replays log entries into the chunk store, skipping entries the
    /// store already reflects.
    fn replay_into(wal: &EditLog, store: &ChunkStore) -> CoreResult<ReplayStats> {
        wal.replay(|op| match op {
            MetaOp::Add { key, value } => {
                if store.get(&key)?.as_deref() != Some(value.as_slice()) {
                    store.put(key, &value)?;
                }
                Ok(())
            }
            MetaOp::Remove { key } => {
                let _ = store.delete(&key)?;
                Ok(())
            }
        })
    }
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
