//! Store configuration.

use crate::error::{CoreError, CoreResult};
use std::time::Duration;

/// How segment reads are served.
///
/// Both strategies produce identical results for identical state; the choice
/// is a deployment-time decision and is not observable through the store API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadStrategy {
    /// Positional reads through the file handle. Always available.
    #[default]
    Direct,
    /// Memory-mapped reads. Requires every segment to fit in a single
    /// mapping, so `segment_capacity` must not exceed `mmap_max_capacity`.
    Mmap,
}

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store name, used as the prefix of every segment file name.
    pub name: String,

    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Maximum size of a single segment file.
    pub segment_capacity: u64,

    /// Deleted-bytes ratio above which a segment is compacted.
    pub deleted_ratio: f64,

    /// How segment reads are served.
    pub read_strategy: ReadStrategy,

    /// Upper bound on segment size when `read_strategy` is `Mmap`.
    pub mmap_max_capacity: u64,

    /// Whether to flush segment writes to the OS on every append.
    pub sync_on_write: bool,

    /// Whether to run the background maintenance worker.
    pub auto_maintenance: bool,

    /// How often the maintenance worker wakes up.
    pub maintenance_interval: Duration,

    /// Unflushed edit-log entry count that forces a flush.
    pub wal_flush_every: usize,

    /// Time since the last edit-log flush that forces a flush.
    pub wal_flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "chunks".to_string(),
            create_if_missing: true,
            segment_capacity: 64 * 1024 * 1024,    // 64 MB
            deleted_ratio: 0.60,
            read_strategy: ReadStrategy::Direct,
            mmap_max_capacity: 256 * 1024 * 1024, // 256 MB
            sync_on_write: true,
            auto_maintenance: true,
            maintenance_interval: Duration::from_secs(1),
            wal_flush_every: 100,
            wal_flush_interval: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the store name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets whether to create the store directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the maximum segment file size.
    #[must_use]
    pub const fn segment_capacity(mut self, size: u64) -> Self {
        self.segment_capacity = size;
        self
    }

    /// Sets the deleted-bytes ratio that triggers compaction.
    #[must_use]
    pub const fn deleted_ratio(mut self, ratio: f64) -> Self {
        self.deleted_ratio = ratio;
        self
    }

    /// Sets the segment read strategy.
    #[must_use]
    pub const fn read_strategy(mut self, strategy: ReadStrategy) -> Self {
        self.read_strategy = strategy;
        self
    }

    /// Sets whether to flush segment writes on every append.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets whether the background maintenance worker runs.
    #[must_use]
    pub const fn auto_maintenance(mut self, value: bool) -> Self {
        self.auto_maintenance = value;
        self
    }

    /// Sets the maintenance worker wake-up interval.
    #[must_use]
    pub const fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Sets the edit-log flush entry threshold.
    #[must_use]
    pub const fn wal_flush_every(mut self, entries: usize) -> Self {
        self.wal_flush_every = entries;
        self
    }

    /// Sets the edit-log flush interval.
    #[must_use]
    pub const fn wal_flush_interval(mut self, interval: Duration) -> Self {
        self.wal_flush_interval = interval;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for an empty name, a segment capacity that
    /// cannot be addressed by hint records, or an mmap strategy whose
    /// capacity exceeds the mapping bound.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::invalid_format("store name must not be empty"));
        }
        if self.name.contains(std::path::is_separator) {
            return Err(CoreError::invalid_format(
                "store name must not contain path separators",
            ));
        }
        if self.segment_capacity < 64 {
            return Err(CoreError::invalid_format(
                "segment capacity must be at least 64 bytes",
            ));
        }
        // Hint records address offsets with an i32.
        if self.segment_capacity > i32::MAX as u64 {
            return Err(CoreError::invalid_format(
                "segment capacity must not exceed 2 GiB",
            ));
        }
        if !(0.0..=1.0).contains(&self.deleted_ratio) {
            return Err(CoreError::invalid_format(
                "deleted ratio must be between 0.0 and 1.0",
            ));
        }
        if self.read_strategy == ReadStrategy::Mmap
            && self.segment_capacity > self.mmap_max_capacity
        {
            return Err(CoreError::invalid_format(format!(
                "segment capacity {} exceeds mmap bound {}",
                self.segment_capacity, self.mmap_max_capacity
            )));
        }
        Ok(())
    }
}
