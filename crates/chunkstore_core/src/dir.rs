//! Store directory management.
//!
//! This module handles the file system layout for a store:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK                    # Advisory lock for single-process access
//! ├─ hint.log                # Serialized key index (cache, regenerated)
//! ├─ edit.log                # Write-ahead log of metadata operations
//! ├─ <name>_chunk_0          # Segment files
//! ├─ <name>_chunk_1
//! └─ <name>_merged_chunks    # Merge scratch file (transient)
//! ```
//!
//! The LOCK file ensures only one process can write to the store at a time.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::warn;

const LOCK_FILE: &str = "LOCK";
const HINT_FILE: &str = "hint.log";
const HINT_TEMP: &str = "hint.log.tmp";
const EDIT_LOG_FILE: &str = "edit.log";
const EDIT_LOG_TEMP: &str = "edit.log.tmp";

/// Manages a store's directory structure and file locking.
///
/// # Thread Safety
///
/// The `StoreDir` holds an exclusive advisory lock on the store directory.
/// Only one `StoreDir` instance can exist per directory at a time, across
/// processes.
#[derive(Debug)]
pub struct StoreDir {
    /// Root directory path.
    path: PathBuf,
    /// Store name (segment file prefix).
    name: String,
    /// Lock file handle (held for exclusive access).
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `StoreLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, name: &str, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(CoreError::invalid_format(format!(
                    "store directory {} does not exist",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
        }

        let lock_path = path.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| CoreError::StoreLocked)?;

        Ok(Self {
            path: path.to_path_buf(),
            name: name.to_string(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the segment file with the given id.
    #[must_use]
    pub fn segment_path(&self, id: u32) -> PathBuf {
        self.path.join(format!("{}_chunk_{}", self.name, id))
    }

    /// Path of the merge scratch file.
    #[must_use]
    pub fn merge_scratch_path(&self) -> PathBuf {
        self.path.join(format!("{}_merged_chunks", self.name))
    }

    /// Path of the hint log.
    #[must_use]
    pub fn hint_path(&self) -> PathBuf {
        self.path.join(HINT_FILE)
    }

    /// Path of the hint log temp file (written, then renamed into place).
    #[must_use]
    pub fn hint_temp_path(&self) -> PathBuf {
        self.path.join(HINT_TEMP)
    }

    /// Path of the edit log.
    #[must_use]
    pub fn edit_log_path(&self) -> PathBuf {
        self.path.join(EDIT_LOG_FILE)
    }

    /// Path of the edit log temp file (written, then renamed into place).
    #[must_use]
    pub fn edit_log_temp_path(&self) -> PathBuf {
        self.path.join(EDIT_LOG_TEMP)
    }

    /// Lists segment files in the directory by the naming convention,
    /// sorted by id.
    pub fn list_segment_files(&self) -> CoreResult<Vec<(u32, PathBuf)>> {
        let prefix = format!("{}_chunk_", self.name);
        let mut segments = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(id_str) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(id) = id_str.parse::<u32>() else {
                continue;
            };
            segments.push((id, entry.path()));
        }

        segments.sort_by_key(|(id, _)| *id);
        Ok(segments)
    }

    /// Resolves a merge scratch file left behind by a crash.
    ///
    /// A merge deletes segment 0 before renaming the scratch file into its
    /// slot, so the scratch file is authoritative exactly when segment 0 is
    /// gone; otherwise every record is still present in the old segments and
    /// the scratch is discarded. The hint log was already removed when the
    /// merge started, which forces the caller into a full rescan either way.
    pub fn cleanup_merge_scratch(&self) -> CoreResult<()> {
        let scratch = self.merge_scratch_path();
        if !scratch.exists() {
            return Ok(());
        }

        let chunk_0 = self.segment_path(0);
        if chunk_0.exists() {
            warn!(
                store = %self.name,
                "discarding incomplete merge scratch file from a previous crash"
            );
            fs::remove_file(&scratch)?;
        } else {
            warn!(
                store = %self.name,
                "adopting completed merge scratch file from a previous crash"
            );
            fs::rename(&scratch, &chunk_0)?;
        }
        Ok(())
    }

    /// Removes the hint log if present.
    pub fn remove_hint(&self) -> CoreResult<()> {
        let path = self.hint_path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}
