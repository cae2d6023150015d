//! File-based storage backend using memory-mapped reads.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-based storage backend that serves reads from a memory mapping.
///
/// Writes go through the file handle exactly as in [`super::FileBackend`];
/// reads copy out of a single shared read-only mapping of the whole file,
/// avoiding a syscall per read. The mapping is created lazily and re-created
/// when the file has grown past the mapped extent.
///
/// A mapping must span the whole file, so construction enforces an upper
/// bound on file size (`max_map_size`). Callers pick this backend as a
/// deployment-time configuration; results are byte-identical to
/// `FileBackend` for identical state.
///
/// # Coherence
///
/// The mapping is `MAP_SHARED`, so in-place patches written through the
/// file handle are visible through the mapping without remapping.
#[derive(Debug)]
pub struct MmapBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
    map: RwLock<Option<Mmap>>,
    max_map_size: u64,
}

impl MmapBackend {
    /// Opens or creates an mmap-backed storage file at the given path.
    ///
    /// # Arguments
    ///
    /// * `path` - File path to open or create
    /// * `max_map_size` - Upper bound on the file size; a single mapping
    ///   must be able to span the whole file
    ///
    /// # Errors
    ///
    /// Returns `MapTooLarge` if the existing file already exceeds
    /// `max_map_size`, or an I/O error if the file cannot be opened.
    pub fn open(path: &Path, max_map_size: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();
        if size > max_map_size {
            return Err(StorageError::MapTooLarge {
                size,
                max: max_map_size,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
            map: RwLock::new(None),
            max_map_size,
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-creates the mapping to cover the current file size.
    ///
    /// The mapping is dropped before any truncation (see `truncate`) and
    /// the engine holds an exclusive process lock on the store directory,
    /// so the mapped region is never shrunk or externally mutated while
    /// mapped.
    #[allow(unsafe_code)]
    fn remap(&self, map: &mut Option<Mmap>, file_size: u64) -> StorageResult<()> {
        if file_size == 0 {
            *map = None;
            return Ok(());
        }

        let file = self.file.read();
        let new_map = unsafe { MmapOptions::new().len(file_size as usize).map(&*file)? };
        *map = Some(new_map);
        Ok(())
    }
}

impl StorageBackend for MmapBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        {
            let map = self.map.read();
            if let Some(m) = map.as_ref() {
                if end <= m.len() as u64 {
                    return Ok(m[offset as usize..end as usize].to_vec());
                }
            }
        }

        // Mapping absent or stale; remap to the current size and retry.
        let mut map = self.map.write();
        let covers = map.as_ref().map_or(0, |m| m.len() as u64);
        if covers < end {
            self.remap(&mut map, size)?;
        }

        let m = map
            .as_ref()
            .ok_or(StorageError::ReadPastEnd { offset, len, size })?;
        Ok(m[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if data.is_empty() {
            return Ok(*self.size.read());
        }

        let mut file = self.file.write();
        let mut size = self.size.write();

        let new_size = *size + data.len() as u64;
        if new_size > self.max_map_size {
            return Err(StorageError::MapTooLarge {
                size: new_size,
                max: self.max_map_size,
            });
        }

        let offset = *size;
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        *size = new_size;

        Ok(offset)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let size = *self.size.read();
        let end = offset.saturating_add(data.len() as u64);

        if offset > size || end > size {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size,
            });
        }

        if data.is_empty() {
            return Ok(());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        let mut file = self.file.write();
        file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let file = self.file.write();
        file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        // Drop the mapping before shrinking the file.
        let mut map = self.map.write();
        *map = None;

        let mut file = self.file.write();
        let mut size = self.size.write();

        if new_size > *size {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to size {} which is greater than current size {}",
                    new_size, *size
                ),
            )));
        }

        file.set_len(new_size)?;
        file.sync_all()?;
        *size = new_size;

        Ok(())
    }
}
