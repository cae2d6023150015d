//! Hint log: a serialized snapshot of the key index for fast startup.
//!
//! The hint log is strictly a cache. Deleting it never loses data; it only
//! forces the next startup into a full segment scan. It is written after a
//! successful compaction (and on clean shutdown) and removed before a
//! store-wide merge begins, so a crash mid-merge is detected at the next
//! startup by its absence.
//!
//! ## File Format
//!
//! ```text
//! | magic (4) | version (2) | segment_count (4) |
//! | segment_id (4) | watermark (8) | removed_bytes (8) |   * segment_count
//! | key_len (4) | key_bytes (N) | segment_id (4) | offset (4) |   * entries
//! ```
//!
//! Integers are little-endian. Tombstoned keys are omitted. Each segment's
//! `watermark` records how many bytes of it the entries cover; records past
//! the watermark are recovered by a tail scan at load time.

use crate::error::{CoreError, CoreResult};
use crate::key::{RecordKey, MAX_KEY_LEN};
use crate::types::SegmentId;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

/// Magic bytes identifying a hint file.
pub const HINT_MAGIC: [u8; 4] = *b"CHNT";

/// Current hint file format version.
pub const HINT_VERSION: u16 = 1;

/// Per-segment coverage recorded in the hint header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintSegment {
    /// The covered segment.
    pub segment: SegmentId,
    /// Bytes of the segment covered by the hint's entries.
    pub watermark: u64,
    /// The segment's removed-bytes counter at hint time.
    pub removed_bytes: u64,
}

/// A loaded hint file.
#[derive(Debug)]
pub struct HintSnapshot<K> {
    /// Per-segment coverage table.
    pub segments: Vec<HintSegment>,
    /// Live entries: key, segment, record offset.
    pub entries: Vec<(K, SegmentId, u64)>,
}

/// Reader/writer for a store's hint file.
#[derive(Debug)]
pub struct HintLog {
    path: PathBuf,
    temp_path: PathBuf,
}

impl HintLog {
    /// Creates a hint log over the given paths.
    #[must_use]
    pub fn new(path: PathBuf, temp_path: PathBuf) -> Self {
        Self { path, temp_path }
    }

    /// Whether a hint file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Removes the hint file if present.
    pub fn remove(&self) -> CoreResult<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Writes a full snapshot, atomically replacing any previous hint file.
    ///
    /// The snapshot is written to a temp file, synced, and renamed into
    /// place; a crash mid-write leaves the previous hint (or none) intact.
    pub fn write_snapshot<K: RecordKey>(
        &self,
        segments: &[HintSegment],
        entries: &[(K, SegmentId, u64)],
    ) -> CoreResult<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&HINT_MAGIC);
        buf.extend_from_slice(&HINT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(segments.len() as u32).to_le_bytes());

        for segment in segments {
            buf.extend_from_slice(&segment.segment.as_u32().to_le_bytes());
            buf.extend_from_slice(&segment.watermark.to_le_bytes());
            buf.extend_from_slice(&segment.removed_bytes.to_le_bytes());
        }

        for (key, segment, offset) in entries {
            // The record layout addresses offsets with an i32; a merged
            // segment can outgrow that. No hint beats a wrapped one.
            if *offset > i32::MAX as u64 {
                return Err(CoreError::invalid_format(
                    "record offset exceeds hint format range",
                ));
            }
            let key_bytes = key.hint_bytes();
            buf.extend_from_slice(&(key_bytes.len() as i32).to_le_bytes());
            buf.extend_from_slice(&key_bytes);
            buf.extend_from_slice(&(segment.as_u32() as i32).to_le_bytes());
            buf.extend_from_slice(&(*offset as i32).to_le_bytes());
        }

        let mut file = File::create(&self.temp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.temp_path, &self.path)?;
        Ok(())
    }

    /// Loads the hint file.
    ///
    /// Returns `Ok(None)` when no hint file exists. Any structural problem
    /// is reported as `HintCorruption`; callers respond by falling back to
    /// a full segment scan.
    pub fn load<K: RecordKey>(&self) -> CoreResult<Option<HintSnapshot<K>>> {
        if !self.path.exists() {
            return Ok(None);
        }

        fn take<'a>(data: &'a [u8], cursor: &mut usize, n: usize) -> CoreResult<&'a [u8]> {
            if *cursor + n > data.len() {
                return Err(CoreError::hint_corruption("truncated hint file"));
            }
            let slice = &data[*cursor..*cursor + n];
            *cursor += n;
            Ok(slice)
        }

        let data = fs::read(&self.path)?;
        let mut cursor = 0usize;

        if take(&data, &mut cursor, 4)? != &HINT_MAGIC[..] {
            return Err(CoreError::hint_corruption("invalid magic"));
        }
        let version_bytes = take(&data, &mut cursor, 2)?;
        let version = u16::from_le_bytes([version_bytes[0], version_bytes[1]]);
        if version > HINT_VERSION {
            return Err(CoreError::hint_corruption(format!(
                "unsupported version {version}"
            )));
        }

        let count_bytes = take(&data, &mut cursor, 4)?;
        let segment_count =
            u32::from_le_bytes([count_bytes[0], count_bytes[1], count_bytes[2], count_bytes[3]]);

        let mut segments = Vec::with_capacity(segment_count as usize);
        for _ in 0..segment_count {
            let raw = take(&data, &mut cursor, 20)?;
            let segment = SegmentId::new(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
            let watermark = u64::from_le_bytes([
                raw[4], raw[5], raw[6], raw[7], raw[8], raw[9], raw[10], raw[11],
            ]);
            let removed_bytes = u64::from_le_bytes([
                raw[12], raw[13], raw[14], raw[15], raw[16], raw[17], raw[18], raw[19],
            ]);
            segments.push(HintSegment {
                segment,
                watermark,
                removed_bytes,
            });
        }

        let mut entries = Vec::new();
        while cursor < data.len() {
            let len_bytes = take(&data, &mut cursor, 4)?;
            let key_len =
                i32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
            if key_len < 1 || key_len as usize > MAX_KEY_LEN {
                return Err(CoreError::hint_corruption("invalid key length"));
            }

            let key_bytes = take(&data, &mut cursor, key_len as usize)?;
            let key = K::from_hint_bytes(key_bytes)
                .ok_or_else(|| CoreError::hint_corruption("undecodable key"))?;

            let raw = take(&data, &mut cursor, 8)?;
            let segment_id = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let offset = i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
            if segment_id < 0 || offset < 0 {
                return Err(CoreError::hint_corruption("negative segment id or offset"));
            }

            entries.push((key, SegmentId::new(segment_id as u32), offset as u64));
        }

        Ok(Some(HintSnapshot { segments, entries }))
    }
}
