//! Error types for chunkstore core.

use crate::types::SegmentId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in chunkstore core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] chunkstore_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record payload exceeds the maximum a single segment can hold.
    ///
    /// The engine never splits one record across segments, so oversized
    /// payloads are rejected before any byte is written.
    #[error("record too large: {size} bytes exceeds segment capacity of {max}")]
    RecordTooLarge {
        /// Encoded record size in bytes.
        size: u64,
        /// Maximum segment capacity in bytes.
        max: u64,
    },

    /// A segment record is structurally invalid.
    #[error("segment corruption in {segment}: {message}")]
    SegmentCorruption {
        /// The segment where corruption was found.
        segment: SegmentId,
        /// Description of the corruption.
        message: String,
    },

    /// A referenced segment no longer exists (destroyed by compaction).
    #[error("segment {segment} is gone")]
    SegmentGone {
        /// The missing segment.
        segment: SegmentId,
    },

    /// The edit log is corrupted or invalid.
    #[error("edit log corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// The hint log is corrupted or invalid.
    ///
    /// The hint log is strictly a cache; callers fall back to a full
    /// segment scan when they see this.
    #[error("hint log corruption: {message}")]
    HintCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Invalid key (empty, oversized, or malformed for the key kind).
    #[error("invalid key: {message}")]
    InvalidKey {
        /// Description of the problem.
        message: String,
    },

    /// Invalid file format or naming.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// The store directory is already locked by another process.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// The store has been closed.
    #[error("store is closed")]
    StoreClosed,

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a segment corruption error.
    pub fn segment_corruption(segment: SegmentId, message: impl Into<String>) -> Self {
        Self::SegmentCorruption {
            segment,
            message: message.into(),
        }
    }

    /// Creates an edit log corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates a hint log corruption error.
    pub fn hint_corruption(message: impl Into<String>) -> Self {
        Self::HintCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid key error.
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
