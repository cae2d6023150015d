//! # chunkstore core
//!
//! An embedded log-structured store: append-only segment files, a
//! size-class allocator, an in-memory key index, tombstone deletion,
//! compaction and merge, hint-log and edit-log recovery.
//!
//! This crate provides:
//! - Segment management with two record layouts (string keys, numeric ids)
//! - A free-space pool that places writes by size class
//! - Tombstone-based deletion with threshold-triggered compaction
//! - A store-wide merge that rewrites live records into one segment
//! - Hint-log startup (no full scan) with full-scan fallback
//! - An edit log for structured metadata, replayed and compacted at open
//!
//! ## Entry Points
//!
//! - [`ChunkStore`] / [`BlockStore`] - raw byte stores (storage-node role)
//! - [`MetaStore`] - structured metadata with write-ahead logging
//!   (tracker role)
//!
//! ```no_run
//! use chunkstore_core::{ChunkStore, StoreConfig};
//! use std::path::Path;
//!
//! let store = ChunkStore::open(Path::new("data"), StoreConfig::default())?;
//! store.put("a.png".to_string(), b"bytes")?;
//! assert_eq!(store.get(&"a.png".to_string())?, Some(b"bytes".to_vec()));
//! store.close()?;
//! # Ok::<(), chunkstore_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dir;
mod error;
mod hint;
mod index;
mod key;
mod maintenance;
mod meta;
mod segment;
mod store;
mod types;
mod wal;

pub use config::{ReadStrategy, StoreConfig};
pub use dir::StoreDir;
pub use error::{CoreError, CoreResult};
pub use hint::{HintLog, HintSegment, HintSnapshot};
pub use index::{IndexEntry, KeyIndex};
pub use key::{RecordKey, RecordPrefix, MAX_KEY_LEN};
pub use meta::MetaStore;
pub use segment::{
    AppendOutcome, CompactionStats, Compactor, MarkOutcome, MergeStats, ProbedRecord,
    ReadOutcome, ScannedRecord, Segment, SegmentAllocator, SegmentStats,
};
pub use store::{BlockStore, ChunkStore, Location, Store, StoreStats};
pub use types::{SegmentId, TxId};
pub use wal::{EditLog, MetaOp, ReplayStats, OP_ADD, OP_REMOVE};
