//! # chunkstore storage
//!
//! Storage backend trait and implementations for chunkstore.
//!
//! This crate provides the lowest-level storage abstraction for the engine.
//! Storage backends are **opaque byte stores** - they do not interpret the
//! data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, append, patch, flush)
//! - No knowledge of segment record formats, hint logs, or edit logs
//! - Must be `Send + Sync` for concurrent access
//! - The engine owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral stores
//! - [`FileBackend`] - Persistent storage using positional file I/O
//! - [`MmapBackend`] - Persistent storage with memory-mapped reads
//!
//! The two persistent backends must be indistinguishable to callers for
//! identical state; which one a deployment uses is configuration, not API.
//!
//! ## Example
//!
//! ```rust
//! use chunkstore_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod mmap;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use mmap::MmapBackend;
