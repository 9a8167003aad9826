//! Chunk storage
//!
//! - **types**: keys, ranges, chunk metadata and block ids
//! - **tuple**: schema-driven tuple encoding
//! - **chunk**: chunk buffer and on-disk layout
//! - **filesystem**: local and in-memory chunk backends
//! - **error**: error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   BTree → template + leaves → ChunkBuffer → FileSystemHandler
//!
//! Read Path:
//!   FileSystemHandler → ChunkFile::read_bytes → template / leaf window
//! ```

pub mod chunk;
pub mod error;
pub mod filesystem;
pub mod tuple;
pub mod types;

pub use chunk::{ChunkBuffer, ChunkLayout, LeafWindow};
pub use error::{StorageError, StorageResult};
pub use filesystem::{ChunkFile, FileSystemHandler, LocalFileSystem, MemoryFileSystem};
pub use tuple::{DataSchema, DataTuple, Field, FieldType, FieldValue};
pub use types::{BlockId, Bounds, ChunkMetadata, IndexKey, KeyRange, TimestampRange};
