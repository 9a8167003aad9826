//! # chunkdex
//!
//! A key-ordered index over append-only data chunks. Tuples stream into an
//! in-memory B-tree keyed by a secondary attribute; once a chunk is full the
//! tree is split into a payload-free template and a run of leaf blocks and
//! written as one immutable file. Range queries are decomposed into one
//! sub-query per candidate chunk and answered by reading the template plus a
//! single contiguous window of leaves, through an LRU block cache. A
//! coordinator watches per-interval load and rebalances key ranges across
//! partitions when one interval runs hot.
//!
//! ## Modules
//!
//! - [`btree`]: arena B-tree, template and leaf codecs, bulk rebuild
//! - [`storage`]: keys and ranges, tuple schema, chunk layout, file backends
//! - [`cache`]: LRU cache of decoded templates and leaves
//! - [`ingest`]: the index builder that seals chunks
//! - [`query`]: sub-query scanning and the gated executor
//! - [`coordinator`]: load histograms, partition maps and repartitioning
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chunkdex::config::{IndexConfig, QueryConfig};
//! use chunkdex::ingest::IndexBuilder;
//! use chunkdex::query::{QueryExecutor, SubQuery};
//! use chunkdex::storage::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = DataSchema::new("key", "ts")
//!         .field("key", FieldType::Double)
//!         .field("ts", FieldType::Int);
//!     let fs = FileSystemHandler::memory();
//!
//!     let mut builder = IndexBuilder::new(IndexConfig::default(), schema.clone(), fs.clone(), "s0");
//!     for (i, key) in [5.0, 1.0, 9.0, 3.0, 7.0].into_iter().enumerate() {
//!         let tuple = DataTuple::new(vec![FieldValue::Double(key), FieldValue::Int(i as i64)]);
//!         builder.ingest(&tuple).await?;
//!     }
//!     let sealed = builder.shutdown().await?.expect("chunk sealed");
//!
//!     let mut executor = QueryExecutor::start(QueryConfig::default(), fs, schema);
//!     let result = executor
//!         .execute(SubQuery::new(1, sealed.metadata.file_name, KeyRange::new(2.0, 8.0)))
//!         .await?;
//!     println!("{} tuples", result.tuples.len());
//!
//!     executor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod btree;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod ingest;
pub mod query;
pub mod storage;

pub use btree::{BTree, LeafNode, Template};
pub use cache::{BlockCache, CacheEntry, CacheStats, SharedBlockCache};
pub use config::{Config, ConfigError};
pub use coordinator::{KeyDispatcher, PartitionCoordinator, PartitionMap};
pub use ingest::{IndexBuilder, IngestOutcome, SealedChunk, TemplatePolicy};
pub use query::{QueryError, QueryExecutor, RangeQuery, SubQuery, SubQueryResult};
pub use storage::{
    BlockId, ChunkMetadata, DataSchema, DataTuple, IndexKey, KeyRange, StorageError,
    StorageResult, TimestampRange,
};
