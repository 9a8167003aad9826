//! Range query execution
//!
//! - **subquery**: range queries, predicates and their per-file sub-queries
//! - **scanner**: scans one chunk through the block cache
//! - **executor**: bounded, gated pipeline in front of the scanner
//! - **error**: query-tagged errors
//!
//! # Example
//!
//! ```rust,ignore
//! use chunkdex::query::{QueryExecutor, RangeQuery};
//!
//! let query = RangeQuery::new(1, KeyRange::new(2.0, 8.0));
//! for sub in catalog.plan(&query) {
//!     let result = executor.execute(sub).await?;
//!     println!("{}: {} tuples", result.file_name, result.tuples.len());
//! }
//! ```

pub mod error;
pub mod executor;
pub mod scanner;
pub mod subquery;

pub use error::{QueryError, QueryResult};
pub use executor::QueryExecutor;
pub use scanner::{ChunkScanner, FileScanMetrics, SubQueryResult};
pub use subquery::{Condition, ConditionValue, Operator, Predicate, QueryId, RangeQuery, SubQuery};
