//! Query error types
//!
//! Every sub-query failure carries the originating query id and, where one is
//! involved, the chunk file name. Corruption is reported separately from I/O
//! failure: retrying a corrupt chunk is pointless, retrying an I/O failure
//! may not be.

use crate::query::subquery::QueryId;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors that can occur while executing a sub-query
#[derive(Error, Debug)]
pub enum QueryError {
    /// Reading the chunk failed
    #[error("query {query_id}: I/O error on {file}: {source}")]
    Io {
        query_id: QueryId,
        file: String,
        #[source]
        source: StorageError,
    },

    /// Template or leaf failed to decode; the chunk is unusable
    #[error("query {query_id}: chunk {file} is corrupt: {reason}")]
    Corrupt {
        query_id: QueryId,
        file: String,
        reason: String,
    },

    /// Chunk file does not exist
    #[error("query {query_id}: chunk {file} not found")]
    FileNotFound { query_id: QueryId, file: String },

    /// A stored tuple did not match the schema
    #[error("query {query_id}: cannot decode tuple in {file}: {reason}")]
    Decode {
        query_id: QueryId,
        file: String,
        reason: String,
    },

    /// The scan task died
    #[error("query {query_id}: scan task failed: {reason}")]
    Internal { query_id: QueryId, reason: String },

    /// The executor shut down before the sub-query was scanned
    #[error("query {query_id}: executor shut down before {file} was scanned")]
    Cancelled { query_id: QueryId, file: String },

    /// The executor no longer accepts sub-queries
    #[error("Query executor is closed")]
    Closed,
}

impl QueryError {
    /// Classify a storage error raised while scanning `file` for `query_id`
    pub fn from_storage(query_id: QueryId, file: &str, error: StorageError) -> Self {
        let file = file.to_string();
        match error {
            StorageError::Corruption(reason) => QueryError::Corrupt {
                query_id,
                file,
                reason,
            },
            StorageError::FileNotFound(_) => QueryError::FileNotFound { query_id, file },
            StorageError::Serialization(reason) | StorageError::MalformedTuple(reason) => {
                QueryError::Decode {
                    query_id,
                    file,
                    reason,
                }
            }
            source => QueryError::Io {
                query_id,
                file,
                source,
            },
        }
    }

    /// Id of the query the failure belongs to
    pub fn query_id(&self) -> Option<QueryId> {
        match self {
            QueryError::Io { query_id, .. }
            | QueryError::Corrupt { query_id, .. }
            | QueryError::FileNotFound { query_id, .. }
            | QueryError::Decode { query_id, .. }
            | QueryError::Internal { query_id, .. }
            | QueryError::Cancelled { query_id, .. } => Some(*query_id),
            QueryError::Closed => None,
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, QueryError::Corrupt { .. })
    }

    /// True if running the same sub-query again might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Io { .. })
    }
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;
