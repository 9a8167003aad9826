//! Storage layer error types
//!
//! Defines all errors that can occur while building, writing and reading
//! chunk files. Corruption is kept distinct from I/O failures so callers can
//! tell whether retrying the same file is pointless.

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected (checksum mismatch, bad length, invalid magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Tuple serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A tuple or chunk does not fit the configured capacity
    #[error("Capacity exceeded: needed {needed} bytes, {available} available")]
    CapacityExceeded { needed: usize, available: usize },

    /// Tuple does not carry a usable index value or timestamp
    #[error("Malformed tuple: {0}")]
    MalformedTuple(String),

    /// Requested chunk file does not exist
    #[error("Chunk file not found: {0}")]
    FileNotFound(String),

    /// A chunk with this name was already written
    #[error("Chunk file already exists: {0}")]
    AlreadyExists(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// A background channel or worker has shut down
    #[error("Channel closed: {0}")]
    Closed(String),
}

impl StorageError {
    /// True if the error means the stored bytes themselves are bad
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corruption(_))
    }

    /// True if repeating the same operation might succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::Lock(_))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::FileNotFound("partition0-chunk000001".to_string());
        assert_eq!(
            err.to_string(),
            "Chunk file not found: partition0-chunk000001"
        );

        let err = StorageError::CapacityExceeded {
            needed: 100,
            available: 10,
        };
        assert_eq!(
            err.to_string(),
            "Capacity exceeded: needed 100 bytes, 10 available"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
        assert!(storage_err.is_transient());
        assert!(!storage_err.is_corruption());
    }

    #[test]
    fn test_corruption_is_not_transient() {
        let err = StorageError::Corruption("leaf checksum mismatch".into());
        assert!(err.is_corruption());
        assert!(!err.is_transient());
    }
}
