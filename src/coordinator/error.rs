//! Coordinator error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    /// A partition map that cannot route every key
    #[error("Invalid partition map: {0}")]
    InvalidMap(String),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
