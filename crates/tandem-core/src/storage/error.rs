//! Storage error types.
//!
//! - `NotFound`: A record that must exist is absent
//! - `Serialization`: Failed to encode/decode a record
//! - `Io`: Underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Record not found
    #[error("record not found: {key}")]
    NotFound {
        /// Full storage key that was looked up
        key: String,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl<T: std::fmt::Debug> From<ciborium::ser::Error<T>> for StorageError {
    fn from(err: ciborium::ser::Error<T>) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl<T: std::fmt::Debug> From<ciborium::de::Error<T>> for StorageError {
    fn from(err: ciborium::de::Error<T>) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
