//! Error types for kestrel.

use thiserror::Error;

/// Result type alias using KestrelError.
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Errors that can occur in kestrel operations.
#[derive(Debug, Error)]
pub enum KestrelError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Shared memory errors
    #[error("out of shared memory (requested {requested} bytes); {hint}")]
    OutOfSharedMemory { requested: usize, hint: &'static str },

    #[error("Shared memory block corrupted at offset {offset}: {reason}")]
    BlockCorrupted { offset: u64, reason: String },

    #[error("Shared memory block overrun at offset {offset}")]
    BlockOverrun { offset: u64 },

    #[error("Message queue is closed")]
    QueueClosed,

    // Cache errors
    #[error("Columnar cache build aborted: {0}")]
    BuildAborted(String),

    #[error("Relation {0} is not cached")]
    RelationNotCached(String),

    #[error("Column {attnum} is not cached")]
    ColumnNotCached { attnum: u16 },

    #[error("Chunk full, unable to insert row")]
    ChunkFull,

    // Type errors
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Row shape mismatch: expected {expected} attributes, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Null value not allowed in column {0}")]
    NullNotAllowed(String),

    #[error("Malformed row: {0}")]
    MalformedRow(String),

    // Catalog errors
    #[error("Relation not found: {0}")]
    RelationNotFound(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KestrelError {
    /// Hint attached to every out-of-memory report.
    pub const SEGMENT_SIZE_HINT: &'static str = "consider increasing shmem_size_mb";

    /// Builds the out-of-memory error for an allocation of `requested` bytes.
    pub fn out_of_memory(requested: usize) -> Self {
        KestrelError::OutOfSharedMemory {
            requested,
            hint: Self::SEGMENT_SIZE_HINT,
        }
    }

    /// Returns true for arena exhaustion. Callers may skip caching instead
    /// of failing the triggering operation.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, KestrelError::OutOfSharedMemory { .. })
    }

    /// Returns true for errors that indicate a bug rather than a user mistake.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            KestrelError::InvariantViolation(_)
                | KestrelError::Internal(_)
                | KestrelError::BlockCorrupted { .. }
                | KestrelError::BlockOverrun { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::OutOfMemory, "mmap failed");
        let err: KestrelError = io_err.into();
        assert!(matches!(err, KestrelError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_out_of_memory_display() {
        let err = KestrelError::out_of_memory(4096);
        assert!(err.is_out_of_memory());
        assert!(!err.is_internal());
        let msg = err.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("shmem_size_mb"));
    }

    #[test]
    fn test_internal_classification() {
        assert!(KestrelError::InvariantViolation("x".into()).is_internal());
        assert!(KestrelError::BlockOverrun { offset: 64 }.is_internal());
        assert!(!KestrelError::QueueClosed.is_internal());
        assert!(!KestrelError::NullNotAllowed("id".into()).is_internal());
    }

    #[test]
    fn test_error_display() {
        let err = KestrelError::ShapeMismatch {
            expected: 3,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "Row shape mismatch: expected 3 attributes, got 2"
        );

        let err = KestrelError::InvalidParameter {
            name: "num_columnizers".to_string(),
            value: "0".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid parameter: num_columnizers = 0");
    }
}
