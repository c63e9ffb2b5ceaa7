//! Error types for stratum

use thiserror::Error;

/// Result type alias for stratum operations
pub type Result<T> = std::result::Result<T, StratumError>;

/// stratum error types
#[derive(Error, Debug)]
pub enum StratumError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A lifecycle-dependent operation was called before `initialize`
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// Invalid caller input (empty file name, bad metadata, inverted time span)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Shard header is unreadable or fails verification
    #[error("corrupt header in '{path}': {reason}")]
    CorruptHeader { path: String, reason: String },

    /// Record LRC mismatch during read
    #[error(
        "corrupt record in '{path}' at offset {offset}: expected LRC {expected:#04x}, got {actual:#04x}"
    )]
    CorruptRecord {
        path: String,
        offset: u64,
        expected: u8,
        actual: u8,
    },

    /// `create` was called on a file that already exists
    #[error("file already exists: {0}")]
    AlreadyExists(String),
}

impl StratumError {
    /// Check if the error indicates on-disk corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StratumError::CorruptHeader { .. } | StratumError::CorruptRecord { .. }
        )
    }
}
