use std::io;

/// Errors produced by the provenance log.
#[derive(Debug, thiserror::Error)]
pub enum ProvenanceError {
    /// I/O error during log file operations.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout the provenance crate.
pub type ProvenanceResult<T> = std::result::Result<T, ProvenanceError>;
