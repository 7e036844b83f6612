use std::io;
use std::path::PathBuf;

use weir_types::ConnectionId;

/// Errors produced by connection queues.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// I/O error during swap segment operations.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The queue is over its backpressure threshold.
    ///
    /// Not a permanent failure — the caller must retry or back off until
    /// the queue drains below its resume threshold.
    #[error("connection {connection} is over its backpressure threshold")]
    Backpressure { connection: ConnectionId },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A swap segment file failed validation.
    #[error("corrupt swap segment {path}: {reason}")]
    CorruptSegment { path: PathBuf, reason: String },
}

/// Convenience alias used throughout the queue crate.
pub type QueueResult<T> = std::result::Result<T, QueueError>;
