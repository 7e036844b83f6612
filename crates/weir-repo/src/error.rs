use std::io;

/// Errors produced by the record repository.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// I/O error during log or checkpoint operations.
    ///
    /// On the append path this is fatal to the commit in progress but not
    /// to the engine.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A corrupt transaction entry was found mid-log during replay.
    ///
    /// A corrupt *trailing* entry is expected after an unclean shutdown and
    /// is discarded with a warning; corruption with valid entries after it
    /// means the log itself is damaged and startup must halt.
    #[error("corrupt transaction entry at offset {offset} with valid entries following")]
    CorruptLogEntry { offset: u64 },

    /// The checkpoint file failed validation.
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// The checkpoint file has an unsupported version.
    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),
}

/// Convenience alias used throughout the repository crate.
pub type RepoResult<T> = std::result::Result<T, RepoError>;
