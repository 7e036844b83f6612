use std::io;

use weir_types::ClaimId;

/// Errors produced by the content store.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    /// I/O error during container or index file operations.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The underlying byte range is missing or unreadable.
    ///
    /// Surfaced to the calling stage; the owning session must roll back.
    #[error("content unavailable for {claim}: {reason}")]
    Unavailable { claim: ClaimId, reason: String },

    /// The claim is not registered with the store.
    #[error("unknown claim {0}")]
    UnknownClaim(ClaimId),

    /// A read window does not fit inside the claim.
    #[error("read window [{offset}, {offset}+{length}) exceeds claim {claim} of length {claim_length}")]
    ReadOutOfBounds {
        claim: ClaimId,
        offset: u64,
        length: u64,
        claim_length: u64,
    },

    /// A reference-count decrement would underflow.
    #[error("reference count underflow for claim {0}")]
    RefUnderflow(ClaimId),

    /// Container index file has an invalid magic value.
    #[error("invalid index magic: expected {expected}, got {actual}")]
    InvalidMagic { expected: String, actual: String },

    /// Container index file has an unsupported version.
    #[error("unsupported index version {0}")]
    UnsupportedVersion(u32),

    /// Container index file is structurally corrupt.
    #[error("container index corrupted: {0}")]
    IndexCorrupted(String),
}

/// Convenience alias used throughout the content crate.
pub type ContentResult<T> = std::result::Result<T, ContentError>;
