use weir_content::ContentError;
use weir_provenance::ProvenanceError;
use weir_queue::QueueError;
use weir_repo::RepoError;
use weir_types::{ConnectionId, RecordId};

/// Errors surfaced to stages by the engine and its sessions.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Content store failure. A content-unavailable error forces the
    /// session to roll back.
    #[error(transparent)]
    Content(#[from] ContentError),

    /// Record repository failure. Fatal to the commit in progress; the
    /// engine keeps serving other sessions.
    #[error(transparent)]
    Repository(#[from] RepoError),

    /// Queue failure, including backpressure. Backpressure is retryable.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Provenance log failure.
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),

    /// The session has already committed or rolled back.
    #[error("session is closed")]
    SessionClosed,

    /// The record is not held by this session (never pulled/created here,
    /// or already dropped).
    #[error("record {record} is not held by this session")]
    RecordNotInSession { record: RecordId },

    /// Commit was attempted while records lack a terminal disposition.
    /// Rejected before any durable write.
    #[error("commit with undisposed records: {records:?}")]
    IncompleteTransaction { records: Vec<RecordId> },

    /// No connection with the given id exists.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// A connection cannot be removed while records remain queued.
    #[error("connection {connection} still holds {count} records")]
    ConnectionNotEmpty {
        connection: ConnectionId,
        count: usize,
    },

    /// The engine is shutting down and accepts no new sessions.
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Convenience alias used throughout the engine crate.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
