//! Write-ahead record repository.
//!
//! Every session commit appends exactly one [`RecordTransaction`] — the
//! records created, modified, or dropped, the claim reference-count deltas,
//! and the provenance events — to an append-only log. The append is the
//! commit's durability boundary: once it returns, the transaction survives
//! a crash and is replayed on the next startup.
//!
//! A periodic checkpoint rewrites the repository to just the live record
//! state, bounding replay time. Checkpoints are published atomically
//! (write temp file, fsync, rename), so a crash mid-checkpoint leaves the
//! previous checkpoint and the intact log.

pub mod checkpoint;
pub mod error;
pub mod repository;
pub mod transaction;

pub use checkpoint::{CheckpointSnapshot, Watermarks};
pub use error::{RepoError, RepoResult};
pub use repository::{RecordRepository, RecoveredState, RepoConfig, SyncMode};
pub use transaction::{ClaimDelta, RecordChange, RecordTransaction};
