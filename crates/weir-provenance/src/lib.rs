//! Append-only provenance event log.
//!
//! Every record lifecycle transition (create, clone, modify, route, drop,
//! expire) is captured as a [`ProvenanceEvent`]. Events are made durable
//! inside the record repository's transaction — the repository append is the
//! single durability boundary for a commit — and the on-disk event log kept
//! by this crate is a projection of those transactions, rebuilt idempotently
//! after a crash.
//!
//! Queries are linear scans by design; long-term indexing is an external
//! concern.

pub mod error;
pub mod event;
pub mod log;

pub use error::{ProvenanceError, ProvenanceResult};
pub use event::{ProvenanceEvent, ProvenanceEventKind};
pub use log::ProvenanceLog;
