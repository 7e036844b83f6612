//! Foundation types for the weir record lifecycle engine.
//!
//! This crate provides the identifiers, content-claim handles, and record
//! types shared by every other weir crate.
//!
//! # Key Types
//!
//! - [`RecordId`] — Process-wide monotonic record identifier
//! - [`ContentClaim`] — Handle to an immutable byte range in the content store
//! - [`ContentPointer`] — A record's windowed view into a claim
//! - [`FlowRecord`] — One unit of data in flight, with attributes and state
//! - [`Sequence`] — Atomic monotonic counter backing all id spaces

pub mod claim;
pub mod error;
pub mod id;
pub mod record;
pub mod sequence;
pub mod time;

pub use claim::{ContentClaim, ContentPointer, ContentWindow};
pub use error::TypeError;
pub use id::{ClaimId, ConnectionId, ContainerId, RecordId};
pub use record::{Attributes, FlowRecord, RecordState};
pub use sequence::Sequence;
pub use time::now_ms;
