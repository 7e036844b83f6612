//! Prioritized, swappable, backpressured connection queues.
//!
//! A [`ConnectionQueue`] is the ordered buffer of records between exactly
//! one upstream and one downstream stage. Ordering is driven by a pluggable
//! [`RecordPrioritizer`] (FIFO by default, ties broken by record id). When
//! the queue grows past its swap threshold, the lowest-priority records are
//! serialized to disk in bulk and only a count/size marker stays in memory;
//! segments swap back in oldest-first as the active segment drains, which
//! keeps ordering strict within each segment and approximate globally.
//!
//! Backpressure is a cooperative signal with hysteresis: once the queue
//! crosses its record-count or byte-size limit, offers fail (or block, via
//! [`ConnectionQueue::offer_wait`]) until occupancy drains below the resume
//! threshold.

pub mod error;
pub mod prioritizer;
pub mod queue;
pub mod swap;

pub use error::{QueueError, QueueResult};
pub use prioritizer::{
    FifoPrioritizer, OldestFirstPrioritizer, RecordPrioritizer, SmallestFirstPrioritizer,
};
pub use queue::{ConnectionQueue, QueueConfig, QueueSize};
pub use swap::SwapSegment;
