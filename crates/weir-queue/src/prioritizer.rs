use std::cmp::Ordering;

use weir_types::FlowRecord;

/// Ordering policy for a connection queue.
///
/// Implementations compare two records; `Ordering::Less` means `a` is
/// polled first. The queue itself breaks ties by record identifier, so a
/// prioritizer never needs to.
///
/// The trait is object-safe and `Send + Sync` so a queue can hold its
/// prioritizer as `Arc<dyn RecordPrioritizer>`.
pub trait RecordPrioritizer: Send + Sync {
    /// Human-readable name of this policy (e.g. "fifo").
    fn name(&self) -> &str;

    /// Relative priority of `a` versus `b`.
    fn compare(&self, a: &FlowRecord, b: &FlowRecord) -> Ordering;
}

/// First-in, first-out by queue entry time. The default.
#[derive(Clone, Copy, Debug, Default)]
pub struct FifoPrioritizer;

impl RecordPrioritizer for FifoPrioritizer {
    fn name(&self) -> &str {
        "fifo"
    }

    fn compare(&self, a: &FlowRecord, b: &FlowRecord) -> Ordering {
        a.enqueued_at_ms.cmp(&b.enqueued_at_ms)
    }
}

/// Oldest record (by creation time) first, regardless of queue entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct OldestFirstPrioritizer;

impl RecordPrioritizer for OldestFirstPrioritizer {
    fn name(&self) -> &str {
        "oldest-first"
    }

    fn compare(&self, a: &FlowRecord, b: &FlowRecord) -> Ordering {
        a.created_at_ms.cmp(&b.created_at_ms)
    }
}

/// Smallest content first; useful ahead of expensive per-byte stages.
#[derive(Clone, Copy, Debug, Default)]
pub struct SmallestFirstPrioritizer;

impl RecordPrioritizer for SmallestFirstPrioritizer {
    fn name(&self) -> &str {
        "smallest-first"
    }

    fn compare(&self, a: &FlowRecord, b: &FlowRecord) -> Ordering {
        a.size().cmp(&b.size())
    }
}
