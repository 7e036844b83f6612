use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter backing an id space.
///
/// One `Sequence` exists per id space (records, claims, transactions, …).
/// Counters start at zero on first boot and are advanced past the
/// repository-derived high-water mark during recovery, so identifiers never
/// repeat across restarts.
#[derive(Debug, Default)]
pub struct Sequence(AtomicU64);

impl Sequence {
    /// A sequence whose next value is `start`.
    pub fn starting_at(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    /// Claim the next value.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Ensure the next value is strictly greater than `seen`.
    ///
    /// Used during recovery: each replayed identifier is fed through this so
    /// the counter resumes above everything already durable.
    pub fn advance_past(&self, seen: u64) {
        self.0.fetch_max(seen + 1, Ordering::Relaxed);
    }

    /// The value the next call to [`next`](Self::next) would return.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
