use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::claim::ContentPointer;
use crate::id::{ConnectionId, RecordId};
use crate::time::now_ms;

/// Attribute map carried by every record.
///
/// Keys and values are arbitrary strings; insertion order is irrelevant, so
/// a `BTreeMap` gives deterministic serialization.
pub type Attributes = BTreeMap<String, String>;

/// Lifecycle state of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordState {
    /// Created inside a session, not yet committed anywhere.
    Pending,
    /// Resident in a connection queue.
    Queued,
    /// Pulled into an open session.
    InSession,
    /// Durably committed by a session.
    Committed,
    /// Terminally dropped; the record no longer exists in the flow.
    Dropped,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Queued => "Queued",
            Self::InSession => "InSession",
            Self::Committed => "Committed",
            Self::Dropped => "Dropped",
        };
        write!(f, "{s}")
    }
}

/// One unit of data in flight through the engine.
///
/// A record owns its attribute map and at most one content pointer. The
/// byte content itself lives in the content store; records only hold the
/// claim handle and a window into it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Process-wide unique identifier.
    pub id: RecordId,
    /// String attributes, mutable only within a session transaction.
    pub attributes: Attributes,
    /// Optional content reference. `None` means a zero-size record.
    pub content: Option<ContentPointer>,
    /// Current lifecycle state.
    pub state: RecordState,
    /// Wall-clock creation time, epoch milliseconds.
    pub created_at_ms: u64,
    /// Time the record last entered a queue, epoch milliseconds.
    /// Used for FIFO ordering and age-based expiration.
    pub enqueued_at_ms: u64,
    /// The connection the record was last committed to, if any.
    pub connection: Option<ConnectionId>,
}

impl FlowRecord {
    /// Create a fresh record with no content and no attributes.
    pub fn new(id: RecordId) -> Self {
        let now = now_ms();
        Self {
            id,
            attributes: Attributes::new(),
            content: None,
            state: RecordState::Pending,
            created_at_ms: now,
            enqueued_at_ms: now,
            connection: None,
        }
    }

    /// Content size in bytes; a record with no claim has size 0.
    pub fn size(&self) -> u64 {
        self.content.map(|c| c.size()).unwrap_or(0)
    }

    /// Age of the record relative to its last queue entry.
    pub fn queue_age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.enqueued_at_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{ContentClaim, ContentPointer};
    use crate::id::{ClaimId, ContainerId};

    #[test]
    fn new_record_has_no_content() {
        let record = FlowRecord::new(RecordId::new(1));
        assert_eq!(record.size(), 0);
        assert_eq!(record.state, RecordState::Pending);
        assert!(record.attributes.is_empty());
        assert!(record.connection.is_none());
    }

    #[test]
    fn size_follows_window() {
        let mut record = FlowRecord::new(RecordId::new(2));
        record.content = Some(ContentPointer::whole(ContentClaim {
            id: ClaimId::new(1),
            container: ContainerId::new(0),
            offset: 0,
            length: 10,
        }));
        assert_eq!(record.size(), 10);
    }

    #[test]
    fn queue_age_saturates() {
        let record = FlowRecord::new(RecordId::new(3));
        assert_eq!(record.queue_age_ms(0), 0);
        assert!(record.queue_age_ms(record.enqueued_at_ms + 500) == 500);
    }

    #[test]
    fn state_display() {
        assert_eq!(format!("{}", RecordState::Queued), "Queued");
        assert_eq!(format!("{}", RecordState::InSession), "InSession");
    }

    #[test]
    fn serde_roundtrip() {
        let mut record = FlowRecord::new(RecordId::new(4));
        record.attributes.insert("path".into(), "/in".into());
        let bytes = bincode::serialize(&record).unwrap();
        let decoded: FlowRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, decoded);
    }
}
