use serde::{Deserialize, Serialize};

use weir_types::{Attributes, ConnectionId, RecordId};

/// Classification of record lifecycle transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvenanceEventKind {
    /// A record was created by a session.
    Create,
    /// A record was cloned from another record (shared content claim).
    Clone,
    /// A record's attribute map was changed.
    AttributesModified,
    /// A record received a new content claim.
    ContentModified,
    /// A record was transferred to a connection.
    Route,
    /// A record was terminally dropped.
    Drop,
    /// A record exceeded its queue's maximum age and was dropped at poll.
    Expire,
}

impl std::fmt::Display for ProvenanceEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "Create",
            Self::Clone => "Clone",
            Self::AttributesModified => "AttributesModified",
            Self::ContentModified => "ContentModified",
            Self::Route => "Route",
            Self::Drop => "Drop",
            Self::Expire => "Expire",
        };
        write!(f, "{s}")
    }
}

/// Immutable description of one lifecycle transition.
///
/// Events are assigned process-wide monotonic identifiers so the on-disk
/// projection can be rebuilt idempotently from replayed transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    /// Monotonic event identifier.
    pub event_id: u64,
    /// What happened.
    pub kind: ProvenanceEventKind,
    /// The record this event is about.
    pub record: RecordId,
    /// Related records (clone parent/children).
    pub related: Vec<RecordId>,
    /// Wall-clock time of the transition, epoch milliseconds.
    pub timestamp_ms: u64,
    /// Connection the record came from, if it was pulled.
    pub source: Option<ConnectionId>,
    /// Connection the record was routed to, if transferred.
    pub destination: Option<ConnectionId>,
    /// Attribute snapshot at the time of the event.
    pub attributes: Attributes,
    /// Free-form detail, e.g. an expiration reason.
    pub details: Option<String>,
}

impl ProvenanceEvent {
    /// Build a minimal event; callers fill in the optional fields.
    pub fn new(event_id: u64, kind: ProvenanceEventKind, record: RecordId) -> Self {
        Self {
            event_id,
            kind,
            record,
            related: Vec::new(),
            timestamp_ms: weir_types::now_ms(),
            source: None,
            destination: None,
            attributes: Attributes::new(),
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_has_defaults() {
        let event = ProvenanceEvent::new(1, ProvenanceEventKind::Create, RecordId::new(5));
        assert_eq!(event.event_id, 1);
        assert_eq!(event.record, RecordId::new(5));
        assert!(event.related.is_empty());
        assert!(event.source.is_none());
        assert!(event.destination.is_none());
    }

    #[test]
    fn kind_display() {
        assert_eq!(format!("{}", ProvenanceEventKind::Route), "Route");
        assert_eq!(format!("{}", ProvenanceEventKind::Expire), "Expire");
    }

    #[test]
    fn serde_roundtrip() {
        let mut event = ProvenanceEvent::new(9, ProvenanceEventKind::Clone, RecordId::new(2));
        event.related.push(RecordId::new(3));
        event.destination = Some(ConnectionId::new(1));
        event.attributes.insert("filename".into(), "a.csv".into());

        let bytes = bincode::serialize(&event).unwrap();
        let decoded: ProvenanceEvent = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
