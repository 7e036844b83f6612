use serde::{Deserialize, Serialize};

use weir_provenance::ProvenanceEvent;
use weir_types::{ContentClaim, FlowRecord, RecordId};

/// One record's state change within a committed transaction.
///
/// `Create` and `Update` carry the full post-commit record, including its
/// destination connection, so recovery can re-populate queues directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordChange {
    /// A record created by the session.
    Create(FlowRecord),
    /// An existing record modified (attributes, content, or connection).
    Update(FlowRecord),
    /// A record terminally removed from the flow.
    Drop(RecordId),
}

impl RecordChange {
    /// The identifier of the record this change concerns.
    pub fn record_id(&self) -> RecordId {
        match self {
            Self::Create(r) | Self::Update(r) => r.id,
            Self::Drop(id) => *id,
        }
    }
}

/// A claim reference-count delta applied by a committed transaction.
///
/// Deltas carry the full claim handle so replay can rebuild the content
/// store's claim table without consulting any other source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimDelta {
    pub claim: ContentClaim,
    pub delta: i32,
}

/// The atomic unit appended to the repository log by one session commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTransaction {
    /// Monotonic transaction identifier.
    pub txn_id: u64,
    /// Every record created, modified, or removed by the session.
    pub changes: Vec<RecordChange>,
    /// Claim reference-count deltas, applied only after the durable append.
    pub claim_deltas: Vec<ClaimDelta>,
    /// Provenance events staged by the session. Riding inside the
    /// transaction gives events and record changes one durability boundary.
    pub events: Vec<ProvenanceEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_types::{ClaimId, ContainerId};

    #[test]
    fn change_exposes_record_id() {
        let record = FlowRecord::new(RecordId::new(7));
        assert_eq!(RecordChange::Create(record.clone()).record_id(), record.id);
        assert_eq!(RecordChange::Update(record).record_id(), RecordId::new(7));
        assert_eq!(
            RecordChange::Drop(RecordId::new(3)).record_id(),
            RecordId::new(3)
        );
    }

    #[test]
    fn serde_roundtrip() {
        let txn = RecordTransaction {
            txn_id: 12,
            changes: vec![
                RecordChange::Create(FlowRecord::new(RecordId::new(1))),
                RecordChange::Drop(RecordId::new(2)),
            ],
            claim_deltas: vec![ClaimDelta {
                claim: ContentClaim {
                    id: ClaimId::new(4),
                    container: ContainerId::new(0),
                    offset: 0,
                    length: 16,
                },
                delta: -1,
            }],
            events: vec![],
        };
        let bytes = bincode::serialize(&txn).unwrap();
        let decoded: RecordTransaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(txn, decoded);
    }
}
