use serde::{Deserialize, Serialize};

use weir_types::{ContentClaim, FlowRecord};

use crate::error::{RepoError, RepoResult};

const MAGIC: &[u8; 4] = b"WEIK";
const VERSION: u32 = 1;

/// High-water marks for every identifier space, captured per transaction.
///
/// Recovery advances the engine's sequences past these, so identifiers are
/// never reused across a restart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    pub last_txn_id: Option<u64>,
    pub max_record_id: Option<u64>,
    pub max_event_id: Option<u64>,
    pub max_claim_id: Option<u64>,
    pub max_container_id: Option<u64>,
}

impl Watermarks {
    fn bump(slot: &mut Option<u64>, seen: u64) {
        *slot = Some(slot.map_or(seen, |prev| prev.max(seen)));
    }

    pub fn observe_txn(&mut self, txn_id: u64) {
        Self::bump(&mut self.last_txn_id, txn_id);
    }

    pub fn observe_record(&mut self, id: u64) {
        Self::bump(&mut self.max_record_id, id);
    }

    pub fn observe_event(&mut self, id: u64) {
        Self::bump(&mut self.max_event_id, id);
    }

    pub fn observe_claim(&mut self, claim_id: u64, container_id: u64) {
        Self::bump(&mut self.max_claim_id, claim_id);
        Self::bump(&mut self.max_container_id, container_id);
    }
}

/// Full live-record state written by a checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub watermarks: Watermarks,
    /// Every record alive at checkpoint time, in its last-committed state.
    pub records: Vec<FlowRecord>,
    /// Every claim with a positive reference count.
    pub claims: Vec<(ContentClaim, i64)>,
}

impl CheckpointSnapshot {
    /// Serialize: magic, version, bincode body, BLAKE3 trailer.
    pub fn to_bytes(&self) -> RepoResult<Vec<u8>> {
        let body =
            bincode::serialize(self).map_err(|e| RepoError::Serialization(e.to_string()))?;
        let mut buf = Vec::with_capacity(8 + body.len() + 32);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.extend_from_slice(&body);
        let checksum = *blake3::hash(&buf).as_bytes();
        buf.extend_from_slice(&checksum);
        Ok(buf)
    }

    /// Deserialize, validating magic, version, and checksum.
    ///
    /// The checkpoint is published by atomic rename, so any validation
    /// failure here is genuine corruption, not a torn write.
    pub fn from_bytes(data: &[u8]) -> RepoResult<Self> {
        if data.len() < 8 + 32 {
            return Err(RepoError::CorruptCheckpoint("too short".into()));
        }
        if &data[0..4] != MAGIC {
            return Err(RepoError::CorruptCheckpoint(format!(
                "bad magic {:?}",
                &data[0..4]
            )));
        }
        let version = u32::from_be_bytes(data[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(RepoError::UnsupportedVersion(version));
        }

        let body_end = data.len() - 32;
        let expected: [u8; 32] = data[body_end..].try_into().unwrap();
        let actual = *blake3::hash(&data[..body_end]).as_bytes();
        if expected != actual {
            return Err(RepoError::CorruptCheckpoint("checksum mismatch".into()));
        }

        bincode::deserialize(&data[8..body_end])
            .map_err(|e| RepoError::CorruptCheckpoint(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_types::{ClaimId, ContainerId, RecordId};

    fn sample() -> CheckpointSnapshot {
        let mut watermarks = Watermarks::default();
        watermarks.observe_txn(9);
        watermarks.observe_record(4);
        watermarks.observe_claim(2, 0);
        CheckpointSnapshot {
            watermarks,
            records: vec![FlowRecord::new(RecordId::new(4))],
            claims: vec![(
                ContentClaim {
                    id: ClaimId::new(2),
                    container: ContainerId::new(0),
                    offset: 0,
                    length: 64,
                },
                1,
            )],
        }
    }

    #[test]
    fn watermarks_track_maxima() {
        let mut w = Watermarks::default();
        assert_eq!(w.max_record_id, None);
        w.observe_record(5);
        w.observe_record(3);
        assert_eq!(w.max_record_id, Some(5));
        w.observe_event(0);
        assert_eq!(w.max_event_id, Some(0));
    }

    #[test]
    fn roundtrip() {
        let snapshot = sample();
        let bytes = snapshot.to_bytes().unwrap();
        let decoded = CheckpointSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snapshot, decoded);
    }

    #[test]
    fn empty_roundtrip() {
        let snapshot = CheckpointSnapshot::default();
        let decoded = CheckpointSnapshot::from_bytes(&snapshot.to_bytes().unwrap()).unwrap();
        assert_eq!(snapshot, decoded);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut bytes = sample().to_bytes().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        let err = CheckpointSnapshot::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, RepoError::CorruptCheckpoint(_)));
    }

    #[test]
    fn bad_version_rejected() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&7u32.to_be_bytes());
        let err = CheckpointSnapshot::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, RepoError::UnsupportedVersion(7)));
    }
}
