use weir_types::ClaimId;

use crate::error::{ContentError, ContentResult};

/// One entry in a container index: where a claim's bytes live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub claim: ClaimId,
    pub offset: u64,
    pub length: u64,
    pub sealed: bool,
}

/// Sidecar index written when a container rotates.
///
/// Layout:
/// - magic `WEIC` + version
/// - entry count
/// - entries: claim id, offset, length, seal flag (big-endian, fixed width)
/// - BLAKE3 checksum of everything so far
///
/// The record repository remains the authority for live claims after a
/// crash; the index exists for operators and is verified on store open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerIndex {
    pub entries: Vec<IndexEntry>,
}

const MAGIC: &[u8; 4] = b"WEIC";
const VERSION: u32 = 1;
/// claim u64 + offset u64 + length u64 + sealed u8
const ENTRY_SIZE: usize = 8 + 8 + 8 + 1;

impl ContainerIndex {
    /// Build an index from entries.
    pub fn new(mut entries: Vec<IndexEntry>) -> Self {
        entries.sort_by_key(|e| e.offset);
        Self { entries }
    }

    /// Number of claims recorded.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.entries.len() * ENTRY_SIZE + 32);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.claim.as_u64().to_be_bytes());
            buf.extend_from_slice(&entry.offset.to_be_bytes());
            buf.extend_from_slice(&entry.length.to_be_bytes());
            buf.push(entry.sealed as u8);
        }
        let checksum = *blake3::hash(&buf).as_bytes();
        buf.extend_from_slice(&checksum);
        buf
    }

    /// Deserialize from bytes, validating magic, version, and checksum.
    pub fn from_bytes(data: &[u8]) -> ContentResult<Self> {
        if data.len() < 12 {
            return Err(ContentError::IndexCorrupted("too short".into()));
        }
        if &data[0..4] != MAGIC {
            return Err(ContentError::InvalidMagic {
                expected: "WEIC".into(),
                actual: String::from_utf8_lossy(&data[0..4]).into(),
            });
        }
        let version = u32::from_be_bytes(data[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(ContentError::UnsupportedVersion(version));
        }
        let count = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;

        let body_len = 12 + count * ENTRY_SIZE;
        if data.len() < body_len + 32 {
            return Err(ContentError::IndexCorrupted("data truncated".into()));
        }

        let expected: [u8; 32] = data[body_len..body_len + 32].try_into().unwrap();
        let actual = *blake3::hash(&data[..body_len]).as_bytes();
        if expected != actual {
            return Err(ContentError::IndexCorrupted("checksum mismatch".into()));
        }

        let mut entries = Vec::with_capacity(count);
        let mut pos = 12;
        for _ in 0..count {
            let claim = u64::from_be_bytes(data[pos..pos + 8].try_into().unwrap());
            let offset = u64::from_be_bytes(data[pos + 8..pos + 16].try_into().unwrap());
            let length = u64::from_be_bytes(data[pos + 16..pos + 24].try_into().unwrap());
            let sealed = data[pos + 24] != 0;
            entries.push(IndexEntry {
                claim: ClaimId::new(claim),
                offset,
                length,
                sealed,
            });
            pos += ENTRY_SIZE;
        }

        Ok(Self { entries })
    }
}
