use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use weir_types::FlowRecord;

use crate::error::{QueueError, QueueResult};

const MAGIC: &[u8; 4] = b"WEIS";
const VERSION: u32 = 1;

/// In-memory marker for a batch of records swapped to disk.
///
/// Only the count and aggregate byte size stay resident; the records
/// themselves live in the segment file until swap-in.
#[derive(Clone, Debug)]
pub struct SwapSegment {
    pub path: PathBuf,
    pub count: usize,
    pub bytes: u64,
}

/// Serialize a batch of records to a swap segment file.
///
/// Layout: magic `WEIS`, version, record count, compressed payload length,
/// CRC32 of the compressed payload, zstd-compressed bincode payload.
pub(crate) fn write_segment(path: &Path, records: &[FlowRecord]) -> QueueResult<SwapSegment> {
    let payload =
        bincode::serialize(records).map_err(|e| QueueError::Serialization(e.to_string()))?;
    let compressed = zstd::encode_all(payload.as_slice(), 3)
        .map_err(|e| QueueError::Serialization(e.to_string()))?;

    let mut buf = Vec::with_capacity(20 + compressed.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_be_bytes());
    buf.extend_from_slice(&(records.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&compressed).to_le_bytes());
    buf.extend_from_slice(&compressed);

    fs::write(path, &buf)?;

    let bytes = records.iter().map(FlowRecord::size).sum();
    debug!(path = %path.display(), count = records.len(), "swap segment written");
    Ok(SwapSegment {
        path: path.to_path_buf(),
        count: records.len(),
        bytes,
    })
}

/// Read a swap segment back, validating framing and checksum.
///
/// The caller removes the file once the records are safely back in memory.
pub(crate) fn read_segment(path: &Path) -> QueueResult<Vec<FlowRecord>> {
    let data = fs::read(path)?;
    let corrupt = |reason: &str| QueueError::CorruptSegment {
        path: path.to_path_buf(),
        reason: reason.into(),
    };

    if data.len() < 20 {
        return Err(corrupt("too short"));
    }
    if &data[0..4] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if version != VERSION {
        return Err(corrupt(&format!("unsupported version {version}")));
    }
    let count = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;
    let compressed_len = u32::from_le_bytes(data[12..16].try_into().unwrap()) as usize;
    let expected_crc = u32::from_le_bytes(data[16..20].try_into().unwrap());

    if data.len() != 20 + compressed_len {
        return Err(corrupt("length mismatch"));
    }
    let compressed = &data[20..];
    if crc32fast::hash(compressed) != expected_crc {
        return Err(corrupt("checksum mismatch"));
    }

    let payload = zstd::decode_all(compressed).map_err(|e| corrupt(&e.to_string()))?;
    let records: Vec<FlowRecord> =
        bincode::deserialize(&payload).map_err(|e| QueueError::Serialization(e.to_string()))?;
    if records.len() != count {
        return Err(corrupt("record count mismatch"));
    }

    debug!(path = %path.display(), count, "swap segment read");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_types::RecordId;

    fn records(n: u64) -> Vec<FlowRecord> {
        (0..n)
            .map(|i| {
                let mut r = FlowRecord::new(RecordId::new(i));
                r.attributes.insert("n".into(), i.to_string());
                r
            })
            .collect()
    }

    #[test]
    fn write_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q1-0.swap");
        let batch = records(10);

        let segment = write_segment(&path, &batch).unwrap();
        assert_eq!(segment.count, 10);

        let back = read_segment(&path).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q1-0.swap");
        write_segment(&path, &records(5)).unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let err = read_segment(&path).unwrap_err();
        assert!(matches!(err, QueueError::CorruptSegment { .. }));
    }

    #[test]
    fn truncated_segment_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q1-0.swap");
        write_segment(&path, &records(5)).unwrap();

        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 6]).unwrap();

        let err = read_segment(&path).unwrap_err();
        assert!(matches!(err, QueueError::CorruptSegment { .. }));
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q1-0.swap");
        fs::write(&path, b"NOPE0000000000000000====").unwrap();
        let err = read_segment(&path).unwrap_err();
        assert!(matches!(err, QueueError::CorruptSegment { .. }));
    }

    #[test]
    fn empty_batch_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q1-0.swap");
        write_segment(&path, &[]).unwrap();
        assert!(read_segment(&path).unwrap().is_empty());
    }
}
