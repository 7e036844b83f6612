use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use weir_types::RecordId;

use crate::error::{ProvenanceError, ProvenanceResult};
use crate::event::ProvenanceEvent;

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

struct LogState {
    writer: BufWriter<File>,
    offset: u64,
    last_event_id: Option<u64>,
    count: u64,
}

/// Append-only, queryable provenance event file.
///
/// Events are serialized with bincode and framed with a length prefix and a
/// CRC32 checksum. The file is a projection of the record repository's
/// transactions: [`append_batch`](Self::append_batch) skips events at or
/// below the current high-water mark, so recovery can blindly re-append the
/// events of replayed transactions.
pub struct ProvenanceLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl ProvenanceLog {
    /// Open (or create) the event log at the given path.
    ///
    /// A torn trailing frame (unclean shutdown) is discarded with a warning
    /// and the file truncated to the last valid frame. A corrupt frame with
    /// valid frames after it is also truncated — the repository transaction
    /// log is the source of truth, and the lost suffix is re-projected from
    /// it during recovery.
    pub fn open(path: &Path) -> ProvenanceResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (events, valid_len) = if path.exists() {
            read_frames(path)?
        } else {
            (Vec::new(), 0)
        };

        let file_len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if valid_len < file_len {
            warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "discarding invalid provenance log tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
        }

        let last_event_id = events.iter().map(|e| e.event_id).max();
        let count = events.len() as u64;

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = %path.display(), events = count, "provenance log opened");

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(LogState {
                writer: BufWriter::new(file),
                offset: valid_len,
                last_event_id,
                count,
            }),
        })
    }

    /// Append a batch of events, skipping any already recorded.
    ///
    /// Returns the number of events actually appended.
    pub fn append_batch(&self, events: &[ProvenanceEvent]) -> ProvenanceResult<usize> {
        let mut state = self.state.lock().expect("provenance log lock poisoned");
        let mut appended = 0;

        for event in events {
            if let Some(last) = state.last_event_id {
                if event.event_id <= last {
                    continue;
                }
            }
            let payload = bincode::serialize(event)
                .map_err(|e| ProvenanceError::Serialization(e.to_string()))?;
            let crc = crc32fast::hash(&payload);
            state.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
            state.writer.write_all(&crc.to_le_bytes())?;
            state.writer.write_all(&payload)?;
            state.offset += (HEADER_SIZE + payload.len()) as u64;
            state.last_event_id = Some(event.event_id);
            state.count += 1;
            appended += 1;
        }

        if appended > 0 {
            state.writer.flush()?;
        }
        Ok(appended)
    }

    /// All events concerning the given record (as subject or relative).
    pub fn events_for_record(&self, record: RecordId) -> ProvenanceResult<Vec<ProvenanceEvent>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|e| e.record == record || e.related.contains(&record))
            .collect())
    }

    /// All events with `from_ms <= timestamp_ms <= to_ms`.
    pub fn events_in_range(
        &self,
        from_ms: u64,
        to_ms: u64,
    ) -> ProvenanceResult<Vec<ProvenanceEvent>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|e| e.timestamp_ms >= from_ms && e.timestamp_ms <= to_ms)
            .collect())
    }

    /// Highest event id recorded, if any.
    pub fn last_event_id(&self) -> Option<u64> {
        self.state
            .lock()
            .expect("provenance log lock poisoned")
            .last_event_id
    }

    /// Number of events in the log.
    pub fn event_count(&self) -> u64 {
        self.state
            .lock()
            .expect("provenance log lock poisoned")
            .count
    }

    /// Linear scan of every event in the file.
    pub fn scan(&self) -> ProvenanceResult<Vec<ProvenanceEvent>> {
        {
            let mut state = self.state.lock().expect("provenance log lock poisoned");
            state.writer.flush()?;
        }
        let (events, _) = read_frames(&self.path)?;
        Ok(events)
    }
}

/// Read valid frames front-to-back; returns the events and the byte length
/// of the valid prefix.
fn read_frames(path: &Path) -> ProvenanceResult<(Vec<ProvenanceEvent>, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut events = Vec::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE as u64 <= file_len {
        file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; HEADER_SIZE];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length == 0 || offset + HEADER_SIZE as u64 + length as u64 > file_len {
            warn!(offset, length, "invalid provenance frame length; stopping scan");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated provenance frame; stopping scan");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        if crc32fast::hash(&payload) != expected_crc {
            warn!(offset, "provenance frame CRC mismatch; stopping scan");
            break;
        }

        match bincode::deserialize::<ProvenanceEvent>(&payload) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(offset, error = %e, "undecodable provenance frame; stopping scan");
                break;
            }
        }

        offset += HEADER_SIZE as u64 + length as u64;
    }

    Ok((events, offset))
}
