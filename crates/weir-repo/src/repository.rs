use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use weir_provenance::ProvenanceEvent;
use weir_types::{ClaimId, ContentClaim, FlowRecord, RecordId, Sequence};

use crate::checkpoint::{CheckpointSnapshot, Watermarks};
use crate::error::{RepoError, RepoResult};
use crate::transaction::{RecordChange, RecordTransaction};

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

const WAL_FILE: &str = "records.wal";
const CHECKPOINT_FILE: &str = "checkpoint.bin";
const CHECKPOINT_TMP: &str = "checkpoint.bin.tmp";

/// Flush/sync strategy for the transaction log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// `fsync` after every transaction (the commit durability contract).
    #[default]
    EveryWrite,
    /// Rely on OS page-cache buffering (testing and bulk loads only).
    OsDefault,
}

/// Configuration for the record repository.
#[derive(Clone, Copy, Debug, Default)]
pub struct RepoConfig {
    pub sync_mode: SyncMode,
}

/// State reconstructed by replay at startup.
#[derive(Debug, Default)]
pub struct RecoveredState {
    /// Every live record in its last-committed state, ordered by id.
    pub records: Vec<FlowRecord>,
    /// Every claim with a positive reference count.
    pub claims: Vec<(ContentClaim, i64)>,
    /// Identifier high-water marks for re-seeding generators.
    pub watermarks: Watermarks,
    /// Provenance events of transactions replayed from the log (events
    /// already covered by the checkpoint are in the provenance file).
    pub events: Vec<ProvenanceEvent>,
}

#[derive(Debug)]
struct RepoInner {
    writer: BufWriter<File>,
    offset: u64,
    records: HashMap<RecordId, FlowRecord>,
    claims: HashMap<ClaimId, (ContentClaim, i64)>,
    watermarks: Watermarks,
}

/// Append-only transaction log plus checkpoint for record metadata.
///
/// The append path serializes behind one mutex scoped to this repository;
/// queue reads and content reads never touch it. The repository also keeps
/// the last-committed state of every live record in memory, so checkpoints
/// never scan queues.
#[derive(Debug)]
pub struct RecordRepository {
    wal_path: PathBuf,
    checkpoint_path: PathBuf,
    checkpoint_tmp_path: PathBuf,
    config: RepoConfig,
    txn_ids: Sequence,
    inner: Mutex<RepoInner>,
}

impl RecordRepository {
    /// Open the repository rooted at `dir`, replaying any prior state.
    ///
    /// Recovery loads the latest checkpoint, replays subsequent log entries
    /// in order, and rebuilds the record map and claim reference counts.
    /// A torn trailing entry is discarded with a warning; a corrupt entry
    /// followed by valid entries halts startup with
    /// [`RepoError::CorruptLogEntry`].
    pub fn open(dir: &Path, config: RepoConfig) -> RepoResult<(Self, RecoveredState)> {
        fs::create_dir_all(dir)?;
        let wal_path = dir.join(WAL_FILE);
        let checkpoint_path = dir.join(CHECKPOINT_FILE);
        let checkpoint_tmp_path = dir.join(CHECKPOINT_TMP);

        // A leftover temp file is an unpublished checkpoint from a crash.
        match fs::remove_file(&checkpoint_tmp_path) {
            Ok(()) => warn!("removed unpublished checkpoint temp file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let snapshot = if checkpoint_path.exists() {
            let snapshot = CheckpointSnapshot::from_bytes(&fs::read(&checkpoint_path)?)?;
            info!(
                records = snapshot.records.len(),
                claims = snapshot.claims.len(),
                "loaded checkpoint"
            );
            snapshot
        } else {
            CheckpointSnapshot::default()
        };

        let mut records: HashMap<RecordId, FlowRecord> = snapshot
            .records
            .into_iter()
            .map(|r| (r.id, r))
            .collect();
        let mut claims: HashMap<ClaimId, (ContentClaim, i64)> = snapshot
            .claims
            .into_iter()
            .map(|(c, n)| (c.id, (c, n)))
            .collect();
        let mut watermarks = snapshot.watermarks;
        let mut events = Vec::new();

        let valid_len = if wal_path.exists() {
            replay_log(&wal_path, |txn| {
                apply_txn(&mut records, &mut claims, &mut watermarks, &txn);
                events.extend(txn.events);
            })?
        } else {
            0
        };

        let file_len = fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);
        if valid_len < file_len {
            warn!(valid_len, file_len, "truncating torn transaction log tail");
            let file = OpenOptions::new().write(true).open(&wal_path)?;
            file.set_len(valid_len)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&wal_path)?;
        let txn_ids = Sequence::starting_at(watermarks.last_txn_id.map_or(0, |t| t + 1));

        info!(
            records = records.len(),
            claims = claims.len(),
            replayed_events = events.len(),
            "record repository recovered"
        );

        let mut recovered_records: Vec<FlowRecord> = records.values().cloned().collect();
        recovered_records.sort_by_key(|r| r.id);
        let recovered = RecoveredState {
            records: recovered_records,
            claims: claims.values().cloned().collect(),
            watermarks,
            events,
        };

        let repo = Self {
            wal_path,
            checkpoint_path,
            checkpoint_tmp_path,
            config,
            txn_ids,
            inner: Mutex::new(RepoInner {
                writer: BufWriter::new(file),
                offset: valid_len,
                records,
                claims,
                watermarks,
            }),
        };
        Ok((repo, recovered))
    }

    /// Claim the next transaction identifier.
    pub fn allocate_txn_id(&self) -> u64 {
        self.txn_ids.next()
    }

    /// Durably append one transaction. Once this returns, the transaction
    /// survives a crash.
    pub fn append_transaction(&self, txn: &RecordTransaction) -> RepoResult<u64> {
        let payload =
            bincode::serialize(txn).map_err(|e| RepoError::Serialization(e.to_string()))?;
        let crc = crc32fast::hash(&payload);

        let mut inner = self.inner.lock().expect("repository lock poisoned");
        let entry_offset = inner.offset;

        inner.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        inner.writer.write_all(&crc.to_le_bytes())?;
        inner.writer.write_all(&payload)?;
        inner.writer.flush()?;
        if self.config.sync_mode == SyncMode::EveryWrite {
            inner.writer.get_ref().sync_all()?;
        }
        inner.offset += (HEADER_SIZE + payload.len()) as u64;

        let inner = &mut *inner;
        apply_txn(&mut inner.records, &mut inner.claims, &mut inner.watermarks, txn);

        debug!(
            txn = txn.txn_id,
            offset = entry_offset,
            changes = txn.changes.len(),
            "transaction appended"
        );
        Ok(entry_offset)
    }

    /// Rewrite the repository to the current live-record state.
    ///
    /// The new checkpoint is written to a temp file, fsynced, and published
    /// by rename before the log is truncated; a crash at any point leaves
    /// either the old checkpoint with the full log or the new checkpoint.
    pub fn checkpoint(&self) -> RepoResult<()> {
        let mut inner = self.inner.lock().expect("repository lock poisoned");

        let mut records: Vec<FlowRecord> = inner.records.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        let snapshot = CheckpointSnapshot {
            watermarks: inner.watermarks,
            records,
            claims: inner.claims.values().cloned().collect(),
        };
        let bytes = snapshot.to_bytes()?;

        let mut tmp = File::create(&self.checkpoint_tmp_path)?;
        tmp.write_all(&bytes)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&self.checkpoint_tmp_path, &self.checkpoint_path)?;

        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.wal_path)?;
        inner.writer = BufWriter::new(file);
        inner.offset = 0;

        info!(records = snapshot.records.len(), "checkpoint published");
        Ok(())
    }

    /// Number of live records in the last-committed state.
    pub fn record_count(&self) -> usize {
        self.inner
            .lock()
            .expect("repository lock poisoned")
            .records
            .len()
    }

    /// Current identifier high-water marks.
    pub fn watermarks(&self) -> Watermarks {
        self.inner
            .lock()
            .expect("repository lock poisoned")
            .watermarks
    }

    /// Bytes currently in the transaction log.
    pub fn log_size(&self) -> u64 {
        self.inner.lock().expect("repository lock poisoned").offset
    }
}

/// Apply one transaction to the in-memory state maps.
fn apply_txn(
    records: &mut HashMap<RecordId, FlowRecord>,
    claims: &mut HashMap<ClaimId, (ContentClaim, i64)>,
    watermarks: &mut Watermarks,
    txn: &RecordTransaction,
) {
    watermarks.observe_txn(txn.txn_id);
    for change in &txn.changes {
        watermarks.observe_record(change.record_id().as_u64());
        match change {
            RecordChange::Create(r) | RecordChange::Update(r) => {
                records.insert(r.id, r.clone());
            }
            RecordChange::Drop(id) => {
                records.remove(id);
            }
        }
    }
    for delta in &txn.claim_deltas {
        watermarks.observe_claim(delta.claim.id.as_u64(), delta.claim.container.as_u64());
        let entry = claims.entry(delta.claim.id).or_insert((delta.claim, 0));
        entry.1 += delta.delta as i64;
        if entry.1 <= 0 {
            claims.remove(&delta.claim.id);
        }
    }
    for event in &txn.events {
        watermarks.observe_event(event.event_id);
    }
}

/// Replay valid frames front-to-back, invoking `apply` per transaction.
///
/// Returns the byte length of the valid prefix. Torn tails are tolerated;
/// corruption followed by valid entries is fatal.
fn replay_log(
    path: &Path,
    mut apply: impl FnMut(RecordTransaction),
) -> RepoResult<u64> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
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
        let frame_end = offset + HEADER_SIZE as u64 + length as u64;

        if length == 0 {
            if offset + HEADER_SIZE as u64 == file_len {
                warn!(offset, "zero-length trailing frame; discarding");
                break;
            }
            return Err(RepoError::CorruptLogEntry { offset });
        }
        if frame_end > file_len {
            warn!(offset, length, file_len, "transaction log ends mid-entry; discarding tail");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        file.read_exact(&mut payload)?;

        if crc32fast::hash(&payload) != expected_crc {
            if frame_end == file_len {
                warn!(offset, "CRC mismatch on trailing entry; discarding");
                break;
            }
            return Err(RepoError::CorruptLogEntry { offset });
        }

        match bincode::deserialize::<RecordTransaction>(&payload) {
            Ok(txn) => apply(txn),
            Err(e) => {
                if frame_end == file_len {
                    warn!(offset, error = %e, "undecodable trailing entry; discarding");
                    break;
                }
                return Err(RepoError::CorruptLogEntry { offset });
            }
        }

        offset = frame_end;
    }

    Ok(offset)
}
