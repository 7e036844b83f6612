use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use tracing::{debug, info, warn};

use weir_types::{ClaimId, ContainerId, ContentClaim, Sequence};

use crate::container::{container_path, index_path, scan_container_ids, ContentConfig};
use crate::error::{ContentError, ContentResult};
use crate::index::{ContainerIndex, IndexEntry};

/// In-memory state of one registered claim.
struct ClaimState {
    claim: ContentClaim,
    ref_count: u32,
    sealed: bool,
}

/// Per-container bookkeeping used for reclamation.
#[derive(Default)]
struct ContainerState {
    /// Claims in this container with a non-zero reference count.
    live_claims: usize,
    /// Sessions holding rollback references into this container.
    pins: usize,
}

struct StoreState {
    active_id: ContainerId,
    active_file: File,
    active_offset: u64,
    claims: HashMap<ClaimId, ClaimState>,
    containers: HashMap<ContainerId, ContainerState>,
}

/// Append-only, reference-counted content store.
///
/// All metadata lives behind one mutex; reads open their own file handle so
/// concurrent readers only contend for the metadata lookup.
pub struct ContentStore {
    dir: PathBuf,
    config: ContentConfig,
    claim_ids: Sequence,
    container_ids: Sequence,
    state: Mutex<StoreState>,
}

impl ContentStore {
    /// Open (or create) a content store rooted at `dir`.
    ///
    /// Existing container files are kept; their claims are re-registered by
    /// recovery via [`restore_claim`](Self::restore_claim). Sidecar indexes
    /// are verified here and only warned about — the record repository is
    /// the authority for live claims.
    pub fn open(dir: &Path, config: ContentConfig) -> ContentResult<Self> {
        fs::create_dir_all(dir)?;

        let container_ids = Sequence::default();
        let existing = scan_container_ids(dir)?;
        for id in &existing {
            container_ids.advance_past(id.as_u64());
            let idx_path = index_path(dir, *id);
            if idx_path.exists() {
                match fs::read(&idx_path).map_err(ContentError::from).and_then(|b| {
                    ContainerIndex::from_bytes(&b)
                }) {
                    Ok(idx) => debug!(container = %id, entries = idx.entry_count(), "verified container index"),
                    Err(e) => warn!(container = %id, error = %e, "container index failed verification"),
                }
            }
        }

        let active_id = ContainerId::new(container_ids.next());
        let active_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(container_path(dir, active_id))?;

        let mut containers = HashMap::new();
        containers.insert(active_id, ContainerState::default());

        info!(dir = %dir.display(), containers = existing.len(), active = %active_id, "content store opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            claim_ids: Sequence::default(),
            container_ids,
            state: Mutex::new(StoreState {
                active_id,
                active_file,
                active_offset: 0,
                claims: HashMap::new(),
                containers,
            }),
        })
    }

    /// Begin writing a new claim. Bytes are buffered until
    /// [`ClaimWriter::finish`] appends them to the active container in one
    /// step.
    pub fn create_writer(&self) -> ClaimWriter<'_> {
        ClaimWriter {
            store: self,
            buf: Vec::new(),
        }
    }

    /// Read `length` bytes at `offset` within the claim.
    ///
    /// A missing container file or a short read surfaces as
    /// [`ContentError::Unavailable`].
    pub fn read(&self, claim: &ContentClaim, offset: u64, length: u64) -> ContentResult<Bytes> {
        let (container, base_offset) = {
            let state = self.state.lock().expect("content store lock poisoned");
            let known = state
                .claims
                .get(&claim.id)
                .ok_or(ContentError::UnknownClaim(claim.id))?;
            let end = offset.checked_add(length);
            if end.is_none() || end.unwrap() > known.claim.length {
                return Err(ContentError::ReadOutOfBounds {
                    claim: claim.id,
                    offset,
                    length,
                    claim_length: known.claim.length,
                });
            }
            (known.claim.container, known.claim.offset)
        };

        let path = container_path(&self.dir, container);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ContentError::Unavailable {
                    claim: claim.id,
                    reason: format!("container file missing: {}", path.display()),
                });
            }
            Err(e) => return Err(e.into()),
        };

        file.seek(SeekFrom::Start(base_offset + offset))?;
        let mut buf = vec![0u8; length as usize];
        match file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ContentError::Unavailable {
                    claim: claim.id,
                    reason: "container shorter than claim range".into(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Bytes::from(buf))
    }

    /// Seal claims at session commit, then flush the active container once.
    ///
    /// After sealing, a claim is immutable and readable by any session.
    pub fn seal_all(&self, ids: &[ClaimId]) -> ContentResult<()> {
        let state = &mut *self.state.lock().expect("content store lock poisoned");
        for id in ids {
            let claim = state
                .claims
                .get_mut(id)
                .ok_or(ContentError::UnknownClaim(*id))?;
            claim.sealed = true;
        }
        if !ids.is_empty() {
            state.active_file.sync_data()?;
        }
        Ok(())
    }

    /// Increment a claim's reference count. Returns the new count.
    pub fn increment_ref(&self, id: ClaimId) -> ContentResult<u32> {
        let mut state = self.state.lock().expect("content store lock poisoned");
        let claim = state
            .claims
            .get_mut(&id)
            .ok_or(ContentError::UnknownClaim(id))?;
        claim.ref_count += 1;
        Ok(claim.ref_count)
    }

    /// Decrement a claim's reference count. Returns the new count.
    ///
    /// At zero the claim is released; the containing file is deleted once
    /// every claim in it is released and no session pins the container.
    pub fn decrement_ref(&self, id: ClaimId) -> ContentResult<u32> {
        let mut state = self.state.lock().expect("content store lock poisoned");
        let claim = state
            .claims
            .get_mut(&id)
            .ok_or(ContentError::UnknownClaim(id))?;
        if claim.ref_count == 0 {
            return Err(ContentError::RefUnderflow(id));
        }
        claim.ref_count -= 1;
        let remaining = claim.ref_count;
        if remaining == 0 {
            let container = claim.claim.container;
            state.claims.remove(&id);
            if let Some(c) = state.containers.get_mut(&container) {
                c.live_claims = c.live_claims.saturating_sub(1);
            }
            debug!(claim = %id, container = %container, "claim released");
            self.maybe_reclaim(&mut state, container)?;
        }
        Ok(remaining)
    }

    /// Pin a container against reclamation while a session holds rollback
    /// references into it.
    pub fn pin_container(&self, id: ContainerId) {
        let mut state = self.state.lock().expect("content store lock poisoned");
        state.containers.entry(id).or_default().pins += 1;
    }

    /// Release a pin taken by [`pin_container`](Self::pin_container).
    pub fn unpin_container(&self, id: ContainerId) -> ContentResult<()> {
        let mut state = self.state.lock().expect("content store lock poisoned");
        if let Some(c) = state.containers.get_mut(&id) {
            c.pins = c.pins.saturating_sub(1);
        }
        self.maybe_reclaim(&mut state, id)
    }

    /// Re-register a claim during recovery with its replayed reference
    /// count and seal flag.
    pub fn restore_claim(&self, claim: ContentClaim, ref_count: u32, sealed: bool) {
        self.claim_ids.advance_past(claim.id.as_u64());
        self.container_ids.advance_past(claim.container.as_u64());
        if ref_count == 0 {
            return;
        }
        let mut state = self.state.lock().expect("content store lock poisoned");
        state.containers.entry(claim.container).or_default().live_claims += 1;
        state.claims.insert(
            claim.id,
            ClaimState {
                claim,
                ref_count,
                sealed,
            },
        );
    }

    /// Advance the claim and container id spaces past recovered high-water
    /// marks, covering claims that were fully released before the crash.
    pub fn advance_ids(&self, claim_hwm: u64, container_hwm: u64) {
        self.claim_ids.advance_past(claim_hwm);
        self.container_ids.advance_past(container_hwm);
    }

    /// Current reference count of a claim, if it is registered.
    pub fn claim_ref_count(&self, id: ClaimId) -> Option<u32> {
        let state = self.state.lock().expect("content store lock poisoned");
        state.claims.get(&id).map(|c| c.ref_count)
    }

    /// True once a claim has been sealed.
    pub fn is_sealed(&self, id: ClaimId) -> bool {
        let state = self.state.lock().expect("content store lock poisoned");
        state.claims.get(&id).map(|c| c.sealed).unwrap_or(false)
    }

    /// Number of containers currently tracked (including the active one).
    pub fn container_count(&self) -> usize {
        let state = self.state.lock().expect("content store lock poisoned");
        state.containers.len()
    }

    /// Number of claims with a non-zero reference count.
    pub fn live_claim_count(&self) -> usize {
        let state = self.state.lock().expect("content store lock poisoned");
        state.claims.len()
    }

    /// Delete a container's files once it is inactive, empty, and unpinned.
    fn maybe_reclaim(&self, state: &mut StoreState, id: ContainerId) -> ContentResult<()> {
        if id == state.active_id {
            return Ok(());
        }
        let Some(c) = state.containers.get(&id) else {
            return Ok(());
        };
        if c.live_claims > 0 || c.pins > 0 {
            return Ok(());
        }
        state.containers.remove(&id);
        for path in [container_path(&self.dir, id), index_path(&self.dir, id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(container = %id, "container reclaimed");
        Ok(())
    }

    /// Rotate to a fresh active container, writing the sidecar index of the
    /// old one.
    fn rotate(&self, state: &mut StoreState) -> ContentResult<()> {
        let old_id = state.active_id;
        state.active_file.sync_data()?;

        let entries: Vec<IndexEntry> = state
            .claims
            .values()
            .filter(|c| c.claim.container == old_id)
            .map(|c| IndexEntry {
                claim: c.claim.id,
                offset: c.claim.offset,
                length: c.claim.length,
                sealed: c.sealed,
            })
            .collect();
        let index = ContainerIndex::new(entries);
        fs::write(index_path(&self.dir, old_id), index.to_bytes())?;

        let new_id = ContainerId::new(self.container_ids.next());
        let new_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(container_path(&self.dir, new_id))?;

        state.active_id = new_id;
        state.active_file = new_file;
        state.active_offset = 0;
        state.containers.entry(new_id).or_default();

        info!(old = %old_id, new = %new_id, "container rotated");
        // The old container may already be fully released.
        self.maybe_reclaim(state, old_id)
    }

    /// Append a finished writer's bytes and register the claim.
    fn append_claim(&self, buf: &[u8]) -> ContentResult<ContentClaim> {
        let mut state = self.state.lock().expect("content store lock poisoned");

        if state.active_offset > 0
            && state.active_offset + buf.len() as u64 > self.config.max_container_size
        {
            self.rotate(&mut state)?;
        }

        let offset = state.active_offset;
        state.active_file.write_all(buf)?;
        state.active_offset += buf.len() as u64;

        let claim = ContentClaim {
            id: ClaimId::new(self.claim_ids.next()),
            container: state.active_id,
            offset,
            length: buf.len() as u64,
        };
        state.claims.insert(
            claim.id,
            ClaimState {
                claim,
                ref_count: 1,
                sealed: false,
            },
        );
        state.containers.entry(claim.container).or_default().live_claims += 1;

        debug!(claim = %claim.id, container = %claim.container, offset, len = buf.len(), "claim written");
        Ok(claim)
    }
}

/// Write handle for a new claim.
///
/// Bytes are buffered in memory; dropping the writer without calling
/// [`finish`](Self::finish) discards them, so a failed write leaves no
/// trace in the store.
pub struct ClaimWriter<'a> {
    store: &'a ContentStore,
    buf: Vec<u8>,
}

impl ClaimWriter<'_> {
    /// Bytes buffered so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append the buffered bytes to the active container and register the
    /// claim. The claim starts unsealed with reference count 1.
    pub fn finish(self) -> ContentResult<ContentClaim> {
        self.store.append_claim(&self.buf)
    }
}

impl Write for ClaimWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store(dir: &Path) -> ContentStore {
        ContentStore::open(
            dir,
            ContentConfig {
                max_container_size: 64,
            },
        )
        .unwrap()
    }

    fn write_claim(store: &ContentStore, data: &[u8]) -> ContentClaim {
        let mut w = store.create_writer();
        w.write_all(data).unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn write_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), ContentConfig::default()).unwrap();

        let claim = write_claim(&store, b"hello content store");
        assert_eq!(claim.length, 19);

        let bytes = store.read(&claim, 0, claim.length).unwrap();
        assert_eq!(&bytes[..], b"hello content store");

        let window = store.read(&claim, 6, 7).unwrap();
        assert_eq!(&window[..], b"content");
    }

    #[test]
    fn read_out_of_bounds_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), ContentConfig::default()).unwrap();
        let claim = write_claim(&store, b"12345");

        let err = store.read(&claim, 3, 3).unwrap_err();
        assert!(matches!(err, ContentError::ReadOutOfBounds { .. }));
    }

    #[test]
    fn unknown_claim_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), ContentConfig::default()).unwrap();
        let ghost = ContentClaim {
            id: ClaimId::new(99),
            container: ContainerId::new(0),
            offset: 0,
            length: 4,
        };
        let err = store.read(&ghost, 0, 4).unwrap_err();
        assert!(matches!(err, ContentError::UnknownClaim(_)));
    }

    #[test]
    fn refcount_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), ContentConfig::default()).unwrap();
        let claim = write_claim(&store, b"shared");

        assert_eq!(store.claim_ref_count(claim.id), Some(1));
        assert_eq!(store.increment_ref(claim.id).unwrap(), 2);
        assert_eq!(store.decrement_ref(claim.id).unwrap(), 1);
        assert_eq!(store.decrement_ref(claim.id).unwrap(), 0);
        assert_eq!(store.claim_ref_count(claim.id), None);

        let err = store.decrement_ref(claim.id).unwrap_err();
        assert!(matches!(err, ContentError::UnknownClaim(_)));
    }

    #[test]
    fn multiple_claims_share_a_container() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), ContentConfig::default()).unwrap();

        let a = write_claim(&store, b"first");
        let b = write_claim(&store, b"second");
        assert_eq!(a.container, b.container);
        assert_eq!(b.offset, a.length);

        assert_eq!(&store.read(&a, 0, 5).unwrap()[..], b"first");
        assert_eq!(&store.read(&b, 0, 6).unwrap()[..], b"second");
    }

    #[test]
    fn container_rotates_at_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());

        let a = write_claim(&store, &[1u8; 40]);
        let b = write_claim(&store, &[2u8; 40]);
        assert_ne!(a.container, b.container);

        // Rotation writes a sidecar index for the old container.
        let idx_bytes = fs::read(index_path(dir.path(), a.container)).unwrap();
        let idx = ContainerIndex::from_bytes(&idx_bytes).unwrap();
        assert_eq!(idx.entry_count(), 1);
        assert_eq!(idx.entries[0].claim, a.id);
    }

    #[test]
    fn released_container_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());

        let a = write_claim(&store, &[1u8; 40]);
        let _b = write_claim(&store, &[2u8; 40]); // forces rotation
        let old_path = container_path(dir.path(), a.container);
        assert!(old_path.exists());

        store.decrement_ref(a.id).unwrap();
        assert!(!old_path.exists());
    }

    #[test]
    fn pinned_container_survives_release() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());

        let a = write_claim(&store, &[1u8; 40]);
        store.pin_container(a.container);
        let _b = write_claim(&store, &[2u8; 40]); // forces rotation

        store.decrement_ref(a.id).unwrap();
        let old_path = container_path(dir.path(), a.container);
        assert!(old_path.exists(), "pin must block reclamation");

        store.unpin_container(a.container).unwrap();
        assert!(!old_path.exists());
    }

    #[test]
    fn seal_marks_claims_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), ContentConfig::default()).unwrap();
        let claim = write_claim(&store, b"seal me");

        assert!(!store.is_sealed(claim.id));
        store.seal_all(&[claim.id]).unwrap();
        assert!(store.is_sealed(claim.id));
    }

    #[test]
    fn restore_claim_rebuilds_state() {
        let dir = tempfile::tempdir().unwrap();
        let claim = {
            let store = ContentStore::open(dir.path(), ContentConfig::default()).unwrap();
            let claim = write_claim(&store, b"durable bytes");
            store.seal_all(&[claim.id]).unwrap();
            claim
        };

        let store = ContentStore::open(dir.path(), ContentConfig::default()).unwrap();
        assert_eq!(store.claim_ref_count(claim.id), None);

        store.restore_claim(claim, 2, true);
        assert_eq!(store.claim_ref_count(claim.id), Some(2));
        assert!(store.is_sealed(claim.id));
        assert_eq!(&store.read(&claim, 0, claim.length).unwrap()[..], b"durable bytes");
    }

    #[test]
    fn abandoned_writer_leaves_no_claim() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path(), ContentConfig::default()).unwrap();
        {
            let mut w = store.create_writer();
            w.write_all(b"never finished").unwrap();
        }
        assert_eq!(store.live_claim_count(), 0);
    }
}
