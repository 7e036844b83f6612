use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tracing::{info, warn};

use weir_content::ContentStore;
use weir_provenance::{ProvenanceEvent, ProvenanceEventKind, ProvenanceLog};
use weir_queue::{ConnectionQueue, QueueConfig, QueueSize};
use weir_repo::{ClaimDelta, RecordChange, RecordRepository, RecordTransaction};
use weir_types::{ConnectionId, FlowRecord, RecordState, Sequence};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::session::Session;
use crate::stage::Stage;

/// The record lifecycle engine.
///
/// Owns the content store, record repository, provenance log, and the
/// connection queues, and hands out transactional [`Session`]s. Opening an
/// engine replays the repository: claims, queues, and identifier spaces are
/// rebuilt to the last committed state.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) content: ContentStore,
    pub(crate) repo: RecordRepository,
    pub(crate) provenance: ProvenanceLog,
    swap_dir: PathBuf,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionQueue>>>,
    connection_ids: Sequence,
    pub(crate) record_ids: Sequence,
    pub(crate) event_ids: Sequence,
    /// Commits hold the read side; checkpoint takes the write side so it
    /// sees a quiescent commit path.
    pub(crate) commit_gate: RwLock<()>,
    /// Serializes the durable-append + projection + publication tail of a
    /// commit. Event ids are allocated under this lock, in append order,
    /// which keeps the provenance projection's high-water dedup correct.
    pub(crate) publish_lock: Mutex<()>,
    active_sessions: Mutex<usize>,
    idle: Condvar,
    shutting_down: AtomicBool,
}

impl Engine {
    /// Open (or create) an engine rooted at `dir` and recover its state.
    ///
    /// Recovery replays the record repository, restores claim reference
    /// counts and seal flags in the content store, re-populates a queue for
    /// each connection referenced by a live record, seeds every identifier
    /// space past its high-water mark, and re-projects provenance events
    /// the event log is missing.
    pub fn open(dir: &Path, config: EngineConfig) -> EngineResult<Self> {
        let content = ContentStore::open(&dir.join("content"), config.content.clone())?;
        let (repo, recovered) =
            RecordRepository::open(&dir.join("repository"), config.repo)?;
        let provenance = ProvenanceLog::open(&dir.join("provenance").join("events.log"))?;

        for (claim, count) in &recovered.claims {
            if *count < 0 {
                warn!(claim = %claim.id, count, "negative replayed reference count; ignoring claim");
                continue;
            }
            content.restore_claim(*claim, *count as u32, true);
        }

        let w = recovered.watermarks;
        content.advance_ids(w.max_claim_id.unwrap_or(0), w.max_container_id.unwrap_or(0));
        let record_ids = Sequence::default();
        if let Some(hwm) = w.max_record_id {
            record_ids.advance_past(hwm);
        }
        let event_ids = Sequence::default();
        if let Some(hwm) = w.max_event_id {
            event_ids.advance_past(hwm);
        }

        let reprojected = provenance.append_batch(&recovered.events)?;
        if reprojected > 0 {
            info!(events = reprojected, "re-projected provenance events after crash");
        }

        // Re-populate one queue per connection referenced by a live record.
        let swap_dir = dir.join("swap");
        let connection_ids = Sequence::default();
        let mut by_connection: HashMap<ConnectionId, Vec<FlowRecord>> = HashMap::new();
        for record in recovered.records {
            match record.connection {
                Some(conn) => by_connection.entry(conn).or_default().push(record),
                None => {
                    warn!(record = %record.id, "recovered record without a connection; discarding")
                }
            }
        }
        let mut connections = HashMap::new();
        for (conn, records) in by_connection {
            connection_ids.advance_past(conn.as_u64());
            let queue = Arc::new(ConnectionQueue::new(
                conn,
                format!("conn-{}", conn.as_u64()),
                QueueConfig::default(),
                swap_dir.clone(),
            ));
            info!(connection = %conn, records = records.len(), "re-populated queue");
            queue.requeue(records)?;
            connections.insert(conn, queue);
        }

        Ok(Self {
            config,
            content,
            repo,
            provenance,
            swap_dir,
            connections: RwLock::new(connections),
            connection_ids,
            record_ids,
            event_ids,
            commit_gate: RwLock::new(()),
            publish_lock: Mutex::new(()),
            active_sessions: Mutex::new(0),
            idle: Condvar::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Wire a new connection between two stages.
    pub fn add_connection(&self, name: impl Into<String>, config: QueueConfig) -> ConnectionId {
        let id = ConnectionId::new(self.connection_ids.next());
        let queue = Arc::new(ConnectionQueue::new(id, name, config, self.swap_dir.clone()));
        self.connections
            .write()
            .expect("connections lock poisoned")
            .insert(id, queue);
        id
    }

    /// Look up a connection queue.
    pub fn connection(&self, id: ConnectionId) -> EngineResult<Arc<ConnectionQueue>> {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownConnection(id))
    }

    /// All wired connections, for the administrative surface.
    pub fn connections(&self) -> Vec<(ConnectionId, String)> {
        let mut out: Vec<(ConnectionId, String)> = self
            .connections
            .read()
            .expect("connections lock poisoned")
            .values()
            .map(|q| (q.id(), q.name().to_string()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Unwire a connection. Fails while records remain queued — drain them
    /// through a session or terminate them with
    /// [`drop_queued_records`](Self::drop_queued_records) first.
    pub fn remove_connection(&self, id: ConnectionId) -> EngineResult<()> {
        let mut connections = self.connections.write().expect("connections lock poisoned");
        let queue = connections
            .get(&id)
            .ok_or(EngineError::UnknownConnection(id))?;
        let size = queue.size();
        if size.count > 0 {
            return Err(EngineError::ConnectionNotEmpty {
                connection: id,
                count: size.count,
            });
        }
        connections.remove(&id);
        info!(connection = %id, "connection removed");
        Ok(())
    }

    /// Explicitly terminate every record queued on a connection.
    ///
    /// Runs as one durable transaction: drop changes, claim releases, and
    /// drop provenance events all commit together. Returns the number of
    /// records dropped.
    pub fn drop_queued_records(&self, id: ConnectionId) -> EngineResult<usize> {
        let queue = self.connection(id)?;
        let records = queue.drain()?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut changes = Vec::with_capacity(records.len());
        let mut deltas = Vec::new();
        let mut events = Vec::with_capacity(records.len());
        for record in &records {
            changes.push(RecordChange::Drop(record.id));
            if let Some(pointer) = record.content {
                deltas.push(ClaimDelta {
                    claim: pointer.claim,
                    delta: -1,
                });
            }
            let mut event = ProvenanceEvent::new(0, ProvenanceEventKind::Drop, record.id);
            event.source = Some(id);
            event.attributes = record.attributes.clone();
            event.details = Some("queue purged".into());
            events.push(event);
        }

        let _gate = self.commit_gate.read().expect("commit gate poisoned");
        let _publish = self.publish_lock.lock().expect("publish lock poisoned");
        for event in &mut events {
            event.event_id = self.event_ids.next();
        }
        let txn = RecordTransaction {
            txn_id: self.repo.allocate_txn_id(),
            changes,
            claim_deltas: deltas.clone(),
            events: events.clone(),
        };
        self.repo.append_transaction(&txn)?;
        for delta in &deltas {
            self.content.decrement_ref(delta.claim.id)?;
        }
        self.provenance.append_batch(&events)?;

        info!(connection = %id, dropped = records.len(), "queued records terminated");
        Ok(records.len())
    }

    /// Begin a transactional session.
    pub fn create_session(&self) -> EngineResult<Session<'_>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        *self.active_sessions.lock().expect("session count poisoned") += 1;
        Ok(Session::new(self))
    }

    /// Drive one stage invocation: commit on success, roll back on error.
    ///
    /// A failed commit (incomplete transaction, backpressure timeout,
    /// repository write failure) is rolled back explicitly — no error in
    /// the commit path is swallowed.
    pub fn run_stage(&self, stage: &dyn Stage) -> EngineResult<()> {
        let mut session = self.create_session()?;
        match stage.on_trigger(&mut session) {
            Ok(()) => {
                if let Err(e) = session.commit() {
                    warn!(stage = stage.name(), error = %e, "commit failed; rolling back");
                    session.rollback();
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => {
                warn!(stage = stage.name(), error = %e, "stage failed; rolling back");
                session.rollback();
                Err(e)
            }
        }
    }

    /// Checkpoint the record repository from a quiescent commit path.
    pub fn checkpoint(&self) -> EngineResult<()> {
        let _gate = self.commit_gate.write().expect("commit gate poisoned");
        self.repo.checkpoint()?;
        Ok(())
    }

    /// Stop accepting sessions, wait for in-flight sessions to commit or
    /// roll back, then checkpoint.
    pub fn shutdown(&self) -> EngineResult<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut active = self.active_sessions.lock().expect("session count poisoned");
        while *active > 0 {
            active = self.idle.wait(active).expect("session count poisoned");
        }
        drop(active);
        self.checkpoint()?;
        info!("engine shut down");
        Ok(())
    }

    // ---- read-only administrative surface ----

    /// Occupancy of one connection queue.
    pub fn queue_depth(&self, id: ConnectionId) -> EngineResult<QueueSize> {
        Ok(self.connection(id)?.size())
    }

    /// Number of live records across all queues (last-committed state).
    pub fn total_records(&self) -> usize {
        self.repo.record_count()
    }

    /// The provenance query surface.
    pub fn provenance(&self) -> &ProvenanceLog {
        &self.provenance
    }

    pub(crate) fn session_finished(&self) {
        let mut active = self.active_sessions.lock().expect("session count poisoned");
        *active -= 1;
        if *active == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn stamp_queued(record: &mut FlowRecord, connection: ConnectionId) {
        record.state = RecordState::Queued;
        record.connection = Some(connection);
        record.enqueued_at_ms = weir_types::now_ms();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;

    use weir_provenance::ProvenanceEventKind;
    use weir_repo::{RepoConfig, SyncMode};

    use super::*;
    use crate::error::EngineError;
    use crate::session::Session;
    use crate::stage::Stage;

    fn engine(dir: &Path) -> Engine {
        Engine::open(
            dir,
            crate::config::EngineConfig {
                repo: RepoConfig {
                    sync_mode: SyncMode::OsDefault,
                },
                backpressure_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn seed(engine: &Engine, conn: ConnectionId, content: &[u8]) {
        let mut session = engine.create_session().unwrap();
        let record = session.create().unwrap();
        if !content.is_empty() {
            session.write(record.id, |w| w.write_all(content)).unwrap();
        }
        session.transfer(record.id, conn).unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn connections_are_listed_and_looked_up() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let a = engine.add_connection("ingest", QueueConfig::default());
        let b = engine.add_connection("egress", QueueConfig::default());

        assert_eq!(
            engine.connections(),
            vec![(a, "ingest".to_string()), (b, "egress".to_string())]
        );
        assert_eq!(engine.connection(a).unwrap().name(), "ingest");
        assert!(matches!(
            engine.connection(ConnectionId::new(99)),
            Err(EngineError::UnknownConnection(_))
        ));
    }

    #[test]
    fn remove_connection_requires_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let conn = engine.add_connection("out", QueueConfig::default());
        seed(&engine, conn, &[]);

        let err = engine.remove_connection(conn).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ConnectionNotEmpty { count: 1, .. }
        ));

        engine.drop_queued_records(conn).unwrap();
        engine.remove_connection(conn).unwrap();
        assert!(engine.connections().is_empty());
    }

    #[test]
    fn purge_drops_records_durably() {
        let dir = tempfile::tempdir().unwrap();
        let conn = {
            let engine = engine(dir.path());
            let conn = engine.add_connection("out", QueueConfig::default());
            seed(&engine, conn, b"bytes");
            seed(&engine, conn, b"more bytes");
            assert_eq!(engine.drop_queued_records(conn).unwrap(), 2);
            assert_eq!(engine.total_records(), 0);
            assert_eq!(engine.content.live_claim_count(), 0);
            conn
        };

        let engine = engine(dir.path());
        assert_eq!(engine.total_records(), 0);
        assert!(engine.connection(conn).is_err());

        let drops = engine
            .provenance()
            .scan()
            .unwrap()
            .iter()
            .filter(|e| e.kind == ProvenanceEventKind::Drop)
            .count();
        assert_eq!(drops, 2);
    }

    struct Producer(ConnectionId);

    impl Stage for Producer {
        fn name(&self) -> &str {
            "producer"
        }

        fn on_trigger(&self, session: &mut Session<'_>) -> crate::error::EngineResult<()> {
            let record = session.create()?;
            session.write(record.id, |w| w.write_all(b"produced"))?;
            session.transfer(record.id, self.0)?;
            Ok(())
        }
    }

    struct Faulty(ConnectionId);

    impl Stage for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn on_trigger(&self, session: &mut Session<'_>) -> crate::error::EngineResult<()> {
            let pulled = session.pull(self.0, 10)?;
            Err(EngineError::RecordNotInSession {
                record: pulled[0].id,
            })
        }
    }

    #[test]
    fn run_stage_commits_on_success_and_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let conn = engine.add_connection("out", QueueConfig::default());

        engine.run_stage(&Producer(conn)).unwrap();
        assert_eq!(engine.queue_depth(conn).unwrap().count, 1);

        let err = engine.run_stage(&Faulty(conn)).unwrap_err();
        assert!(matches!(err, EngineError::RecordNotInSession { .. }));
        // The pulled record went back to its queue.
        assert_eq!(engine.queue_depth(conn).unwrap().count, 1);
    }

    #[test]
    fn shutdown_blocks_new_sessions_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = engine(dir.path());
            let conn = engine.add_connection("out", QueueConfig::default());
            seed(&engine, conn, &[]);
            engine.shutdown().unwrap();
            assert!(matches!(
                engine.create_session(),
                Err(EngineError::ShuttingDown)
            ));
            assert_eq!(engine.repo.log_size(), 0);
        }

        let engine = engine(dir.path());
        assert_eq!(engine.total_records(), 1);
    }

    #[test]
    fn shutdown_waits_for_inflight_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let engine = std::sync::Arc::new(engine(dir.path()));
        let conn = engine.add_connection("out", QueueConfig::default());

        let worker = {
            let engine = std::sync::Arc::clone(&engine);
            std::thread::spawn(move || {
                let mut session = engine.create_session().unwrap();
                let record = session.create().unwrap();
                session.transfer(record.id, conn).unwrap();
                std::thread::sleep(Duration::from_millis(50));
                session.commit().unwrap();
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        engine.shutdown().unwrap();
        worker.join().unwrap();

        // The in-flight session committed before the engine closed.
        assert_eq!(engine.total_records(), 1);
    }
}
