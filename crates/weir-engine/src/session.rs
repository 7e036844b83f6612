use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use tracing::{debug, warn};

use weir_content::ContentError;
use weir_provenance::{ProvenanceEvent, ProvenanceEventKind};
use weir_repo::{ClaimDelta, RecordChange, RecordTransaction};
use weir_types::{
    Attributes, ClaimId, ConnectionId, ContainerId, ContentClaim, ContentPointer, FlowRecord,
    RecordId, RecordState,
};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Open,
    Committed,
    RolledBack,
}

struct PulledRecord {
    original: FlowRecord,
    source: ConnectionId,
}

/// A single stage invocation's transaction scope.
///
/// All operations stage changes in memory. [`commit`](Self::commit) makes
/// them durable and visible atomically; [`rollback`](Self::rollback) — or
/// dropping the session — restores every pulled record to its source queue
/// and discards created claims.
pub struct Session<'a> {
    engine: &'a Engine,
    state: SessionState,
    finished: bool,
    /// Current in-session version of every held record.
    working: HashMap<RecordId, FlowRecord>,
    pulled: HashMap<RecordId, PulledRecord>,
    created: HashSet<RecordId>,
    transfers: HashMap<RecordId, ConnectionId>,
    drops: HashSet<RecordId>,
    /// Records filtered out by age at pull, pending a durable drop.
    expired: Vec<(FlowRecord, ConnectionId)>,
    /// Claims written by this session, unsealed until commit.
    new_claims: HashMap<ClaimId, ContentClaim>,
    events: Vec<ProvenanceEvent>,
    pinned: Vec<ContainerId>,
}

impl<'a> Session<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self {
            engine,
            state: SessionState::Open,
            finished: false,
            working: HashMap::new(),
            pulled: HashMap::new(),
            created: HashSet::new(),
            transfers: HashMap::new(),
            drops: HashSet::new(),
            expired: Vec::new(),
            new_claims: HashMap::new(),
            events: Vec::new(),
            pinned: Vec::new(),
        }
    }

    /// Pull up to `n` records from a connection queue.
    ///
    /// Records past the queue's maximum age are filtered out here and
    /// staged as expiration drops; they never reach the stage.
    pub fn pull(&mut self, connection: ConnectionId, n: usize) -> EngineResult<Vec<FlowRecord>> {
        self.ensure_open()?;
        let queue = self.engine.connection(connection)?;
        let (polled, expired) = queue.poll(n)?;

        for record in expired {
            self.pin_content(&record);
            let mut event = self.new_event(ProvenanceEventKind::Expire, record.id);
            event.source = Some(connection);
            event.attributes = record.attributes.clone();
            event.details = Some("queue maximum age exceeded".into());
            self.events.push(event);
            self.expired.push((record, connection));
        }

        let mut out = Vec::with_capacity(polled.len());
        for record in polled {
            self.pin_content(&record);
            self.pulled.insert(
                record.id,
                PulledRecord {
                    original: record.clone(),
                    source: connection,
                },
            );
            let mut working = record;
            working.state = RecordState::InSession;
            out.push(working.clone());
            self.working.insert(working.id, working);
        }
        debug!(connection = %connection, pulled = out.len(), "records pulled");
        Ok(out)
    }

    /// Create a new record with no content and no attributes.
    pub fn create(&mut self) -> EngineResult<FlowRecord> {
        self.ensure_open()?;
        let record = FlowRecord::new(RecordId::new(self.engine.record_ids.next()));
        let event = self.new_event(ProvenanceEventKind::Create, record.id);
        self.events.push(event);
        self.created.insert(record.id);
        self.working.insert(record.id, record.clone());
        Ok(record)
    }

    /// Clone a record this session holds; content (if any) is shared via
    /// the same claim.
    pub fn clone_record(&mut self, id: RecordId) -> EngineResult<FlowRecord> {
        self.ensure_open()?;
        let source = self
            .working
            .get(&id)
            .ok_or(EngineError::RecordNotInSession { record: id })?;

        let mut clone = FlowRecord::new(RecordId::new(self.engine.record_ids.next()));
        clone.attributes = source.attributes.clone();
        clone.content = source.content;
        self.pin_content(&clone);

        let mut event = self.new_event(ProvenanceEventKind::Clone, clone.id);
        event.related.push(id);
        event.attributes = clone.attributes.clone();
        self.events.push(event);

        self.created.insert(clone.id);
        self.working.insert(clone.id, clone.clone());
        Ok(clone)
    }

    /// Replace a record's content with bytes streamed through `f`.
    pub fn write(
        &mut self,
        id: RecordId,
        f: impl FnOnce(&mut dyn Write) -> std::io::Result<()>,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        if !self.working.contains_key(&id) {
            return Err(EngineError::RecordNotInSession { record: id });
        }

        let mut writer = self.engine.content.create_writer();
        f(&mut writer).map_err(ContentError::from)?;
        let claim = writer.finish()?;
        self.new_claims.insert(claim.id, claim);

        let record = self.working.get_mut(&id).expect("checked above");
        record.content = Some(ContentPointer::whole(claim));
        let attributes = record.attributes.clone();

        let mut event = self.new_event(ProvenanceEventKind::ContentModified, id);
        event.attributes = attributes;
        self.events.push(event);
        Ok(())
    }

    /// Read a record's content through `f`. A record with no claim reads as
    /// an empty stream.
    ///
    /// A content-unavailable error here means the underlying bytes are
    /// missing or corrupt; the session must be rolled back.
    pub fn read(
        &self,
        id: RecordId,
        f: impl FnOnce(&mut dyn Read) -> std::io::Result<()>,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        let record = self
            .working
            .get(&id)
            .ok_or(EngineError::RecordNotInSession { record: id })?;

        match record.content {
            Some(pointer) => {
                let bytes = self.engine.content.read(
                    &pointer.claim,
                    pointer.window.offset,
                    pointer.window.length,
                )?;
                let mut reader: &[u8] = &bytes;
                f(&mut reader).map_err(ContentError::from)?;
            }
            None => {
                let mut empty = std::io::empty();
                f(&mut empty).map_err(ContentError::from)?;
            }
        }
        Ok(())
    }

    /// Merge attributes into a record.
    pub fn put_attributes(&mut self, id: RecordId, attributes: Attributes) -> EngineResult<()> {
        self.ensure_open()?;
        let record = self
            .working
            .get_mut(&id)
            .ok_or(EngineError::RecordNotInSession { record: id })?;
        record.attributes.extend(attributes);
        let snapshot = record.attributes.clone();

        let mut event = self.new_event(ProvenanceEventKind::AttributesModified, id);
        event.attributes = snapshot;
        self.events.push(event);
        Ok(())
    }

    /// Remove one attribute from a record.
    pub fn remove_attribute(&mut self, id: RecordId, key: &str) -> EngineResult<()> {
        self.ensure_open()?;
        let record = self
            .working
            .get_mut(&id)
            .ok_or(EngineError::RecordNotInSession { record: id })?;
        record.attributes.remove(key);
        let snapshot = record.attributes.clone();

        let mut event = self.new_event(ProvenanceEventKind::AttributesModified, id);
        event.attributes = snapshot;
        self.events.push(event);
        Ok(())
    }

    /// Stage a record for placement on a connection at commit. A later
    /// transfer of the same record replaces the destination.
    pub fn transfer(&mut self, id: RecordId, connection: ConnectionId) -> EngineResult<()> {
        self.ensure_open()?;
        self.engine.connection(connection)?;
        if !self.working.contains_key(&id) {
            return Err(EngineError::RecordNotInSession { record: id });
        }
        self.transfers.insert(id, connection);
        Ok(())
    }

    /// Terminally drop a record. Its claim reference is released at commit.
    pub fn drop_record(&mut self, id: RecordId) -> EngineResult<()> {
        self.ensure_open()?;
        let record = self
            .working
            .remove(&id)
            .ok_or(EngineError::RecordNotInSession { record: id })?;
        self.transfers.remove(&id);
        self.drops.insert(id);

        let mut event = self.new_event(ProvenanceEventKind::Drop, id);
        event.attributes = record.attributes;
        self.events.push(event);
        Ok(())
    }

    /// The session's current version of a record, if it holds one.
    pub fn record(&self, id: RecordId) -> Option<&FlowRecord> {
        self.working.get(&id)
    }

    /// Commit all staged work atomically.
    ///
    /// Order: validate dispositions, wait out destination backpressure,
    /// seal new claims, durably append one repository transaction, apply
    /// claim deltas, append provenance, publish outbound records. Any
    /// failure before the durable append rolls the session back (the
    /// returned error says why). After the durable append the commit is
    /// final: post-durability failures are logged and healed by replay on
    /// the next startup, never silently swallowed.
    pub fn commit(&mut self) -> EngineResult<()> {
        self.ensure_open()?;

        // 1. Every held record needs a terminal disposition. Rejected
        //    before any durable write.
        let mut undisposed: Vec<RecordId> = self
            .working
            .keys()
            .filter(|id| !self.transfers.contains_key(id))
            .copied()
            .collect();
        if !undisposed.is_empty() {
            undisposed.sort();
            return Err(EngineError::IncompleteTransaction {
                records: undisposed,
            });
        }

        // 2. Backpressure check against every destination, before anything
        //    becomes durable.
        let mut destinations = HashMap::new();
        for connection in self.transfers.values() {
            if !destinations.contains_key(connection) {
                destinations.insert(*connection, self.engine.connection(*connection)?);
            }
        }
        for queue in destinations.values() {
            queue.wait_until_open(self.engine.config.backpressure_timeout)?;
        }

        // Final outbound versions, stamped for their destination queues.
        let mut outbound = Vec::with_capacity(self.transfers.len());
        for (&id, &destination) in &self.transfers {
            let mut record = self.working.get(&id).expect("validated above").clone();
            Engine::stamp_queued(&mut record, destination);

            let mut event = self.new_event(ProvenanceEventKind::Route, id);
            event.source = self.pulled.get(&id).map(|p| p.source);
            event.destination = Some(destination);
            event.attributes = record.attributes.clone();
            self.events.push(event);

            outbound.push((record, destination));
        }

        // 3. Seal the new claims outbound records actually reference;
        //    orphaned ones (overwritten or dropped) are released below.
        let sealed: Vec<ClaimId> = outbound
            .iter()
            .filter_map(|(r, _)| r.content.map(|p| p.claim.id))
            .filter(|id| self.new_claims.contains_key(id))
            .collect();
        self.engine.content.seal_all(&sealed)?;

        // 4. Build the transaction: changes, net claim deltas, events.
        let mut changes = Vec::new();
        for (record, _) in &outbound {
            if self.created.contains(&record.id) {
                changes.push(RecordChange::Create(record.clone()));
            } else {
                changes.push(RecordChange::Update(record.clone()));
            }
        }
        for id in &self.drops {
            if self.pulled.contains_key(id) {
                changes.push(RecordChange::Drop(*id));
            }
        }
        for (record, _) in &self.expired {
            changes.push(RecordChange::Drop(record.id));
        }

        // Net reference-count change per claim: committed references after
        // the session minus consumed references before it.
        let mut net: HashMap<ClaimId, (ContentClaim, i32)> = HashMap::new();
        for (record, _) in &outbound {
            if let Some(pointer) = record.content {
                net.entry(pointer.claim.id).or_insert((pointer.claim, 0)).1 += 1;
            }
        }
        for p in self.pulled.values() {
            if let Some(pointer) = p.original.content {
                net.entry(pointer.claim.id).or_insert((pointer.claim, 0)).1 -= 1;
            }
        }
        for (record, _) in &self.expired {
            if let Some(pointer) = record.content {
                net.entry(pointer.claim.id).or_insert((pointer.claim, 0)).1 -= 1;
            }
        }
        let claim_deltas: Vec<ClaimDelta> = net
            .values()
            .filter(|(_, delta)| *delta != 0)
            .map(|&(claim, delta)| ClaimDelta { claim, delta })
            .collect();

        let mut txn = RecordTransaction {
            txn_id: 0,
            changes,
            claim_deltas,
            events: std::mem::take(&mut self.events),
        };

        if txn.changes.is_empty() && txn.claim_deltas.is_empty() && txn.events.is_empty() {
            // Nothing to make durable.
            for container in self.pinned.drain(..) {
                if let Err(e) = self.engine.content.unpin_container(container) {
                    warn!(container = %container, error = %e, "unpin failed");
                }
            }
            self.finish(SessionState::Committed);
            return Ok(());
        }

        // 5. The durability boundary. Transaction and event ids are
        //    assigned under the publish lock, so both are monotone in
        //    durable-append order — the property the provenance
        //    projection's idempotent rebuild depends on. Failure here rolls
        //    the session back (via Drop) and the error surfaces to the
        //    stage.
        let gate = self.engine.commit_gate.read().expect("commit gate poisoned");
        let publish = self
            .engine
            .publish_lock
            .lock()
            .expect("publish lock poisoned");
        txn.txn_id = self.engine.repo.allocate_txn_id();
        for event in &mut txn.events {
            event.event_id = self.engine.event_ids.next();
        }
        self.engine.repo.append_transaction(&txn)?;

        // -- point of no return: the commit is durable --

        // 6. Apply reference counts in memory. A claim written by this
        //    session already holds one store reference, which now belongs
        //    to the committed records.
        for (&claim_id, &(_, txn_delta)) in &net {
            let applied = if self.new_claims.contains_key(&claim_id) {
                txn_delta - 1
            } else {
                txn_delta
            };
            self.apply_ref_delta(claim_id, applied);
        }
        for (&claim_id, _) in &self.new_claims {
            if !net.contains_key(&claim_id) {
                // Written but referenced by nothing that survived.
                self.apply_ref_delta(claim_id, -1);
            }
        }

        // 7. Provenance projection, then publication.
        if let Err(e) = self.engine.provenance.append_batch(&txn.events) {
            warn!(error = %e, "provenance projection failed; will re-project on restart");
        }
        for (record, destination) in outbound {
            let queue = destinations.get(&destination).expect("collected above");
            if let Err(e) = queue.offer_unchecked(record) {
                warn!(connection = %destination, error = %e, "publication failed; will replay on restart");
            }
        }
        drop(publish);
        drop(gate);

        for container in self.pinned.drain(..) {
            if let Err(e) = self.engine.content.unpin_container(container) {
                warn!(container = %container, error = %e, "unpin failed");
            }
        }

        debug!(txn = txn.txn_id, "session committed");
        self.finish(SessionState::Committed);
        Ok(())
    }

    /// Discard all staged work and restore pulled records to their source
    /// queues at their original positions.
    pub fn rollback(&mut self) {
        self.rollback_inner();
    }

    fn rollback_inner(&mut self) {
        if self.finished {
            return;
        }

        for claim in self.new_claims.values() {
            if let Err(e) = self.engine.content.decrement_ref(claim.id) {
                warn!(claim = %claim.id, error = %e, "failed to discard claim on rollback");
            }
        }

        // Restore pulled and expired records, original state intact.
        let mut by_source: HashMap<ConnectionId, Vec<FlowRecord>> = HashMap::new();
        for p in self.pulled.values() {
            by_source
                .entry(p.source)
                .or_default()
                .push(p.original.clone());
        }
        for (record, source) in self.expired.drain(..) {
            by_source.entry(source).or_default().push(record);
        }
        for (source, records) in by_source {
            match self.engine.connection(source) {
                Ok(queue) => {
                    if let Err(e) = queue.requeue(records) {
                        warn!(connection = %source, error = %e, "requeue on rollback failed");
                    }
                }
                Err(_) => {
                    warn!(connection = %source, "source connection gone; rolled-back records lost")
                }
            }
        }

        for container in self.pinned.drain(..) {
            if let Err(e) = self.engine.content.unpin_container(container) {
                warn!(container = %container, error = %e, "unpin failed");
            }
        }

        self.events.clear();
        debug!("session rolled back");
        self.finish(SessionState::RolledBack);
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.finished || self.state != SessionState::Open {
            return Err(EngineError::SessionClosed);
        }
        Ok(())
    }

    fn finish(&mut self, state: SessionState) {
        if !self.finished {
            self.finished = true;
            self.state = state;
            self.engine.session_finished();
        }
    }

    /// Stage an event with a placeholder id; real ids are assigned at
    /// commit, under the publish lock, in durable-append order.
    fn new_event(&self, kind: ProvenanceEventKind, record: RecordId) -> ProvenanceEvent {
        ProvenanceEvent::new(0, kind, record)
    }

    fn pin_content(&mut self, record: &FlowRecord) {
        if let Some(pointer) = record.content {
            self.engine.content.pin_container(pointer.claim.container);
            self.pinned.push(pointer.claim.container);
        }
    }

    fn apply_ref_delta(&self, claim_id: ClaimId, delta: i32) {
        for _ in 0..delta.abs() {
            let result = if delta > 0 {
                self.engine.content.increment_ref(claim_id).map(|_| ())
            } else {
                self.engine.content.decrement_ref(claim_id).map(|_| ())
            };
            if let Err(e) = result {
                warn!(claim = %claim_id, delta, error = %e, "reference-count application failed");
                break;
            }
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback_inner();
        }
    }
}
