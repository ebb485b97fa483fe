//! Change manager: observes local mutations, pushes what changed, applies
//! what was pulled, and retries deferred relationships.
//!
//! The manager owns the metadata store and a subscription to the local
//! store's change feed. The transport is borrowed through a [`Weak`] handle;
//! once the host drops it, push and pull quietly do nothing.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::record::{RecordId, RemoteRecord, ZoneId};
use crate::schema::SchemaRegistry;
use crate::storage::metadata::save_change_token;
use crate::storage::{Config, MetadataStore};
use crate::sync::converter::ObjectConverter;
use crate::sync::ledger::{ChangeState, EntityKey, Ledger};
use crate::sync::local::{ChangeFeed, LocalChange, LocalStore, LocalTransaction, WriteOrigin};
use crate::sync::pending::{self, PendingQueue, PendingRelationship};
use crate::sync::remote::{PullBatch, PushOutcome, RemoteStore};
use crate::sync::zone::ZonePolicy;

pub const DEFAULT_PUSH_BATCH_SIZE: usize = 200;

/// Oldest modification time kept by a cleanup with `retention`.
///
/// Clamped to the Unix epoch, which predates every stored timestamp, so a
/// window reaching past it keeps everything.
pub fn retention_cutoff(retention: Duration) -> DateTime<Utc> {
    Utc::now()
        .checked_sub_signed(retention)
        .filter(|cutoff| *cutoff > DateTime::<Utc>::UNIX_EPOCH)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Construction options for [`ChangeManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub zone_policy: ZonePolicy,
    /// Maximum records plus deletions per push call.
    pub push_batch_size: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            zone_policy: ZonePolicy::default(),
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
        }
    }
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            zone_policy: config.zone_policy(),
            push_batch_size: (config.sync.push_batch_size as usize).max(1),
        }
    }
}

/// Records and deletions awaiting a push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outbound {
    pub records: Vec<RemoteRecord>,
    pub deletions: Vec<RecordId>,
}

impl Outbound {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.deletions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.deletions.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub saved: usize,
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionReport {
    pub applied: usize,
    /// Still waiting for targets.
    pub waiting: usize,
    /// Dropped as corrupted.
    pub discarded: usize,
    /// Failed for another reason; kept queued.
    pub failed: usize,
}

impl ResolutionReport {
    fn merge(&mut self, other: ResolutionReport) {
        self.applied += other.applied;
        self.waiting += other.waiting;
        self.discarded += other.discarded;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InboundReport {
    pub applied: usize,
    pub deleted: usize,
    /// Records dropped because they could not be converted or written.
    pub dropped: usize,
    pub relationships: ResolutionReport,
}

impl InboundReport {
    fn merge(&mut self, other: InboundReport) {
        self.applied += other.applied;
        self.deleted += other.deleted;
        self.dropped += other.dropped;
        self.relationships.merge(other.relationships);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub tombstones: usize,
    pub relationships: usize,
}

/// Outcome of one full sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Local change batches consumed from the feed.
    pub observed: usize,
    pub push: PushReport,
    pub pull: InboundReport,
    pub relationships: ResolutionReport,
    /// Transient failure that cut the cycle short, if any.
    pub deferred: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Applied,
    Waiting,
    Discarded,
    Failed,
}

/// Sync orchestrator for one local store.
pub struct ChangeManager<L: LocalStore> {
    local: Arc<L>,
    metadata: MetadataStore,
    converter: ObjectConverter,
    feed: ChangeFeed,
    remote: Option<Weak<dyn RemoteStore>>,
    push_batch_size: usize,
}

impl<L: LocalStore> ChangeManager<L> {
    /// Subscribe to `local` and take ownership of `metadata`.
    pub fn new(local: Arc<L>, metadata: MetadataStore, options: ManagerOptions) -> Self {
        let feed = local.subscribe();
        let converter = ObjectConverter::new(local.registry().clone(), options.zone_policy);
        Self {
            local,
            metadata,
            converter,
            feed,
            remote: None,
            push_batch_size: options.push_batch_size.max(1),
        }
    }

    /// Attach a transport without taking ownership of it.
    pub fn connect(&mut self, remote: &Arc<dyn RemoteStore>) {
        self.remote = Some(Arc::downgrade(remote));
    }

    pub fn disconnect(&mut self) {
        self.remote = None;
    }

    fn transport(&self) -> Option<Arc<dyn RemoteStore>> {
        let remote = self.remote.as_ref().and_then(Weak::upgrade);
        if remote.is_none() {
            debug!("no live transport attached");
        }
        remote
    }

    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn converter(&self) -> &ObjectConverter {
        &self.converter
    }

    fn registry(&self) -> &SchemaRegistry {
        self.converter.registry()
    }

    /// Fold one local change batch into the ledger.
    pub fn observe(&self, change: &LocalChange) -> Result<()> {
        let object_type = change.object_type.as_str();
        self.metadata.write(|conn| {
            let ledger = Ledger::new(conn);
            for id in change.inserted.iter().chain(&change.modified) {
                let current = ledger.entity(object_type, id)?;
                if current.as_ref().is_some_and(|e| e.change_state == ChangeState::Deleted && !e.is_deleted) {
                    debug!(object_type, identifier = %id, "object re-created before its deletion was pushed");
                }
                ledger.upsert(object_type, id, ChangeState::after_local_write(current.as_ref()))?;
            }
            for id in &change.deleted {
                let current = ledger.entity(object_type, id)?;
                match ChangeState::after_local_delete(current.as_ref()) {
                    Some(state) => {
                        ledger.upsert(object_type, id, state)?;
                    }
                    None => debug!(object_type, identifier = %id, "deletion already acknowledged"),
                }
            }
            Ok(())
        })
    }

    /// Consume every change batch already on the feed without waiting.
    pub fn drain_local_changes(&mut self) -> Result<usize> {
        let mut observed = 0;
        loop {
            match self.feed.try_recv() {
                Ok(change) => {
                    self.observe(&change)?;
                    observed += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(observed)
    }

    /// Consume the feed until the local store goes away.
    pub async fn watch_local_changes(&mut self) -> Result<usize> {
        let mut observed = 0;
        while let Some(change) = self.feed.recv().await {
            self.observe(&change)?;
            observed += 1;
        }
        debug!(observed, "local change feed closed");
        Ok(observed)
    }

    /// Seed `new` entries for live objects the ledger has never seen.
    pub fn track_existing(&self) -> Result<usize> {
        let mut seeded = Vec::new();
        for object_type in self.registry().record_types() {
            for id in self.local.identifiers(object_type)? {
                seeded.push((object_type.to_string(), id));
            }
        }
        let tracked = self.metadata.write(|conn| {
            let ledger = Ledger::new(conn);
            let mut tracked = 0;
            for (object_type, id) in &seeded {
                if ledger.entity(object_type, id)?.is_none() {
                    ledger.upsert(object_type, id, ChangeState::New)?;
                    tracked += 1;
                }
            }
            Ok(tracked)
        })?;
        if tracked > 0 {
            info!(tracked, "tracking existing local objects");
        }
        Ok(tracked)
    }

    /// Build records and deletions for every outbound ledger entry.
    ///
    /// An object that cannot be converted stays pending and is reported.
    pub fn prepare_push(&self) -> Result<Outbound> {
        let entities = self.metadata.ledger().entities_in(&[
            ChangeState::New,
            ChangeState::Changed,
            ChangeState::Deleted,
        ])?;

        let mut outbound = Outbound::default();
        for entity in entities {
            let id = self.converter.record_id(&entity.object_type, &entity.identifier);
            if entity.change_state == ChangeState::Deleted {
                outbound.deletions.push(id);
                continue;
            }
            match self.local.object(&entity.object_type, &entity.identifier)? {
                Some(object) => match self.converter.object_to_record(&object) {
                    Ok(record) => outbound.records.push(record),
                    Err(e) => warn!(record = %id, kind = e.kind(), error = %e, "cannot convert object for push"),
                },
                None => {
                    debug!(record = %id, "object vanished locally, pushing deletion");
                    outbound.deletions.push(id);
                }
            }
        }
        Ok(outbound)
    }

    /// Record what the remote side acknowledged.
    ///
    /// Acknowledged deletions are physically removed from the local store.
    /// Failed records keep their state for the next cycle.
    pub fn did_push(&self, outcome: &PushOutcome) -> Result<PushReport> {
        for failure in &outcome.failures {
            warn!(record = %failure.id, reason = %failure.reason, "remote store rejected record");
        }

        // An object re-created while its deletion was in flight stays, and
        // its ledger entry keeps the pending write.
        let mut deleted = Vec::new();
        if !outcome.deleted.is_empty() {
            self.local.write(WriteOrigin::Sync, &mut |tx| {
                deleted.clear();
                for id in &outcome.deleted {
                    if tx.contains(&id.record_type, &id.record_name)? {
                        debug!(record = %id, "object re-created since its deletion was sent");
                        continue;
                    }
                    tx.remove(&id.record_type, &id.record_name)?;
                    deleted.push(entity_key(id));
                }
                Ok(())
            })?;
        }

        let saved: Vec<EntityKey> = outcome.saved.iter().map(entity_key).collect();
        self.metadata.write(|conn| {
            let ledger = Ledger::new(conn);
            ledger.mark_synced(&saved)?;
            ledger.mark_deleted(&deleted)?;
            Ok(())
        })?;

        Ok(PushReport {
            saved: outcome.saved.len(),
            deleted: deleted.len(),
            failed: outcome.failures.len(),
        })
    }

    /// Push every pending change in chunks of `push_batch_size`.
    ///
    /// Chunks acknowledged before a transport failure stay acknowledged.
    pub fn push(&mut self) -> Result<PushReport> {
        let Some(remote) = self.transport() else {
            return Ok(PushReport::default());
        };
        let Outbound { records, deletions } = self.prepare_push()?;
        if records.is_empty() && deletions.is_empty() {
            return Ok(PushReport::default());
        }

        let mut report = PushReport::default();
        for batch in chunk(records, deletions, self.push_batch_size) {
            let outcome = remote.push(batch.records, batch.deletions).map_err(|e| {
                warn!(kind = e.kind(), error = %e, "push failed, changes stay pending");
                e
            })?;
            let acknowledged = self.did_push(&outcome)?;
            report.saved += acknowledged.saved;
            report.deleted += acknowledged.deleted;
            report.failed += acknowledged.failed;
        }
        info!(saved = report.saved, deleted = report.deleted, failed = report.failed, "push complete");
        Ok(report)
    }

    /// Apply one pulled batch without touching change tokens.
    pub fn apply_inbound(&self, batch: PullBatch) -> Result<InboundReport> {
        self.apply_batch(None, batch)
    }

    /// Apply a batch in one metadata transaction and one local transaction.
    ///
    /// Relationships are queued, then every unresolved relationship is
    /// retried against the updated local state. The zone's change token is
    /// saved with the rest of the metadata so a failed batch is pulled again.
    fn apply_batch(&self, zone: Option<&ZoneId>, batch: PullBatch) -> Result<InboundReport> {
        let mut report = InboundReport::default();
        let mut converted = Vec::new();
        for record in &batch.modifications {
            match self.converter.record_to_object(record) {
                Ok(pair) => converted.push(pair),
                Err(e) => {
                    warn!(record = %record.id, kind = e.kind(), error = %e, "dropping inbound record");
                    report.dropped += 1;
                }
            }
        }

        let registry = self.registry();
        self.metadata.write(|conn| {
            let ledger = Ledger::new(conn);
            let queue = PendingQueue::new(conn);
            for (_, relationships) in &converted {
                for relationship in relationships {
                    queue.enqueue(relationship)?;
                }
            }
            let unresolved = queue.unresolved()?;

            let mut written = Vec::new();
            let mut removed = Vec::new();
            let mut outcomes = Vec::new();
            self.local.write(WriteOrigin::Sync, &mut |tx| {
                written.clear();
                removed.clear();
                for (object, _) in &converted {
                    let merged = match tx.object(&object.object_type, &object.id)? {
                        Some(mut existing) => {
                            existing.absorb(object.clone());
                            existing
                        }
                        None => object.clone(),
                    };
                    match tx.put(merged) {
                        Ok(()) => written.push(EntityKey::new(&object.object_type, &object.id)),
                        Err(e) => warn!(
                            object_type = %object.object_type,
                            identifier = %object.id,
                            kind = e.kind(),
                            error = %e,
                            "cannot write inbound object"
                        ),
                    }
                }
                for id in &batch.deletions {
                    match tx.remove(&id.record_type, &id.record_name) {
                        Ok(_) => removed.push(entity_key(id)),
                        Err(e) => warn!(
                            record = %id,
                            kind = e.kind(),
                            error = %e,
                            "cannot apply inbound deletion"
                        ),
                    }
                }
                outcomes = resolve_all(registry, &unresolved, tx);
                Ok(())
            })?;

            for key in &written {
                if let Some(previous) = ledger.entity(&key.object_type, &key.identifier)? {
                    if previous.change_state.is_outbound() {
                        debug!(entity = %key, state = %previous.change_state, "inbound record replaces local change");
                    }
                }
                ledger.upsert(&key.object_type, &key.identifier, ChangeState::Synced)?;
            }
            for key in &removed {
                if ledger.entity(&key.object_type, &key.identifier)?.is_some() {
                    ledger.mark_deleted(std::slice::from_ref(key))?;
                }
            }
            report.relationships = record_resolutions(&queue, &outcomes)?;
            report.applied = written.len();
            report.deleted = removed.len();
            report.dropped += converted.len() - written.len();

            if let (Some(zone), Some(token)) = (zone, batch.token.as_ref()) {
                save_change_token(conn, zone, token)?;
            }
            Ok(())
        })?;

        Ok(report)
    }

    /// Pull every zone the remote store knows, resuming from saved tokens.
    pub fn pull(&mut self) -> Result<InboundReport> {
        let Some(remote) = self.transport() else {
            return Ok(InboundReport::default());
        };
        let mut report = InboundReport::default();
        for zone in remote.zones()? {
            let token = self.metadata.change_token(&zone)?;
            let batch = remote.pull(&zone, token.as_ref()).map_err(|e| {
                warn!(zone = %zone, kind = e.kind(), error = %e, "pull failed");
                e
            })?;
            debug!(
                zone = %zone,
                modifications = batch.modifications.len(),
                deletions = batch.deletions.len(),
                "pulled zone"
            );
            report.merge(self.apply_batch(Some(&zone), batch)?);
        }
        Ok(report)
    }

    /// Retry every unresolved relationship against current local state.
    pub fn resolve_pending(&self) -> Result<ResolutionReport> {
        let registry = self.registry();
        self.metadata.write(|conn| {
            let queue = PendingQueue::new(conn);
            let unresolved = queue.unresolved()?;
            if unresolved.is_empty() {
                return Ok(ResolutionReport::default());
            }
            let mut outcomes = Vec::new();
            self.local.write(WriteOrigin::Sync, &mut |tx| {
                outcomes = resolve_all(registry, &unresolved, tx);
                Ok(())
            })?;
            record_resolutions(&queue, &outcomes)
        })
    }

    /// Purge tombstones and applied relationships older than `retention`.
    pub fn cleanup(&self, retention: Duration) -> Result<CleanupReport> {
        let before = retention_cutoff(retention);
        let report = self.metadata.write(|conn| {
            Ok(CleanupReport {
                tombstones: Ledger::new(conn).reap(before)?,
                relationships: PendingQueue::new(conn).reap_applied(before)?,
            })
        })?;
        info!(
            tombstones = report.tombstones,
            relationships = report.relationships,
            "cleanup complete"
        );
        Ok(report)
    }

    /// Drain local changes, push, pull, then retry deferred relationships.
    ///
    /// A transient failure ends the cycle early and is reported in
    /// [`SyncReport::deferred`]; anything else is returned as an error.
    pub fn sync(&mut self) -> Result<SyncReport> {
        let mut report = SyncReport {
            observed: self.drain_local_changes()?,
            ..SyncReport::default()
        };

        match self.push().and_then(|push| {
            report.push = push;
            self.pull()
        }) {
            Ok(pull) => report.pull = pull,
            Err(e) if e.is_transient() => report.deferred = Some(e.to_string()),
            Err(e) => return Err(e),
        }
        report.relationships = self.resolve_pending()?;

        info!(
            observed = report.observed,
            pushed = report.push.saved + report.push.deleted,
            pulled = report.pull.applied + report.pull.deleted,
            relationships_applied = report.pull.relationships.applied + report.relationships.applied,
            deferred = report.deferred.is_some(),
            "sync cycle complete"
        );
        Ok(report)
    }
}

fn entity_key(id: &RecordId) -> EntityKey {
    EntityKey::new(&id.record_type, &id.record_name)
}

/// Split outbound work into push calls of at most `size` items.
fn chunk(records: Vec<RemoteRecord>, deletions: Vec<RecordId>, size: usize) -> Vec<Outbound> {
    let mut batches = Vec::new();
    let mut current = Outbound::default();
    for record in records {
        current.records.push(record);
        if current.len() == size {
            batches.push(std::mem::take(&mut current));
        }
    }
    for id in deletions {
        current.deletions.push(id);
        if current.len() == size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn resolve_all(
    registry: &SchemaRegistry,
    relationships: &[PendingRelationship],
    tx: &mut dyn LocalTransaction,
) -> Vec<(String, Resolution)> {
    relationships
        .iter()
        .map(|relationship| {
            let key = relationship.key();
            let resolution = match pending::resolve(registry, relationship, tx) {
                Ok(()) => Resolution::Applied,
                Err(e @ SyncError::PartiallyConnected { .. }) => {
                    debug!(relationship = %key, error = %e, "relationship needs retry");
                    Resolution::Waiting
                }
                Err(e @ SyncError::Corrupted { .. }) => {
                    warn!(relationship = %key, error = %e, "discarding corrupted relationship");
                    Resolution::Discarded
                }
                Err(e) => {
                    warn!(relationship = %key, kind = e.kind(), error = %e, "relationship resolution failed");
                    Resolution::Failed
                }
            };
            (key, resolution)
        })
        .collect()
}

fn record_resolutions(
    queue: &PendingQueue<'_>,
    outcomes: &[(String, Resolution)],
) -> Result<ResolutionReport> {
    let mut report = ResolutionReport::default();
    for (key, resolution) in outcomes {
        match resolution {
            Resolution::Applied => {
                queue.mark_applied(key)?;
                report.applied += 1;
            }
            Resolution::Discarded => {
                queue.discard(key)?;
                report.discarded += 1;
            }
            Resolution::Waiting => report.waiting += 1,
            Resolution::Failed => report.failed += 1,
        }
    }
    Ok(report)
}
