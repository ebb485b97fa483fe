//! In-memory [`RemoteStore`] with a per-zone change log.
//!
//! Change tokens are decimal sequence numbers. Saves are last-writer-wins.
//! Failures can be injected per record or for the whole transport.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, SyncError};
use crate::record::{RecordId, RemoteRecord, ZoneId};
use crate::sync::remote::{ChangeToken, PullBatch, PushOutcome, RecordFailure, RemoteStore};

#[derive(Debug, Clone)]
enum LogEntry {
    Saved(RecordId),
    Deleted(RecordId),
}

#[derive(Debug, Default)]
struct RemoteState {
    records: BTreeMap<RecordId, RemoteRecord>,
    log: Vec<(u64, ZoneId, LogEntry)>,
    seq: u64,
    zones: BTreeSet<ZoneId>,
    rejected: BTreeSet<String>,
    offline: bool,
    pushes: usize,
}

impl RemoteState {
    fn save(&mut self, record: RemoteRecord) {
        self.seq += 1;
        self.zones.insert(record.id.zone.clone());
        self.log
            .push((self.seq, record.id.zone.clone(), LogEntry::Saved(record.id.clone())));
        self.records.insert(record.id.clone(), record);
    }

    fn delete(&mut self, id: RecordId) {
        self.seq += 1;
        self.records.remove(&id);
        self.log.push((self.seq, id.zone.clone(), LogEntry::Deleted(id)));
    }
}

#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, RemoteState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::TransportFailure("remote store lock poisoned".into()))
    }

    /// Write a record as another device would.
    pub fn insert(&self, record: RemoteRecord) -> Result<()> {
        self.state()?.save(record);
        Ok(())
    }

    /// Delete a record as another device would.
    pub fn remove(&self, id: &RecordId) -> Result<()> {
        self.state()?.delete(id.clone());
        Ok(())
    }

    pub fn record(&self, id: &RecordId) -> Result<Option<RemoteRecord>> {
        Ok(self.state()?.records.get(id).cloned())
    }

    pub fn records(&self) -> Result<Vec<RemoteRecord>> {
        Ok(self.state()?.records.values().cloned().collect())
    }

    /// Refuse future saves of records with this name.
    pub fn reject(&self, record_name: &str) -> Result<()> {
        self.state()?.rejected.insert(record_name.to_string());
        Ok(())
    }

    pub fn accept(&self, record_name: &str) -> Result<()> {
        self.state()?.rejected.remove(record_name);
        Ok(())
    }

    /// While offline every call fails with a transport failure.
    pub fn set_offline(&self, offline: bool) -> Result<()> {
        self.state()?.offline = offline;
        Ok(())
    }

    /// Number of push calls received, including failed ones.
    pub fn push_count(&self) -> Result<usize> {
        Ok(self.state()?.pushes)
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn zones(&self) -> Result<Vec<ZoneId>> {
        let state = self.state()?;
        if state.offline {
            return Err(SyncError::TransportFailure("remote store is offline".into()));
        }
        Ok(state.zones.iter().cloned().collect())
    }

    fn push(&self, records: Vec<RemoteRecord>, deletions: Vec<RecordId>) -> Result<PushOutcome> {
        let mut state = self.state()?;
        state.pushes += 1;
        if state.offline {
            return Err(SyncError::TransportFailure("remote store is offline".into()));
        }

        let mut outcome = PushOutcome::default();
        for record in records {
            if state.rejected.contains(record.record_name()) {
                outcome.failures.push(RecordFailure {
                    id: record.id,
                    reason: "rejected by server".into(),
                });
                continue;
            }
            outcome.saved.push(record.id.clone());
            state.save(record);
        }
        for id in deletions {
            outcome.deleted.push(id.clone());
            state.delete(id);
        }
        Ok(outcome)
    }

    fn pull(&self, zone: &ZoneId, since: Option<&ChangeToken>) -> Result<PullBatch> {
        let state = self.state()?;
        if state.offline {
            return Err(SyncError::TransportFailure("remote store is offline".into()));
        }
        let since = match since {
            Some(token) => token
                .0
                .parse::<u64>()
                .map_err(|_| SyncError::TransportFailure(format!("invalid change token '{}'", token.0)))?,
            None => 0,
        };

        // Latest entry per record wins.
        let mut latest: BTreeMap<RecordId, bool> = BTreeMap::new();
        for (seq, entry_zone, entry) in &state.log {
            if *seq <= since || entry_zone != zone {
                continue;
            }
            match entry {
                LogEntry::Saved(id) => latest.insert(id.clone(), true),
                LogEntry::Deleted(id) => latest.insert(id.clone(), false),
            };
        }

        let mut batch = PullBatch {
            token: Some(ChangeToken(state.seq.max(since).to_string())),
            ..PullBatch::default()
        };
        for (id, saved) in latest {
            match (saved, state.records.get(&id)) {
                (true, Some(record)) => batch.modifications.push(record.clone()),
                _ => batch.deletions.push(id),
            }
        }
        Ok(batch)
    }
}
