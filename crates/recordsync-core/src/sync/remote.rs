//! Remote record store collaborator.
//!
//! The transport owns networking, timeouts and retries. The change manager
//! only needs push with per-record results, incremental pull per zone, and
//! zone enumeration.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::{RecordId, RemoteRecord, ZoneId};

/// Opaque server change token for incremental pulls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeToken(pub String);

/// Per-record results of a push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushOutcome {
    pub saved: Vec<RecordId>,
    pub deleted: Vec<RecordId>,
    pub failures: Vec<RecordFailure>,
}

/// A record the remote store refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub id: RecordId,
    pub reason: String,
}

/// Changes in one zone since a token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullBatch {
    pub modifications: Vec<RemoteRecord>,
    pub deletions: Vec<RecordId>,
    /// Token to resume from; `None` leaves the stored token unchanged.
    pub token: Option<ChangeToken>,
}

/// Remote record store.
///
/// A whole-call failure is reported as [`crate::SyncError::TransportFailure`].
pub trait RemoteStore: Send + Sync {
    fn zones(&self) -> Result<Vec<ZoneId>>;

    fn push(&self, records: Vec<RemoteRecord>, deletions: Vec<RecordId>) -> Result<PushOutcome>;

    fn pull(&self, zone: &ZoneId, since: Option<&ChangeToken>) -> Result<PullBatch>;
}
