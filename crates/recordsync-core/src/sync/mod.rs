//! Synchronization layer.
//!
//! Tracks local changes in a ledger, converts objects to remote records and
//! back, and defers relationships until their targets exist locally.

pub mod converter;
pub mod ledger;
pub mod local;
pub mod manager;
pub mod pending;
pub mod remote;
pub mod zone;

#[cfg(test)]
mod manager_tests;

pub use converter::ObjectConverter;
pub use ledger::{ChangeState, EntityKey, Ledger, LedgerCounts, SyncedEntity};
pub use local::{ChangeFeed, LocalChange, LocalStore, LocalTransaction, WriteOrigin};
pub use manager::{
    ChangeManager, CleanupReport, InboundReport, ManagerOptions, Outbound, PushReport,
    ResolutionReport, SyncReport, retention_cutoff,
};
pub use pending::{PendingQueue, PendingRelationship, QueuedRelationship};
pub use remote::{ChangeToken, PullBatch, PushOutcome, RecordFailure, RemoteStore};
pub use zone::ZonePolicy;
