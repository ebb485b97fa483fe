//! # RecordSync Core Library
//!
//! Keeps a local object store and a remote record store in step. Local
//! objects are typed entities with a string primary key; remote records are
//! flat attribute bags addressed by type, name and zone.
//!
//! ## Architecture
//!
//! - **Ledger**: per-object change state (`new`, `changed`, `deleted`,
//!   `synced`) deciding what must be pushed
//! - **Converter**: object to record mapping with relationships linearized
//!   into identifier references
//! - **Pending queue**: inbound relationships parked until every target
//!   exists locally, so records may arrive in any order
//! - **Storage**: SQLite metadata store and TOML configuration
//!
//! ## Key Components
//!
//! - [`ChangeManager`]: the sync orchestrator
//! - [`SchemaRegistry`]: validated descriptors of every [`Cloudable`] type
//! - [`LocalStore`] / [`RemoteStore`]: collaborator traits
//! - [`MetadataStore`]: ledger, queue and change token persistence
//! - [`Config`]: application configuration management

pub mod error;
pub mod memory;
pub mod record;
pub mod schema;
pub mod storage;
pub mod sync;

pub use error::{ConfigError, DatabaseError, Result, SchemaValidationError, SyncError};
pub use memory::{MemoryLocalStore, MemoryRemoteStore};
pub use record::{FieldValue, LocalObject, RecordId, RecordValue, RemoteRecord, Value, ZoneId};
pub use schema::{Cloudable, PropertyKind, ScalarType, SchemaDescriptor, SchemaRegistry};
pub use storage::{Config, MetadataStore};
pub use sync::{
    ChangeManager, ChangeState, LocalChange, LocalStore, ManagerOptions, ObjectConverter,
    PendingRelationship, RemoteStore, SyncReport, WriteOrigin, ZonePolicy,
};
