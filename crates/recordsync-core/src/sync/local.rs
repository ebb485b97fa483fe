//! Local object store collaborator.
//!
//! The sync layer never holds domain objects. It reads them, and writes them
//! back through a serialized [`LocalStore::write`] transaction. Local mutations
//! reach the change manager as ordered [`LocalChange`] batches on a channel.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::Result;
use crate::record::LocalObject;
use crate::schema::SchemaRegistry;

/// Who performed a write.
///
/// `Sync` writes apply inbound data and must not be announced on the change
/// feed, or they would be pushed straight back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOrigin {
    Local,
    Sync,
}

/// One committed batch of local mutations for a single type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalChange {
    pub object_type: String,
    pub inserted: Vec<String>,
    pub modified: Vec<String>,
    /// Soft-deleted identifiers. The objects stay until the remote side
    /// acknowledges the deletion.
    pub deleted: Vec<String>,
}

impl LocalChange {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Receiving end of a store's change notifications.
pub type ChangeFeed = UnboundedReceiver<LocalChange>;

/// Operations available inside a local write transaction.
pub trait LocalTransaction {
    /// Live (not soft-deleted) object.
    fn object(&self, object_type: &str, id: &str) -> Result<Option<LocalObject>>;

    fn contains(&self, object_type: &str, id: &str) -> Result<bool> {
        Ok(self.object(object_type, id)?.is_some())
    }

    /// Insert or replace an object.
    fn put(&mut self, object: LocalObject) -> Result<()>;

    /// Physically remove an object, soft-deleted or not.
    fn remove(&mut self, object_type: &str, id: &str) -> Result<bool>;
}

/// Typed object store with schema introspection and change notifications.
pub trait LocalStore {
    fn registry(&self) -> &SchemaRegistry;

    /// Live object by primary key.
    fn object(&self, object_type: &str, id: &str) -> Result<Option<LocalObject>>;

    /// Primary keys of every live object of a type.
    fn identifiers(&self, object_type: &str) -> Result<Vec<String>>;

    /// Run `f` in one serialized transaction. Nothing is committed when `f`
    /// fails.
    fn write(
        &self,
        origin: WriteOrigin,
        f: &mut dyn FnMut(&mut dyn LocalTransaction) -> Result<()>,
    ) -> Result<()>;

    /// New subscription to local change notifications, in commit order.
    fn subscribe(&self) -> ChangeFeed;
}
