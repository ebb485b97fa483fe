//! In-memory [`LocalStore`] with soft deletion and change notifications.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::record::{FieldValue, LocalObject, Value};
use crate::schema::{Cloudable, SchemaRegistry};
use crate::sync::local::{ChangeFeed, LocalChange, LocalStore, LocalTransaction, WriteOrigin};

type ObjectKey = (String, String);

#[derive(Debug, Clone, Default)]
struct Objects {
    live: BTreeMap<ObjectKey, LocalObject>,
    /// Soft-deleted objects awaiting a remote acknowledgement.
    soft_deleted: BTreeMap<ObjectKey, LocalObject>,
}

/// Object store backed by ordered maps.
///
/// Writers are serialized by a mutex; a transaction works on a copy that
/// replaces the committed state only when the closure succeeds.
pub struct MemoryLocalStore {
    registry: SchemaRegistry,
    objects: Mutex<Objects>,
    subscribers: Mutex<Vec<UnboundedSender<LocalChange>>>,
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> SyncError {
    SyncError::Store("local store lock poisoned".into())
}

impl MemoryLocalStore {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry,
            objects: Mutex::new(Objects::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn objects(&self) -> Result<MutexGuard<'_, Objects>> {
        self.objects.lock().map_err(poisoned)
    }

    /// Insert or update an object as an application write.
    pub fn save_object(&self, object: LocalObject) -> Result<()> {
        let mut object = Some(object);
        self.write(WriteOrigin::Local, &mut |tx| match object.take() {
            Some(object) => tx.put(object),
            None => Ok(()),
        })
    }

    pub fn save<T: Cloudable>(&self, value: &T) -> Result<()> {
        self.save_object(value.to_object())
    }

    /// Typed lookup of a live object.
    pub fn get<T: Cloudable>(&self, id: &str) -> Result<Option<T>> {
        self.object(T::RECORD_TYPE, id)?
            .map(|object| T::from_object(&object))
            .transpose()
    }

    /// Soft-delete an object as an application write.
    ///
    /// The object disappears from reads but is kept until the sync layer
    /// removes it. Returns `false` if no live object matched.
    pub fn soft_delete(&self, object_type: &str, id: &str) -> Result<bool> {
        let mut objects = self.objects()?;
        let key = (object_type.to_string(), id.to_string());
        let Some(object) = objects.live.remove(&key) else {
            return Ok(false);
        };
        objects.soft_deleted.insert(key, object);

        let mut change = LocalChange::new(object_type);
        change.deleted.push(id.to_string());
        self.notify(vec![change])?;
        Ok(true)
    }

    /// Whether a soft-deleted copy is still held.
    pub fn is_soft_deleted(&self, object_type: &str, id: &str) -> Result<bool> {
        let objects = self.objects()?;
        Ok(objects
            .soft_deleted
            .contains_key(&(object_type.to_string(), id.to_string())))
    }

    /// Number of live objects of a type.
    pub fn count(&self, object_type: &str) -> Result<usize> {
        Ok(self.identifiers(object_type)?.len())
    }

    /// Close every change feed, as a store does on shutdown.
    pub fn close_feeds(&self) -> Result<()> {
        self.subscribers.lock().map_err(poisoned)?.clear();
        Ok(())
    }

    fn notify(&self, changes: Vec<LocalChange>) -> Result<()> {
        let mut subscribers = self.subscribers.lock().map_err(poisoned)?;
        for change in changes {
            subscribers.retain(|tx| tx.send(change.clone()).is_ok());
        }
        Ok(())
    }
}

impl LocalStore for MemoryLocalStore {
    fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    fn object(&self, object_type: &str, id: &str) -> Result<Option<LocalObject>> {
        let objects = self.objects()?;
        Ok(objects
            .live
            .get(&(object_type.to_string(), id.to_string()))
            .cloned())
    }

    fn identifiers(&self, object_type: &str) -> Result<Vec<String>> {
        let objects = self.objects()?;
        Ok(objects
            .live
            .keys()
            .filter(|(t, _)| t == object_type)
            .map(|(_, id)| id.clone())
            .collect())
    }

    fn write(
        &self,
        origin: WriteOrigin,
        f: &mut dyn FnMut(&mut dyn LocalTransaction) -> Result<()>,
    ) -> Result<()> {
        // Held until notifications are sent so feeds observe commit order.
        let mut objects = self.objects()?;
        let mut tx = MemoryTransaction {
            registry: &self.registry,
            original: &objects,
            working: objects.clone(),
            changes: BTreeMap::new(),
        };
        f(&mut tx)?;

        let MemoryTransaction { working, changes, .. } = tx;
        *objects = working;

        if origin == WriteOrigin::Local {
            let changes: Vec<LocalChange> = changes.into_values().filter(|c| !c.is_empty()).collect();
            if !changes.is_empty() {
                self.notify(changes)?;
            }
        } else {
            debug!(changed_types = changes.len(), "applied sync write without notification");
        }
        Ok(())
    }

    fn subscribe(&self) -> ChangeFeed {
        let (tx, rx) = unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }
}

struct MemoryTransaction<'a> {
    registry: &'a SchemaRegistry,
    original: &'a Objects,
    working: Objects,
    changes: BTreeMap<String, LocalChange>,
}

impl MemoryTransaction<'_> {
    fn change(&mut self, object_type: &str) -> &mut LocalChange {
        self.changes
            .entry(object_type.to_string())
            .or_insert_with(|| LocalChange::new(object_type))
    }
}

impl LocalTransaction for MemoryTransaction<'_> {
    fn object(&self, object_type: &str, id: &str) -> Result<Option<LocalObject>> {
        Ok(self
            .working
            .live
            .get(&(object_type.to_string(), id.to_string()))
            .cloned())
    }

    fn put(&mut self, mut object: LocalObject) -> Result<()> {
        let schema = self.registry.get(&object.object_type).ok_or_else(|| {
            SyncError::Store(format!("type '{}' is not registered", object.object_type))
        })?;
        object.fields.insert(
            schema.primary_key.clone(),
            FieldValue::Scalar(Value::String(object.id.clone())),
        );

        let key = (object.object_type.clone(), object.id.clone());
        let existed = self.original.live.contains_key(&key);
        self.working.soft_deleted.remove(&key);
        self.working.live.insert(key, object.clone());

        let change = self.change(&object.object_type);
        let list = if existed { &mut change.modified } else { &mut change.inserted };
        if !list.contains(&object.id) {
            list.push(object.id);
        }
        Ok(())
    }

    fn remove(&mut self, object_type: &str, id: &str) -> Result<bool> {
        let key = (object_type.to_string(), id.to_string());
        let live = self.working.live.remove(&key).is_some();
        let soft = self.working.soft_deleted.remove(&key).is_some();
        Ok(live || soft)
    }
}
