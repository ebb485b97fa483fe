//! Pending relationship queue.
//!
//! Inbound records carry relationships as identifiers whose targets may not
//! have arrived yet. Each relationship is parked here, keyed by source object
//! and property, and applied once every target exists locally.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::record::FieldValue;
use crate::schema::{PropertyKind, SchemaRegistry};
use crate::storage::metadata::{decode_time, encode_time};
use crate::sync::local::LocalTransaction;

/// A deferred relationship assignment.
///
/// An empty `targets` list sets the property to null (to-one) or empty (to-many).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRelationship {
    pub from_type: String,
    pub from_identifier: String,
    pub property: String,
    pub to_type: String,
    pub targets: Vec<String>,
}

impl PendingRelationship {
    /// Queue identity. Unambiguous for any identifier content.
    pub fn key(&self) -> String {
        relationship_key(&self.from_type, &self.from_identifier, &self.property)
    }
}

pub fn relationship_key(from_type: &str, from_identifier: &str, property: &str) -> String {
    serde_json::json!([from_type, from_identifier, property]).to_string()
}

/// A queue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRelationship {
    pub relationship: PendingRelationship,
    pub seq: i64,
    pub is_applied: bool,
    pub enqueued_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

type QueueRow = (String, String, String, String, String, i64, bool, String, Option<String>);

const SELECT_QUEUED: &str = "SELECT from_type, from_identifier, property, to_type, targets,
    seq, is_applied, enqueued_at, applied_at FROM pending_relationships";

/// Queue operations over a metadata connection.
pub struct PendingQueue<'a> {
    conn: &'a Connection,
}

impl<'a> PendingQueue<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
        ))
    }

    fn decode(row: QueueRow) -> Result<QueuedRelationship> {
        let (from_type, from_identifier, property, to_type, targets, seq, is_applied, enqueued_at, applied_at) = row;
        Ok(QueuedRelationship {
            relationship: PendingRelationship {
                from_type,
                from_identifier,
                property,
                to_type,
                targets: serde_json::from_str(&targets)?,
            },
            seq,
            is_applied,
            enqueued_at: decode_time(&enqueued_at)?,
            applied_at: applied_at.as_deref().map(decode_time).transpose()?,
        })
    }

    /// Queue a relationship, superseding any entry for the same key.
    ///
    /// The newer target list replaces the old one outright and the entry
    /// becomes unresolved again.
    pub fn enqueue(&self, relationship: &PendingRelationship) -> Result<()> {
        let targets = serde_json::to_string(&relationship.targets)?;
        self.conn.execute(
            "INSERT INTO pending_relationships
                (key, seq, from_type, from_identifier, property, to_type, targets, is_applied, enqueued_at, applied_at)
             VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM pending_relationships),
                     ?2, ?3, ?4, ?5, ?6, 0, ?7, NULL)
             ON CONFLICT(key) DO UPDATE SET
                seq = excluded.seq,
                to_type = excluded.to_type,
                targets = excluded.targets,
                is_applied = 0,
                enqueued_at = excluded.enqueued_at,
                applied_at = NULL",
            params![
                relationship.key(),
                relationship.from_type,
                relationship.from_identifier,
                relationship.property,
                relationship.to_type,
                targets,
                encode_time(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<QueuedRelationship>> {
        let row = self
            .conn
            .query_row(&format!("{SELECT_QUEUED} WHERE key = ?1"), params![key], Self::row)
            .optional()?;
        row.map(Self::decode).transpose()
    }

    /// Entries still waiting to be applied, in enqueue order.
    pub fn unresolved(&self) -> Result<Vec<PendingRelationship>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_QUEUED} WHERE is_applied = 0 ORDER BY seq"))?;
        let rows = stmt.query_map([], Self::row)?;
        let mut relationships = Vec::new();
        for row in rows {
            relationships.push(Self::decode(row?)?.relationship);
        }
        Ok(relationships)
    }

    /// Number of unresolved entries.
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_relationships WHERE is_applied = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn mark_applied(&self, key: &str) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE pending_relationships SET is_applied = 1, applied_at = ?2 WHERE key = ?1",
            params![key, encode_time(Utc::now())],
        )?;
        Ok(updated > 0)
    }

    /// Drop an entry regardless of state.
    pub fn discard(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM pending_relationships WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    /// Physically remove applied entries older than `before`.
    pub fn reap_applied(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM pending_relationships WHERE is_applied = 1 AND applied_at < ?1",
            params![encode_time(before)],
        )?;
        Ok(removed)
    }
}

/// Apply one relationship inside a local transaction.
///
/// Returns [`SyncError::PartiallyConnected`] when a target is missing, leaving
/// the source object untouched, and [`SyncError::Corrupted`] when the
/// relationship no longer matches the registered schema.
pub fn resolve(
    registry: &SchemaRegistry,
    relationship: &PendingRelationship,
    tx: &mut dyn LocalTransaction,
) -> Result<()> {
    let corrupted = |reason: String| {
        SyncError::corrupted(&relationship.from_type, &relationship.from_identifier, reason)
    };

    let schema = registry
        .get(&relationship.from_type)
        .ok_or_else(|| corrupted("record type is not registered".into()))?;
    let property = schema
        .get(&relationship.property)
        .ok_or_else(|| corrupted(format!("property '{}' does not exist", relationship.property)))?;
    if schema.non_synced.contains(&property.name) {
        return Err(corrupted(format!("property '{}' is not synced", property.name)));
    }
    let to_many = match &property.kind {
        PropertyKind::ToOne { target } | PropertyKind::ToMany { target }
            if *target != relationship.to_type =>
        {
            return Err(corrupted(format!(
                "property '{}' now targets '{}', not '{}'",
                property.name, target, relationship.to_type
            )));
        }
        PropertyKind::ToOne { .. } => false,
        PropertyKind::ToMany { .. } => true,
        _ => {
            return Err(corrupted(format!(
                "property '{}' is not a stored relationship",
                property.name
            )))
        }
    };

    let mut source = tx
        .object(&relationship.from_type, &relationship.from_identifier)?
        .ok_or_else(|| corrupted("source object does not exist".into()))?;

    if !to_many && relationship.targets.len() > 1 {
        return Err(corrupted(format!(
            "to-one property '{}' received {} targets",
            property.name,
            relationship.targets.len()
        )));
    }

    let mut missing = Vec::new();
    for target in &relationship.targets {
        if !tx.contains(&relationship.to_type, target)? {
            missing.push(target.clone());
        }
    }
    if !missing.is_empty() {
        return Err(SyncError::PartiallyConnected {
            object_type: relationship.from_type.clone(),
            identifier: relationship.from_identifier.clone(),
            property: relationship.property.clone(),
            missing,
        });
    }

    let value = if to_many {
        FieldValue::ToMany(relationship.targets.clone())
    } else {
        FieldValue::ToOne(relationship.targets.first().cloned())
    };
    source.fields.insert(relationship.property.clone(), value);
    tx.put(source)
}
