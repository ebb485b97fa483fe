//! Synced-entity ledger.
//!
//! One row per `(object_type, identifier)` recording what still has to be
//! pushed. Rows are tombstoned on acknowledged deletion and only physically
//! removed by [`Ledger::reap`].

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DatabaseError, Result, SyncError};
use crate::storage::metadata::{decode_time, encode_time, with_savepoint};

/// Sync status of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    New,
    Changed,
    Deleted,
    Synced,
}

impl ChangeState {
    pub const ALL: [ChangeState; 4] = [
        ChangeState::New,
        ChangeState::Changed,
        ChangeState::Deleted,
        ChangeState::Synced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeState::New => "new",
            ChangeState::Changed => "changed",
            ChangeState::Deleted => "deleted",
            ChangeState::Synced => "synced",
        }
    }

    /// State after a local create or update.
    ///
    /// A write over an unpushed deletion cancels it: the object was re-created
    /// and goes out as `Changed`. An acknowledged tombstone is revived as `New`.
    pub fn after_local_write(current: Option<&SyncedEntity>) -> ChangeState {
        match current {
            None => ChangeState::New,
            Some(entity) if entity.is_deleted => ChangeState::New,
            Some(_) => ChangeState::Changed,
        }
    }

    /// State after a local soft-delete, `None` when already tombstoned.
    pub fn after_local_delete(current: Option<&SyncedEntity>) -> Option<ChangeState> {
        match current {
            Some(entity) if entity.is_deleted => None,
            _ => Some(ChangeState::Deleted),
        }
    }

    /// Whether the entry has work for the next push.
    pub fn is_outbound(&self) -> bool {
        !matches!(self, ChangeState::Synced)
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "new" => Ok(ChangeState::New),
            "changed" => Ok(ChangeState::Changed),
            "deleted" => Ok(ChangeState::Deleted),
            "synced" => Ok(ChangeState::Synced),
            other => Err(format!("unknown change state '{other}'")),
        }
    }
}

/// Identity of a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub object_type: String,
    pub identifier: String,
}

impl EntityKey {
    pub fn new(object_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.object_type, self.identifier)
    }
}

/// A ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedEntity {
    pub object_type: String,
    pub identifier: String,
    pub change_state: ChangeState,
    pub modified_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl SyncedEntity {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.object_type, &self.identifier)
    }
}

/// Entry counts per state. Tombstones are counted separately from `synced`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCounts {
    pub new: u64,
    pub changed: u64,
    pub deleted: u64,
    pub synced: u64,
    pub tombstones: u64,
}

impl LedgerCounts {
    pub fn pending(&self) -> u64 {
        self.new + self.changed + self.deleted
    }
}

type EntityRow = (String, String, String, String, bool);

const SELECT_ENTITY: &str =
    "SELECT object_type, identifier, change_state, modified_at, is_deleted FROM synced_entities";

/// Ledger operations over a metadata connection.
pub struct Ledger<'a> {
    conn: &'a Connection,
}

impl<'a> Ledger<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRow> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn decode((object_type, identifier, state, modified_at, is_deleted): EntityRow) -> Result<SyncedEntity> {
        let change_state = state
            .parse::<ChangeState>()
            .map_err(|e| SyncError::Database(DatabaseError::QueryFailed(e)))?;
        Ok(SyncedEntity {
            object_type,
            identifier,
            change_state,
            modified_at: decode_time(&modified_at)?,
            is_deleted,
        })
    }

    /// Look up one entry.
    pub fn entity(&self, object_type: &str, identifier: &str) -> Result<Option<SyncedEntity>> {
        let row = self
            .conn
            .query_row(
                &format!("{SELECT_ENTITY} WHERE object_type = ?1 AND identifier = ?2"),
                params![object_type, identifier],
                Self::row,
            )
            .optional()?;
        row.map(Self::decode).transpose()
    }

    /// Insert or move an entry to `state`.
    ///
    /// Always clears the tombstone flag; tombstones are set only by
    /// [`Ledger::mark_deleted`].
    pub fn upsert(&self, object_type: &str, identifier: &str, state: ChangeState) -> Result<SyncedEntity> {
        with_savepoint(self.conn, "ledger_upsert", || {
            let previous = self.entity(object_type, identifier)?;
            let modified_at = next_modified(previous.as_ref().map(|e| e.modified_at));
            let is_deleted = false;
            self.conn.execute(
                "INSERT INTO synced_entities (object_type, identifier, change_state, modified_at, is_deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(object_type, identifier) DO UPDATE SET
                    change_state = excluded.change_state,
                    modified_at = excluded.modified_at,
                    is_deleted = excluded.is_deleted",
                params![object_type, identifier, state.as_str(), encode_time(modified_at), is_deleted],
            )?;
            Ok(SyncedEntity {
                object_type: object_type.to_string(),
                identifier: identifier.to_string(),
                change_state: state,
                modified_at,
                is_deleted,
            })
        })
    }

    /// Entries whose state is one of `states`, oldest modification first.
    pub fn entities_in(&self, states: &[ChangeState]) -> Result<Vec<SyncedEntity>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_ENTITY} WHERE change_state = ?1"))?;
        let mut entities = Vec::new();
        for state in states {
            let rows = stmt.query_map(params![state.as_str()], Self::row)?;
            for row in rows {
                entities.push(Self::decode(row?)?);
            }
        }
        entities.sort_by(|a, b| {
            a.modified_at
                .cmp(&b.modified_at)
                .then_with(|| a.object_type.cmp(&b.object_type))
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        Ok(entities)
    }

    /// Every entry, ordered by identity.
    pub fn all(&self) -> Result<Vec<SyncedEntity>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_ENTITY} ORDER BY object_type, identifier"))?;
        let rows = stmt.query_map([], Self::row)?;
        let mut entities = Vec::new();
        for row in rows {
            entities.push(Self::decode(row?)?);
        }
        Ok(entities)
    }

    /// Acknowledge pushed modifications. Unknown keys are ignored.
    pub fn mark_synced(&self, keys: &[EntityKey]) -> Result<usize> {
        self.acknowledge(keys, false)
    }

    /// Acknowledge pushed deletions: `synced` plus tombstone.
    pub fn mark_deleted(&self, keys: &[EntityKey]) -> Result<usize> {
        self.acknowledge(keys, true)
    }

    fn acknowledge(&self, keys: &[EntityKey], tombstone: bool) -> Result<usize> {
        with_savepoint(self.conn, "ledger_ack", || {
            let mut updated = 0;
            for key in keys {
                let Some(previous) = self.entity(&key.object_type, &key.identifier)? else {
                    continue;
                };
                // A save acknowledgement must not swallow a deletion recorded since.
                if !tombstone && previous.change_state == ChangeState::Deleted {
                    continue;
                }
                let modified_at = next_modified(Some(previous.modified_at));
                updated += self.conn.execute(
                    "UPDATE synced_entities
                     SET change_state = ?3, modified_at = ?4, is_deleted = ?5
                     WHERE object_type = ?1 AND identifier = ?2",
                    params![
                        key.object_type,
                        key.identifier,
                        ChangeState::Synced.as_str(),
                        encode_time(modified_at),
                        tombstone || previous.is_deleted,
                    ],
                )?;
            }
            Ok(updated)
        })
    }

    /// Physically remove acknowledged tombstones last touched before `before`.
    pub fn reap(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM synced_entities
             WHERE is_deleted = 1 AND change_state = ?1 AND modified_at < ?2",
            params![ChangeState::Synced.as_str(), encode_time(before)],
        )?;
        Ok(removed)
    }

    pub fn counts(&self) -> Result<LedgerCounts> {
        let mut stmt = self.conn.prepare(
            "SELECT change_state, is_deleted, COUNT(*) FROM synced_entities
             GROUP BY change_state, is_deleted",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut counts = LedgerCounts::default();
        for row in rows {
            let (state, is_deleted, count) = row?;
            let count = count as u64;
            match (state.parse::<ChangeState>(), is_deleted) {
                (Ok(ChangeState::Synced), true) => counts.tombstones += count,
                (Ok(ChangeState::Synced), false) => counts.synced += count,
                (Ok(ChangeState::New), _) => counts.new += count,
                (Ok(ChangeState::Changed), _) => counts.changed += count,
                (Ok(ChangeState::Deleted), _) => counts.deleted += count,
                (Err(e), _) => return Err(SyncError::Database(DatabaseError::QueryFailed(e))),
            }
        }
        Ok(counts)
    }
}

/// Modification time that never moves backwards for an entry.
fn next_modified(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(previous) if previous > now => previous,
        _ => now,
    }
}
