//! SQLite store for sync metadata.
//!
//! Holds the synced-entity ledger, the pending relationship queue and the
//! per-zone change tokens. It is independent from the local object store so
//! that a failed domain write never corrupts ledger state.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use super::{data_dir, migrations, METADATA_DB_FILE};
use crate::error::{DatabaseError, Result, SyncError};
use crate::record::ZoneId;
use crate::sync::ledger::Ledger;
use crate::sync::pending::PendingQueue;
use crate::sync::remote::ChangeToken;

/// Sync metadata database.
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Open (and migrate) the metadata database at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn)
    }

    /// Open the database at `<data_dir>/metadata.db`.
    pub fn open_default() -> Result<Self> {
        let path = data_dir()?.join(METADATA_DB_FILE);
        Self::open(&path)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrations::migrate(&conn)
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying SQLite connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn ledger(&self) -> Ledger<'_> {
        Ledger::new(&self.conn)
    }

    pub fn pending(&self) -> PendingQueue<'_> {
        PendingQueue::new(&self.conn)
    }

    /// Run `f` inside one transaction: committed on `Ok`, rolled back on `Err`.
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Last change token received for `zone`.
    pub fn change_token(&self, zone: &ZoneId) -> Result<Option<ChangeToken>> {
        load_change_token(&self.conn, zone)
    }
}

fn token_key(zone: &ZoneId) -> String {
    format!("change_token:{}", zone.name())
}

pub(crate) fn load_change_token(conn: &Connection, zone: &ZoneId) -> Result<Option<ChangeToken>> {
    let value = conn
        .query_row(
            "SELECT value FROM sync_kv WHERE key = ?1",
            params![token_key(zone)],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value.map(ChangeToken))
}

pub(crate) fn save_change_token(conn: &Connection, zone: &ZoneId, token: &ChangeToken) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![token_key(zone), token.0],
    )?;
    Ok(())
}

/// Run `f` under a named savepoint. Nests inside an open transaction.
pub(crate) fn with_savepoint<T, F>(conn: &Connection, name: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;
    match f() {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}")) {
                tracing::warn!(savepoint = name, error = %rollback, "savepoint rollback failed");
            }
            Err(e)
        }
    }
}

/// Fixed-width timestamp encoding so SQL string comparison orders correctly.
pub(crate) fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::Database(DatabaseError::QueryFailed(format!("bad timestamp '{raw}': {e}"))))
}
