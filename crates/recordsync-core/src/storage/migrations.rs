//! Schema migrations for the sync metadata database.
//!
//! Migrations are versioned and applied automatically when the store is opened.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const SCHEMA_VERSION: i32 = 2;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Current schema version, 0 for a fresh database.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    match conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    }) {
        Ok(version) => Ok(version),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: synced-entity ledger and key-value table for change tokens.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS synced_entities (
            object_type  TEXT NOT NULL,
            identifier   TEXT NOT NULL,
            change_state TEXT NOT NULL,
            modified_at  TEXT NOT NULL,
            is_deleted   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (object_type, identifier)
        );

        CREATE INDEX IF NOT EXISTS idx_synced_entities_state ON synced_entities(change_state);

        CREATE TABLE IF NOT EXISTS sync_kv (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    set_schema_version(&tx, 1)?;
    tx.commit()
}

/// Migration v2: pending relationship queue.
///
/// `seq` orders entries by (re)enqueue time; `targets` is a JSON array of
/// identifiers.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS pending_relationships (
            key             TEXT PRIMARY KEY,
            seq             INTEGER NOT NULL,
            from_type       TEXT NOT NULL,
            from_identifier TEXT NOT NULL,
            property        TEXT NOT NULL,
            to_type         TEXT NOT NULL,
            targets         TEXT NOT NULL,
            is_applied      INTEGER NOT NULL DEFAULT 0,
            enqueued_at     TEXT NOT NULL,
            applied_at      TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_pending_relationships_applied
            ON pending_relationships(is_applied, seq);",
    )?;

    set_schema_version(&tx, 2)?;
    tx.commit()
}
