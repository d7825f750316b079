//! Note table schema and migrations
//!
//! Versions are tracked with `PRAGMA user_version`; each migration runs in
//! its own transaction and bumps the version on success.

use rusqlite::Connection;
use tracing::info;

use super::StoreError;

/// Ordered list of migrations; index + 1 is the schema version it produces
const MIGRATIONS: &[&str] = &[
    // v1: offline-first note table
    r#"
    CREATE TABLE IF NOT EXISTS notes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hive_id INTEGER NOT NULL,
        content TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_notes_synced ON notes(synced);
    "#,
];

/// Current schema version of the database
pub fn schema_version(conn: &Connection) -> Result<u32, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring the database up to the latest schema
pub fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let current = schema_version(conn)? as usize;

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        let version = index + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .map_err(|e| StoreError::Migration(format!("v{}: {}", version, e)))?;
        tx.pragma_update(None, "user_version", version as u32)?;
        tx.commit()?;
        info!(version, "applied note store migration");
    }

    Ok(())
}
