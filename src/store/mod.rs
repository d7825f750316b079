//! Offline-first note storage
//!
//! Notes are written to SQLite immediately and flagged as unsynced. The
//! sync loop later uploads them and flips the flag for the ones the server
//! acknowledged. Nothing here ever waits on the network except
//! [`NoteStore::upload_to_remote`].

mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::HiveApi;

/// Errors from the local note database
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),
}

/// A note recorded on this device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNote {
    /// Local id, unique and increasing
    pub id: i64,
    pub hive_id: i64,
    pub content: String,
    pub created_at_ms: i64,
    /// Flips to true once the server acknowledged the note, never back
    pub synced: bool,
}

impl LocalNote {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            hive_id: row.get(1)?,
            content: row.get(2)?,
            created_at_ms: row.get(3)?,
            synced: row.get::<_, i64>(4)? != 0,
        })
    }
}

/// Local note table plus the remote upload path
pub struct NoteStore {
    conn: Mutex<Connection>,
    api: Arc<dyn HiveApi>,
}

impl NoteStore {
    /// Open (or create) the database file at `path`
    pub fn open(path: &Path, api: Arc<dyn HiveApi>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        info!(?path, "note store opened");
        Self::with_connection(conn, api)
    }

    /// Database that lives only as long as the store
    #[cfg(test)]
    pub fn in_memory(api: Arc<dyn HiveApi>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, api)
    }

    fn with_connection(mut conn: Connection, api: Arc<dyn HiveApi>) -> Result<Self, StoreError> {
        schema::run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            api,
        })
    }

    /// Remote service the notes are uploaded to
    pub fn api(&self) -> &Arc<dyn HiveApi> {
        &self.api
    }

    /// Durably record a new, unsynced note
    pub fn create_log(&self, hive_id: i64, content: &str) -> Result<LocalNote, StoreError> {
        let created_at_ms = Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO notes (hive_id, content, created_at_ms, synced) VALUES (?1, ?2, ?3, 0)",
            params![hive_id, content, created_at_ms],
        )?;
        let id = conn.last_insert_rowid();

        debug!(id, hive_id, "note saved locally");
        Ok(LocalNote {
            id,
            hive_id,
            content: content.to_string(),
            created_at_ms,
            synced: false,
        })
    }

    /// All notes the server has not acknowledged yet
    pub fn get_unsynced_logs(&self) -> Result<Vec<LocalNote>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, hive_id, content, created_at_ms, synced FROM notes WHERE synced = 0 ORDER BY id",
        )?;
        let notes = stmt
            .query_map([], LocalNote::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    /// Mark exactly `ids` as synced, in one transaction
    ///
    /// Already-synced ids are left alone. Returns how many notes flipped.
    pub fn mark_synced(&self, ids: &[i64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut flipped = 0;
        {
            let mut stmt = tx.prepare("UPDATE notes SET synced = 1 WHERE id = ?1 AND synced = 0")?;
            for id in ids {
                flipped += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;

        debug!(requested = ids.len(), flipped, "notes marked synced");
        Ok(flipped)
    }

    #[cfg(test)]
    pub fn get_note(&self, id: i64) -> Result<Option<LocalNote>, StoreError> {
        let conn = self.conn.lock();
        let note = conn
            .query_row(
                "SELECT id, hive_id, content, created_at_ms, synced FROM notes WHERE id = ?1",
                params![id],
                LocalNote::from_row,
            )
            .optional()?;
        Ok(note)
    }

    pub fn count_unsynced(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM notes WHERE synced = 0", [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    /// Try to create `note` on the server
    ///
    /// True only when the server acknowledged it; every failure is logged
    /// and reported as false.
    pub async fn upload_to_remote(&self, note: &LocalNote) -> bool {
        match self.api.create_log(note.hive_id, &note.content).await {
            Ok(remote) => {
                debug!(
                    local_id = note.id,
                    remote_id = remote.map(|log| log.id),
                    "note uploaded"
                );
                true
            }
            Err(e) => {
                warn!(local_id = note.id, error = %e, "note upload failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FakeHiveApi;

    fn store() -> (NoteStore, Arc<FakeHiveApi>) {
        let api = Arc::new(FakeHiveApi::new());
        (NoteStore::in_memory(api.clone()).unwrap(), api)
    }

    #[test]
    fn test_create_log_is_unsynced_with_increasing_ids() {
        let (store, _) = store();
        let first = store.create_log(7, "the queen is healthy").unwrap();
        let second = store.create_log(3, "added a super").unwrap();

        assert!(!first.synced);
        assert!(second.id > first.id);
        assert_eq!(store.get_note(first.id).unwrap(), Some(first));
        assert_eq!(store.count_unsynced().unwrap(), 2);
    }

    #[test]
    fn test_mark_synced_only_given_ids() {
        let (store, _) = store();
        let a = store.create_log(1, "a").unwrap();
        let b = store.create_log(1, "b").unwrap();

        assert_eq!(store.mark_synced(&[a.id]).unwrap(), 1);

        let unsynced = store.get_unsynced_logs().unwrap();
        assert_eq!(unsynced, vec![b]);
        assert!(store.get_note(a.id).unwrap().unwrap().synced);
    }

    #[test]
    fn test_mark_synced_is_idempotent() {
        let (store, _) = store();
        let note = store.create_log(9, "varroa check").unwrap();

        tokio_test::assert_ok!(store.mark_synced(&[note.id]));
        assert_eq!(store.mark_synced(&[note.id]).unwrap(), 0);
        assert!(store.get_note(note.id).unwrap().unwrap().synced);
        assert_eq!(store.count_unsynced().unwrap(), 0);
    }

    #[test]
    fn test_mark_synced_ignores_unknown_ids() {
        let (store, _) = store();
        assert_eq!(store.mark_synced(&[]).unwrap(), 0);
        assert_eq!(store.mark_synced(&[42]).unwrap(), 0);
    }

    #[test]
    fn test_notes_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes").join("beekeeper.db");
        let api = Arc::new(FakeHiveApi::new());

        let id = {
            let store = NoteStore::open(&path, api.clone()).unwrap();
            store.create_log(4, "honey flow started").unwrap().id
        };

        let reopened = NoteStore::open(&path, api).unwrap();
        let note = reopened.get_note(id).unwrap().unwrap();
        assert_eq!(note.content, "honey flow started");
        assert!(!note.synced);
    }

    #[tokio::test]
    async fn test_upload_reports_success_and_failure() {
        let (store, api) = store();
        let good = store.create_log(1, "fine").unwrap();
        let bad = store.create_log(1, "rejected").unwrap();
        api.reject("rejected");

        assert!(store.upload_to_remote(&good).await);
        assert!(!store.upload_to_remote(&bad).await);

        api.go_offline();
        assert!(!store.upload_to_remote(&good).await);
        assert_eq!(api.created.lock().len(), 1);
    }
}
