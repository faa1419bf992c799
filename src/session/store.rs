//! Persistent keyed store backing the session actors.
//!
//! Each session is saved as one JSON snapshot row, keyed by id. `SessionStore`
//! wraps the SQLite connection behind `Arc<Mutex<_>>` and runs all access on
//! tokio's blocking thread pool via `spawn_blocking`, preventing synchronous
//! SQLite I/O from tying up async worker threads.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::state::SessionState;

#[derive(Debug)]
pub struct SessionDb {
    conn: Connection,
}

impl SessionDb {
    /// Open (or create) the session database at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open session database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// In-memory database for testing.
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory session database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    version INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );
                ",
            )
            .context("Failed to run session store migrations")?;
        Ok(())
    }

    /// Upsert the full snapshot for a session.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        let json = serde_json::to_string(state).context("Failed to serialize session state")?;
        self.conn
            .execute(
                "INSERT INTO sessions (id, state, version, updated_at)
                 VALUES (?1, ?2, ?3, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET
                     state = excluded.state,
                     version = excluded.version,
                     updated_at = datetime('now')",
                params![state.id, json, state.version as i64],
            )
            .context("Failed to save session snapshot")?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Option<SessionState>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query session snapshot")?;

        match json {
            Some(json) => {
                let state = serde_json::from_str(&json)
                    .context("Failed to deserialize session snapshot")?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub fn list_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM sessions ORDER BY updated_at DESC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context("Failed to list session ids")?;
        Ok(ids)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .context("Failed to delete session")?;
        Ok(n > 0)
    }
}

/// Async-safe, cloneable handle to the session database.
#[derive(Clone, Debug)]
pub struct SessionStore {
    inner: Arc<std::sync::Mutex<SessionDb>>,
}

impl SessionStore {
    pub fn new(db: SessionDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        Ok(Self::new(SessionDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(SessionDb::new_in_memory()?))
    }

    /// Run a closure against the database on a blocking thread. All data
    /// passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SessionDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("Session store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Session store task panicked")?
    }

    pub async fn save(&self, state: SessionState) -> Result<()> {
        self.call(move |db| db.save(&state)).await
    }

    pub async fn load(&self, id: &str) -> Result<Option<SessionState>> {
        let id = id.to_string();
        self.call(move |db| db.load(&id)).await
    }

    pub async fn list_ids(&self) -> Result<Vec<String>> {
        self.call(|db| db.list_ids()).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.call(move |db| db.delete(&id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::{DevState, GeneratedFile};

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let store = SessionStore::in_memory().unwrap();
        let mut state = SessionState::new("s1", "a todo app");
        state.dev_state = DevState::BlueprintReady;
        state.version = 3;
        state.record_file(GeneratedFile::new("src/app.ts", "export {}", "entry"));

        store.save(state.clone()).await.unwrap();
        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "s1");
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.dev_state, DevState::BlueprintReady);
        assert_eq!(loaded.files["src/app.ts"].contents, "export {}");
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let store = SessionStore::in_memory().unwrap();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_existing_snapshot() {
        let store = SessionStore::in_memory().unwrap();
        let mut state = SessionState::new("s1", "q");
        store.save(state.clone()).await.unwrap();

        state.version = 7;
        state.preview_url = Some("https://preview".into());
        store.save(state).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.preview_url.as_deref(), Some("https://preview"));

        let ids = store.list_ids().await.unwrap();
        assert_eq!(ids, vec!["s1".to_string()]);
    }

    #[test]
    fn test_file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let db = SessionDb::new(&path).unwrap();
            db.save(&SessionState::new("s1", "q")).unwrap();
        }
        let db = SessionDb::new(&path).unwrap();
        assert!(db.load("s1").unwrap().is_some());
        assert!(db.delete("s1").unwrap());
        assert!(!db.delete("s1").unwrap());
    }
}
