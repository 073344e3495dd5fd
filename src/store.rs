//! SQLite-backed application document store.
//!
//! Applications are persisted as whole-document JSON snapshots; there are no
//! partial updates. Every read-modify-write goes through [`Store::in_tx`],
//! which runs `BEGIN IMMEDIATE` — SQLite transactions are serializable, which
//! is stronger than the repeatable-read floor the orchestrator needs, and a
//! single writer at a time means concurrent webhooks for the same app
//! serialize here.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::app::AppModel;
use crate::errors::StoreError;

/// Async-safe handle to the store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, preventing synchronous SQLite I/O from
/// tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl DbHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))?;
            f(&mut guard)
        })
        .await
        .context("store task panicked")?
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open SQLite database")?;
        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS apps (
                    id TEXT PRIMARY KEY,
                    display_id TEXT NOT NULL UNIQUE,
                    idx INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    doc TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_apps_status ON apps(status);
                ",
            )
            .context("failed to create tables")?;
        Ok(())
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction scoped to the closure.
    /// The transaction commits only if `f` returns `Ok`; any error rolls the
    /// whole read-modify-write back.
    pub fn in_tx<R>(&mut self, f: impl FnOnce(&TxScope<'_>) -> Result<R>) -> Result<R> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::Sqlite)?;
        let scope = TxScope { tx };
        let out = f(&scope)?;
        scope.tx.commit().map_err(StoreError::Sqlite)?;
        Ok(out)
    }

    /// All applications, in insertion order.
    pub fn find_all(&self) -> Result<Vec<AppModel>> {
        let mut stmt = self
            .conn
            .prepare("SELECT doc FROM apps ORDER BY idx")
            .map_err(StoreError::Sqlite)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(StoreError::Sqlite)?;

        let mut apps = Vec::new();
        for doc in rows {
            let doc = doc.map_err(StoreError::Sqlite)?;
            apps.push(serde_json::from_str(&doc).map_err(StoreError::CorruptDocument)?);
        }
        Ok(apps)
    }
}

/// Read/write access bound to one open transaction.
pub struct TxScope<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl TxScope<'_> {
    pub fn find_by_id(&self, id: &str) -> Result<AppModel> {
        let doc: Option<String> = self
            .tx
            .query_row("SELECT doc FROM apps WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(StoreError::Sqlite)?;
        let doc = doc.ok_or_else(|| StoreError::AppNotFound { id: id.to_string() })?;
        Ok(serde_json::from_str(&doc).map_err(StoreError::CorruptDocument)?)
    }

    pub fn find_by_display_id(&self, display_id: &str) -> Result<AppModel> {
        let doc: Option<String> = self
            .tx
            .query_row(
                "SELECT doc FROM apps WHERE display_id = ?1",
                params![display_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::Sqlite)?;
        let doc = doc.ok_or_else(|| StoreError::DisplayIdNotFound {
            display_id: display_id.to_string(),
        })?;
        Ok(serde_json::from_str(&doc).map_err(StoreError::CorruptDocument)?)
    }

    /// Persist a whole-document snapshot, replacing any previous one.
    pub fn save(&self, app: &AppModel) -> Result<()> {
        let doc = serde_json::to_string(app).map_err(StoreError::CorruptDocument)?;
        self.tx
            .execute(
                "INSERT INTO apps (id, display_id, idx, status, doc)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     display_id = excluded.display_id,
                     idx = excluded.idx,
                     status = excluded.status,
                     doc = excluded.doc",
                params![
                    app.id(),
                    app.display_id(),
                    app.core().index,
                    app.status_str(),
                    doc
                ],
            )
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    /// Total persisted applications. Feeds the next app's `index`.
    pub fn count_apps(&self) -> Result<i64> {
        let n = self
            .tx
            .query_row("SELECT COUNT(*) FROM apps", [], |row| row.get(0))
            .map_err(StoreError::Sqlite)?;
        Ok(n)
    }

    /// Applications still queued. Feeds the next app's `waiting_order`.
    pub fn count_waiting(&self) -> Result<i64> {
        let n = self
            .tx
            .query_row(
                "SELECT COUNT(*) FROM apps WHERE status = 'waiting'",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(n)
    }
}
