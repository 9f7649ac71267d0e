//! SQLite-backed persistent store with native transactions.
//!
//! rusqlite is synchronous, so every statement runs on the blocking pool and
//! the caller's deadline can still fire while SQLite is busy.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};
use strata_types::{MemoryItem, Metadata, SearchHit};
use tracing::{debug, info, warn};

use super::rank_text_matches;
use crate::backend::{Capabilities, MemoryStore, TransactionalStore, apply_update};
use crate::error::{MemoryError, Result};
use crate::validation::{validate_item, validate_update};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

const SELECT_COLUMNS: &str =
    "SELECT id, content, memory_type, metadata, created_at, updated_at FROM memory_items";

/// Memory store backed by a single SQLite connection.
///
/// Timestamps are stored as RFC 3339 with nanosecond precision so a stored
/// item reads back with an identical version.
pub struct SqliteStore {
    shared: Arc<Shared>,
}

/// State moved onto blocking threads. Lock order is `conn`, then `active`.
struct Shared {
    name: String,
    conn: Mutex<Connection>,
    active: Mutex<Option<String>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("name", &self.shared.name)
            .field("active", &*self.shared.active.lock())
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a database file at `path`.
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let name = name.into();
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                MemoryError::storage(&name, format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|e| db_error(&name, e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| db_error(&name, e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| db_error(&name, e))?;

        let store = Self::with_connection(name, conn)?;
        info!(backend = %store.shared.name, path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    /// Create a store that lives only as long as this value.
    pub fn open_in_memory(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let conn = Connection::open_in_memory().map_err(|e| db_error(&name, e))?;
        let store = Self::with_connection(name, conn)?;
        debug!(backend = %store.shared.name, "In-memory SQLite store created");
        Ok(store)
    }

    fn with_connection(name: String, conn: Connection) -> Result<Self> {
        let shared = Shared {
            name,
            conn: Mutex::new(conn),
            active: Mutex::new(None),
        };
        shared.create_schema()?;
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Run `f` with the connection locked, on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Shared, &Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || {
            let conn = shared.conn.lock();
            f(&shared, &conn)
        })
        .await
        .map_err(|e| MemoryError::storage(&self.shared.name, format!("task join error: {e}")))?
    }
}

impl Shared {
    fn create_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current_version >= SCHEMA_VERSION {
            debug!(backend = %self.name, version = current_version, "Schema up to date");
            return Ok(());
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memory_items (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                memory_type TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memory_items_type ON memory_items(memory_type);
            "#,
        )
        .map_err(|e| self.db_error(e))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| self.db_error(e))?;

        info!(backend = %self.name, version = SCHEMA_VERSION, "Schema created");
        Ok(())
    }

    fn db_error(&self, error: rusqlite::Error) -> MemoryError {
        db_error(&self.name, error)
    }

    fn upsert(&self, conn: &Connection, item: &MemoryItem) -> Result<()> {
        let metadata = serde_json::to_string(&item.metadata)?;
        conn.execute(
            r#"
            INSERT INTO memory_items (id, content, memory_type, metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                memory_type = excluded.memory_type,
                metadata = excluded.metadata,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
            params![
                item.id,
                item.content,
                item.memory_type.as_str(),
                metadata,
                format_timestamp(&item.created_at),
                format_timestamp(&item.updated_at),
            ],
        )
        .map_err(|e| self.db_error(e))?;
        Ok(())
    }

    fn select_one(&self, conn: &Connection, id: &str) -> Result<Option<MemoryItem>> {
        let row = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                RawRow::from_row,
            )
            .optional()
            .map_err(|e| self.db_error(e))?;
        row.map(|raw| raw.decode(&self.name)).transpose()
    }

    fn select_all(&self, conn: &Connection) -> Result<Vec<MemoryItem>> {
        let mut stmt = conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY id"))
            .map_err(|e| self.db_error(e))?;
        let rows = stmt
            .query_map([], RawRow::from_row)
            .map_err(|e| self.db_error(e))?;

        let mut items = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| self.db_error(e))?;
            items.push(raw.decode(&self.name)?);
        }
        Ok(items)
    }

    fn check_transaction(&self, transaction_id: &str, operation: &str) -> Result<()> {
        match self.active.lock().as_deref() {
            Some(active) if active == transaction_id => Ok(()),
            other => Err(MemoryError::InvalidTransactionState {
                transaction_id: transaction_id.to_string(),
                state: match other {
                    Some(active) => format!("not open (active: {active})"),
                    None => "not open".to_string(),
                },
                operation: operation.to_string(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row Decoding
// ─────────────────────────────────────────────────────────────────────────────

struct RawRow {
    id: String,
    content: String,
    memory_type: String,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            memory_type: row.get(2)?,
            metadata: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    /// Rows that cannot be decoded are corrupt, not transiently unavailable.
    fn decode(self, backend: &str) -> Result<MemoryItem> {
        let corrupt = |what: &str, detail: String| {
            MemoryError::corruption(backend, format!("row '{}': bad {what}: {detail}", self.id))
        };
        let memory_type = self
            .memory_type
            .parse()
            .map_err(|e: strata_types::TypeError| corrupt("memory_type", e.to_string()))?;
        let metadata: Metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| corrupt("metadata", e.to_string()))?;
        let created_at =
            parse_timestamp(&self.created_at).map_err(|e| corrupt("created_at", e))?;
        let updated_at =
            parse_timestamp(&self.updated_at).map_err(|e| corrupt("updated_at", e))?;

        Ok(MemoryItem {
            id: self.id,
            content: self.content,
            memory_type,
            metadata,
            created_at,
            updated_at,
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

fn db_error(backend: &str, error: rusqlite::Error) -> MemoryError {
    match &error {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase
            ) =>
        {
            warn!(backend, error = %error, "SQLite reports corruption");
            MemoryError::corruption(backend, error)
        }
        rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
            MemoryError::corruption(backend, error)
        }
        _ => MemoryError::storage(backend, error),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Contract
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl MemoryStore for SqliteStore {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional: true,
            ..Capabilities::BASIC
        }
    }

    async fn store(&self, mut item: MemoryItem) -> Result<String> {
        validate_item(&item)?;
        let id = item.ensure_id().to_string();
        self.blocking(move |shared, conn| {
            shared.upsert(conn, &item)?;
            debug!(backend = %shared.name, item_id = %item.id, "Stored row");
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn retrieve(&self, id: &str) -> Result<Option<MemoryItem>> {
        let id = id.to_string();
        self.blocking(move |shared, conn| shared.select_one(conn, &id))
            .await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let items = self
            .blocking(|shared, conn| shared.select_all(conn))
            .await?;
        Ok(rank_text_matches(&self.shared.name, query, &items, limit))
    }

    async fn update(&self, id: &str, item: MemoryItem) -> Result<bool> {
        validate_update(id, &item)?;
        let id = id.to_string();
        self.blocking(move |shared, conn| {
            let Some(previous) = shared.select_one(conn, &id)? else {
                return Ok(false);
            };
            shared.upsert(conn, &apply_update(&previous, item))?;
            Ok(true)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |shared, conn| {
            let removed = conn
                .execute("DELETE FROM memory_items WHERE id = ?1", params![id])
                .map_err(|e| shared.db_error(e))?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.blocking(|shared, conn| {
            let mut stmt = conn
                .prepare("SELECT id FROM memory_items ORDER BY id")
                .map_err(|e| shared.db_error(e))?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| shared.db_error(e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| shared.db_error(e))?;
            Ok(keys)
        })
        .await
    }

    async fn all_items(&self) -> Result<Vec<MemoryItem>> {
        self.blocking(|shared, conn| shared.select_all(conn)).await
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalStore> {
        Some(self)
    }
}

#[async_trait]
impl TransactionalStore for SqliteStore {
    async fn begin(&self, transaction_id: &str) -> Result<()> {
        let transaction_id = transaction_id.to_string();
        self.blocking(move |shared, conn| {
            let mut active = shared.active.lock();
            if let Some(open) = active.as_deref() {
                return Err(MemoryError::InvalidTransactionState {
                    transaction_id,
                    state: format!("blocked by open transaction {open}"),
                    operation: "begin".to_string(),
                });
            }
            conn.execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| shared.db_error(e))?;
            debug!(backend = %shared.name, transaction_id = %transaction_id, "SQLite transaction started");
            *active = Some(transaction_id);
            Ok(())
        })
        .await
    }

    async fn commit(&self, transaction_id: &str) -> Result<()> {
        let transaction_id = transaction_id.to_string();
        self.blocking(move |shared, conn| {
            shared.check_transaction(&transaction_id, "commit")?;
            conn.execute_batch("COMMIT").map_err(|e| shared.db_error(e))?;
            *shared.active.lock() = None;
            debug!(backend = %shared.name, transaction_id = %transaction_id, "SQLite transaction committed");
            Ok(())
        })
        .await
    }

    async fn rollback(&self, transaction_id: &str) -> Result<()> {
        let transaction_id = transaction_id.to_string();
        self.blocking(move |shared, conn| {
            shared.check_transaction(&transaction_id, "rollback")?;
            let result = conn.execute_batch("ROLLBACK");
            *shared.active.lock() = None;
            result.map_err(|e| shared.db_error(e))?;
            info!(backend = %shared.name, transaction_id = %transaction_id, "SQLite transaction rolled back");
            Ok(())
        })
        .await
    }

    fn active_transaction(&self) -> Option<String> {
        self.shared.active.lock().clone()
    }
}
