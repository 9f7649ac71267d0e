//! Snapshots and operation logs for rebuilding a backend after a failure.
//!
//! Layout under the recovery directory, one subdirectory per backend:
//!
//! ```text
//! {dir}/{store}/snapshot.json      latest snapshot
//! {dir}/{store}/operations.jsonl   append-only operation log
//! ```
//!
//! Every logged operation carries a sequence number. A snapshot records the
//! sequence of the first operation logged after it, so recovery restores the
//! snapshot and replays only what came later.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_types::{MemoryItem, Metadata, Timestamp, new_id, now};
use tracing::{debug, info, warn};

use crate::backend::MemoryStore;
use crate::error::{MemoryError, Result};
use crate::validation::ValidationError;

const SNAPSHOT_FILE: &str = "snapshot.json";
const LOG_FILE: &str = "operations.jsonl";

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Full copy of one backend at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub snapshot_id: String,
    pub store: String,
    pub created_at: Timestamp,
    #[serde(default)]
    pub metadata: Metadata,
    pub items: Vec<MemoryItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<serde_json::Value>,
    /// Sequence of the first operation logged after the capture.
    pub log_position: u64,
}

impl MemorySnapshot {
    /// Copy every item and the auxiliary state of `store`.
    pub async fn capture(name: &str, store: &dyn MemoryStore, log_position: u64) -> Result<Self> {
        let items = store.all_items().await?;
        let auxiliary = store.auxiliary_state().await?;
        Ok(Self {
            snapshot_id: new_id(),
            store: name.to_string(),
            created_at: now(),
            metadata: Metadata::new(),
            items,
            auxiliary,
            log_position,
        })
    }

    pub fn get_item(&self, id: &str) -> Option<&MemoryItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Write to `path` through a temporary file so a crash never leaves a
    /// truncated snapshot behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(self)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|err| {
            MemoryError::Recovery(format!("unreadable snapshot {}: {err}", path.display()))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operation log
// ─────────────────────────────────────────────────────────────────────────────

/// A write that reached a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LoggedOperation {
    Store { item: MemoryItem },
    Update { id: String, item: MemoryItem },
    Delete { id: String },
}

impl LoggedOperation {
    async fn apply(&self, store: &dyn MemoryStore) -> Result<()> {
        match self {
            LoggedOperation::Store { item } => {
                store.store(item.clone()).await?;
            }
            LoggedOperation::Update { id, item } => {
                store.update(id, item.clone()).await?;
            }
            LoggedOperation::Delete { id } => {
                store.delete(id).await?;
            }
        }
        Ok(())
    }
}

/// One line of `operations.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEntry {
    pub sequence: u64,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub operation: LoggedOperation,
}

/// Outcome of [`RecoveryManager::recover_store`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub store: String,
    pub snapshot_id: String,
    /// Items written back from the snapshot.
    pub restored: usize,
    /// Items present in the backend but absent from the snapshot.
    pub removed: usize,
    /// Logged operations applied after the snapshot.
    pub replayed: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery manager
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the recovery directory: takes snapshots, appends to operation logs
/// and rebuilds backends from them.
#[derive(Debug)]
pub struct RecoveryManager {
    dir: PathBuf,
    /// Next sequence per store, read from disk on first use.
    sequences: Mutex<HashMap<String, u64>>,
}

impl RecoveryManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            sequences: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `operation` to the log of `store`. Returns its sequence.
    pub fn log_operation(&self, store: &str, operation: LoggedOperation) -> Result<u64> {
        let path = self.store_dir(store)?.join(LOG_FILE);
        let mut sequences = self.sequences.lock();
        let sequence = self.next_sequence(store, &sequences)?;

        let entry = LoggedEntry {
            sequence,
            timestamp: now(),
            operation,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_all()?;

        sequences.insert(store.to_string(), sequence + 1);
        Ok(sequence)
    }

    /// Every logged operation of `store`, oldest first.
    pub fn operations(&self, store: &str) -> Result<Vec<LoggedEntry>> {
        let path = self.store_dir(store)?.join(LOG_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(&path)?);
        let mut entries = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|err| {
                MemoryError::Recovery(format!(
                    "unreadable entry at {}:{}: {err}",
                    path.display(),
                    number + 1
                ))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Capture `store` and make the result its latest snapshot.
    ///
    /// Writes that land while the capture runs are replayed again on
    /// recovery; callers that need an exact cut hold off writers first.
    pub async fn create_snapshot(&self, name: &str, store: &dyn MemoryStore) -> Result<MemorySnapshot> {
        let path = self.store_dir(name)?.join(SNAPSHOT_FILE);
        let position = {
            let sequences = self.sequences.lock();
            self.next_sequence(name, &sequences)?
        };

        let snapshot = MemorySnapshot::capture(name, store, position).await?;
        snapshot.save(&path)?;
        info!(
            store = %name,
            snapshot_id = %snapshot.snapshot_id,
            items = snapshot.len(),
            log_position = position,
            "Created snapshot"
        );
        Ok(snapshot)
    }

    /// The snapshot on disk for `store`, if any.
    pub fn latest_snapshot(&self, name: &str) -> Result<Option<MemorySnapshot>> {
        let path = self.store_dir(name)?.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        MemorySnapshot::load(&path).map(Some)
    }

    /// Make `store` hold exactly the snapshot's items and auxiliary state.
    /// Returns `(restored, removed)`.
    pub async fn restore_from_snapshot(
        &self,
        store: &dyn MemoryStore,
        snapshot: &MemorySnapshot,
    ) -> Result<(usize, usize)> {
        let mut removed = 0;
        for id in store.list_keys().await? {
            if snapshot.get_item(&id).is_none() && store.delete(&id).await? {
                removed += 1;
            }
        }
        for item in &snapshot.items {
            store.store(item.clone()).await?;
        }
        if let Some(state) = &snapshot.auxiliary {
            store.restore_auxiliary_state(state.clone()).await?;
        }

        debug!(
            store = %snapshot.store,
            snapshot_id = %snapshot.snapshot_id,
            restored = snapshot.len(),
            removed,
            "Restored snapshot"
        );
        Ok((snapshot.len(), removed))
    }

    /// Restore the latest snapshot of `name` into `store`, then replay every
    /// operation logged after it.
    pub async fn recover_store(&self, name: &str, store: &dyn MemoryStore) -> Result<RecoveryReport> {
        let snapshot = self
            .latest_snapshot(name)?
            .ok_or_else(|| MemoryError::Recovery(format!("no snapshot for '{name}'")))?;

        let (restored, removed) = self.restore_from_snapshot(store, &snapshot).await?;

        let mut replayed = 0;
        for entry in self.operations(name)? {
            if entry.sequence < snapshot.log_position {
                continue;
            }
            entry.operation.apply(store).await.map_err(|err| {
                MemoryError::Recovery(format!(
                    "replay of operation {} on '{name}' failed: {err}",
                    entry.sequence
                ))
            })?;
            replayed += 1;
        }

        info!(store = %name, restored, removed, replayed, "Recovered store");
        Ok(RecoveryReport {
            store: name.to_string(),
            snapshot_id: snapshot.snapshot_id,
            restored,
            removed,
            replayed,
        })
    }

    /// Snapshot `store`, run `f`, and put the snapshot back if `f` fails.
    ///
    /// The error from `f` is returned either way. After a rollback a fresh
    /// snapshot is taken so the undone operations are never replayed.
    pub async fn run_with_recovery<T, F, Fut>(&self, name: &str, store: &dyn MemoryStore, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let snapshot = self.create_snapshot(name, store).await?;
        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        warn!(store = %name, error = %err, "Operation failed, restoring snapshot");
        match self.restore_from_snapshot(store, &snapshot).await {
            Ok(_) => {
                if let Err(snap_err) = self.create_snapshot(name, store).await {
                    warn!(store = %name, error = %snap_err, "Re-snapshot after rollback failed");
                }
            }
            Err(restore_err) => {
                warn!(store = %name, error = %restore_err, "Snapshot restore failed");
            }
        }
        Err(err)
    }

    fn next_sequence(&self, store: &str, sequences: &HashMap<String, u64>) -> Result<u64> {
        if let Some(next) = sequences.get(store) {
            return Ok(*next);
        }
        Ok(self
            .operations(store)?
            .last()
            .map_or(0, |entry| entry.sequence + 1))
    }

    fn store_dir(&self, store: &str) -> Result<PathBuf> {
        let unsafe_name = store.is_empty()
            || store == "."
            || store == ".."
            || store.contains(['/', '\\', '\0']);
        if unsafe_name {
            return Err(ValidationError::InvalidArgument(format!(
                "'{store}' cannot name a recovery directory"
            ))
            .into());
        }
        Ok(self.dir.join(store))
    }
}
