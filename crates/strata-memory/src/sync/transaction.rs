//! Cross-store transactions over heterogeneous backends.
//!
//! ```text
//! INIT -> SNAPSHOT_TAKEN -> APPLYING -> COMMITTED
//!                                   \-> ROLLED_BACK
//! ```
//!
//! Backends with native transactions get `begin`/`commit`/`rollback`. The
//! others get a full snapshot before the first operation and are restored
//! from it on rollback. When more than one native backend participates, each
//! also gets a compensation snapshot so that a commit failure after an
//! earlier native commit can still be undone.
//!
//! Participants' gates are taken exclusively in name order and held until a
//! terminal state, so no other manager call observes partial state.
//!
//! [`TransactionCoordinator::execute`] runs on its own task: cancelling the
//! caller does not stop it short of commit or rollback. A [`Transaction`]
//! dropped while still open is rolled back on a spawned task, which keeps the
//! participants' gates until the rollback finishes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_types::{MemoryItem, new_id};
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, error, info, warn};

use super::SyncStats;
use crate::error::{MemoryError, Result};
use crate::registry::{BackendEntry, BackendRegistry, CallPolicy};
use crate::retry::RetryConfig;
use crate::validation::ValidationError;

/// Lifecycle of a transaction. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Init,
    SnapshotTaken,
    Applying,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::SnapshotTaken => "SNAPSHOT_TAKEN",
            Self::Applying => "APPLYING",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One write inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOperation {
    Store { store: String, item: MemoryItem },
    Update { store: String, id: String, item: MemoryItem },
    Delete { store: String, id: String },
}

impl TxOperation {
    pub fn store(store: impl Into<String>, item: MemoryItem) -> Self {
        Self::Store {
            store: store.into(),
            item,
        }
    }

    pub fn update(store: impl Into<String>, id: impl Into<String>, item: MemoryItem) -> Self {
        Self::Update {
            store: store.into(),
            id: id.into(),
            item,
        }
    }

    pub fn delete(store: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Delete {
            store: store.into(),
            id: id.into(),
        }
    }

    /// Target backend.
    pub fn target(&self) -> &str {
        match self {
            Self::Store { store, .. } | Self::Update { store, .. } | Self::Delete { store, .. } => {
                store
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Store { .. } => "store",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Outcome of a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionReport {
    pub transaction_id: String,
    pub participants: Vec<String>,
    /// Item id touched by each applied operation, in order.
    pub applied: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Opens transactions against registered backends.
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    registry: Arc<BackendRegistry>,
    policy: CallPolicy,
    stats: Arc<Mutex<SyncStats>>,
}

impl TransactionCoordinator {
    pub fn new(
        registry: Arc<BackendRegistry>,
        policy: CallPolicy,
        stats: Arc<Mutex<SyncStats>>,
    ) -> Self {
        Self {
            registry,
            policy,
            stats,
        }
    }

    /// Open a transaction over `stores`.
    ///
    /// Waits for each participant's gate, then begins native transactions
    /// and takes snapshots. The returned transaction is `SNAPSHOT_TAKEN`.
    pub async fn begin<S: AsRef<str>>(&self, stores: &[S]) -> Result<Transaction> {
        let names: BTreeSet<&str> = stores.iter().map(AsRef::as_ref).collect();
        if names.is_empty() {
            return Err(
                ValidationError::InvalidArgument("a transaction needs participants".into()).into(),
            );
        }
        let names: Vec<&str> = names.into_iter().collect();
        let entries = self.registry.get_many(&names)?;

        let mut tx = Transaction {
            id: new_id(),
            state: TransactionState::Init,
            participants: Vec::with_capacity(entries.len()),
            guards: Vec::with_capacity(entries.len()),
            policy: self.policy.clone(),
            restore_policy: self.policy.with_retry(RetryConfig::persistent()),
            stats: Arc::clone(&self.stats),
            applied: Vec::new(),
        };

        for entry in &entries {
            tx.guards.push(entry.lock_exclusive().await);
        }

        let native_count = entries
            .iter()
            .filter(|e| e.store().as_transactional().is_some())
            .count();
        for entry in entries {
            let native = entry.store().as_transactional().is_some();
            tx.participants.push(Participant {
                entry,
                native,
                snapshot: None,
                began: false,
                committed: false,
            });
            let index = tx.participants.len() - 1;
            if let Err(err) = tx.prepare(index, native_count > 1).await {
                warn!(transaction_id = %tx.id, error = %err, "Transaction setup failed");
                return Err(tx.abort(err).await);
            }
        }

        tx.state = TransactionState::SnapshotTaken;
        info!(
            transaction_id = %tx.id,
            participants = ?tx.participant_names(),
            "Transaction started"
        );
        Ok(tx)
    }

    /// Run `operations` atomically over `stores`.
    ///
    /// The work is spawned, so dropping the returned future still leaves
    /// every participant either committed or rolled back.
    pub async fn execute<S: AsRef<str>>(
        &self,
        operations: Vec<TxOperation>,
        stores: &[S],
    ) -> Result<TransactionReport> {
        let coordinator = self.clone();
        let stores: Vec<String> = stores.iter().map(|s| s.as_ref().to_string()).collect();
        tokio::spawn(async move { coordinator.run_to_end(operations, &stores).await })
            .await
            .map_err(|e| MemoryError::TransactionAborted {
                transaction_id: String::new(),
                reason: format!("transaction task failed: {e}"),
            })?
    }

    async fn run_to_end(
        &self,
        operations: Vec<TxOperation>,
        stores: &[String],
    ) -> Result<TransactionReport> {
        let mut tx = self.begin(stores).await?;
        for operation in operations {
            tx.apply(operation).await?;
        }
        tx.commit().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transaction
// ─────────────────────────────────────────────────────────────────────────────

/// Full contents of a participant before the transaction.
#[derive(Debug, Clone)]
struct Snapshot {
    items: Vec<MemoryItem>,
    auxiliary: Option<serde_json::Value>,
}

struct Participant {
    entry: Arc<BackendEntry>,
    native: bool,
    /// Always present for non-native participants; present for native ones
    /// only as compensation.
    snapshot: Option<Snapshot>,
    began: bool,
    committed: bool,
}

/// An open cross-store transaction.
///
/// Any failing [`apply`](Self::apply) rolls every participant back before
/// returning. Dropping a non-terminal transaction rolls it back in the
/// background; finish with [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) to observe the outcome.
pub struct Transaction {
    id: String,
    state: TransactionState,
    participants: Vec<Participant>,
    guards: Vec<OwnedRwLockWriteGuard<()>>,
    policy: CallPolicy,
    restore_policy: CallPolicy,
    stats: Arc<Mutex<SyncStats>>,
    applied: Vec<String>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("participants", &self.participant_names())
            .field("applied", &self.applied.len())
            .finish()
    }
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn participant_names(&self) -> Vec<String> {
        self.participants
            .iter()
            .map(|p| p.entry.name().to_string())
            .collect()
    }

    /// Read an item from a participant as the transaction currently sees it.
    pub async fn retrieve(&self, store: &str, id: &str) -> Result<Option<MemoryItem>> {
        self.ensure_open("retrieve")?;
        let entry = self.participant(store)?;
        entry
            .invoke(&self.policy, "retrieve", |s| {
                let id = id.to_string();
                async move { s.retrieve(&id).await }
            })
            .await
    }

    /// Apply one operation. On failure the transaction is rolled back and
    /// the error is `TransactionAborted` (or `Corruption` if restoring a
    /// participant failed).
    pub async fn apply(&mut self, operation: TxOperation) -> Result<String> {
        self.ensure_open("apply")?;
        self.state = TransactionState::Applying;

        match self.run(&operation).await {
            Ok(id) => {
                debug!(
                    transaction_id = %self.id,
                    operation = operation.kind(),
                    backend = %operation.target(),
                    item_id = %id,
                    "Applied operation"
                );
                self.applied.push(id.clone());
                Ok(id)
            }
            Err(err) => {
                warn!(
                    transaction_id = %self.id,
                    operation = operation.kind(),
                    backend = %operation.target(),
                    error = %err,
                    "Operation failed, rolling back"
                );
                Err(self.abort(err).await)
            }
        }
    }

    /// Commit every native participant in name order.
    pub async fn commit(&mut self) -> Result<TransactionReport> {
        self.ensure_open("commit")?;

        for index in 0..self.participants.len() {
            if !self.participants[index].native {
                continue;
            }
            let entry = Arc::clone(&self.participants[index].entry);
            let id = self.id.clone();
            let outcome = entry
                .invoke(&self.policy, "commit", |s| {
                    let id = id.clone();
                    async move {
                        match s.as_transactional() {
                            Some(native) => native.commit(&id).await,
                            None => Ok(()),
                        }
                    }
                })
                .await;
            match outcome {
                Ok(()) => self.participants[index].committed = true,
                Err(err) => {
                    warn!(
                        transaction_id = %self.id,
                        backend = %entry.name(),
                        error = %err,
                        "Native commit failed, compensating"
                    );
                    return Err(self.abort(err).await);
                }
            }
        }

        self.stats.lock().transactions_committed += 1;
        self.finish(TransactionState::Committed);
        info!(transaction_id = %self.id, operations = self.applied.len(), "Transaction committed");
        Ok(TransactionReport {
            transaction_id: self.id.clone(),
            participants: self.participant_names(),
            applied: self.applied.clone(),
        })
    }

    /// Undo everything and release the participants.
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_open("rollback")?;
        let failures = self.restore_all().await;
        self.stats.lock().transactions_rolled_back += 1;
        self.finish(TransactionState::RolledBack);
        if failures.is_empty() {
            info!(transaction_id = %self.id, "Transaction rolled back");
            Ok(())
        } else {
            Err(self.restore_failed(failures))
        }
    }

    /// Roll back because of `cause` and return the error to surface.
    pub async fn abort(&mut self, cause: MemoryError) -> MemoryError {
        if self.state.is_terminal() {
            return cause;
        }
        match self.rollback().await {
            Ok(()) => MemoryError::TransactionAborted {
                transaction_id: self.id.clone(),
                reason: cause.to_string(),
            },
            Err(corruption) => corruption,
        }
    }

    // ── internals ───────────────────────────────────────────────────────────

    async fn prepare(&mut self, index: usize, compensate_natives: bool) -> Result<()> {
        let entry = Arc::clone(&self.participants[index].entry);
        let native = self.participants[index].native;

        if !native || compensate_natives {
            let snapshot = entry
                .invoke(&self.policy, "snapshot", |s| async move {
                    Ok(Snapshot {
                        items: s.all_items().await?,
                        auxiliary: s.auxiliary_state().await?,
                    })
                })
                .await?;
            debug!(
                transaction_id = %self.id,
                backend = %entry.name(),
                items = snapshot.items.len(),
                auxiliary = snapshot.auxiliary.is_some(),
                "Snapshot taken"
            );
            self.participants[index].snapshot = Some(snapshot);
        }

        if native {
            let id = self.id.clone();
            entry
                .invoke(&self.policy, "begin", |s| {
                    let id = id.clone();
                    async move {
                        match s.as_transactional() {
                            Some(native) => native.begin(&id).await,
                            None => Ok(()),
                        }
                    }
                })
                .await?;
            self.participants[index].began = true;
        }
        Ok(())
    }

    async fn run(&self, operation: &TxOperation) -> Result<String> {
        let entry = self.participant(operation.target())?;
        match operation {
            TxOperation::Store { item, .. } => {
                entry
                    .invoke(&self.policy, "store", |s| {
                        let item = item.clone();
                        async move { s.store(item).await }
                    })
                    .await
            }
            TxOperation::Update { store, id, item } => {
                let found = entry
                    .invoke(&self.policy, "update", |s| {
                        let (id, item) = (id.clone(), item.clone());
                        async move { s.update(&id, item).await }
                    })
                    .await?;
                if !found {
                    return Err(MemoryError::not_found(store, id));
                }
                Ok(id.clone())
            }
            TxOperation::Delete { store, id } => {
                let found = entry
                    .invoke(&self.policy, "delete", |s| {
                        let id = id.clone();
                        async move { s.delete(&id).await }
                    })
                    .await?;
                if !found {
                    return Err(MemoryError::not_found(store, id));
                }
                Ok(id.clone())
            }
        }
    }

    /// Single rollback path. Returns one message per participant that could
    /// not be brought back to its pre-transaction state.
    async fn restore_all(&self) -> Vec<String> {
        let mut failures = Vec::new();
        for participant in &self.participants {
            let entry = &participant.entry;
            let snapshot = participant.snapshot.clone();

            let outcome = match (participant.native, participant.began, participant.committed) {
                // Untouched: setup never reached it.
                (true, false, _) => continue,
                (false, _, _) => match snapshot {
                    Some(snapshot) => self.restore(entry, snapshot).await,
                    None => continue,
                },
                (true, true, false) => match self.rollback_native(entry).await {
                    Ok(()) => continue,
                    Err(err) => match snapshot {
                        Some(snapshot) => {
                            warn!(backend = %entry.name(), error = %err, "Native rollback failed, restoring snapshot");
                            self.restore(entry, snapshot).await
                        }
                        None => Err(err),
                    },
                },
                (true, true, true) => match snapshot {
                    Some(snapshot) => self.restore(entry, snapshot).await,
                    None => Err(MemoryError::corruption(
                        entry.name(),
                        "committed without a compensation snapshot",
                    )),
                },
            };
            if let Err(err) = outcome {
                failures.push(format!("{}: {err}", entry.name()));
            }
        }
        failures
    }

    async fn rollback_native(&self, entry: &BackendEntry) -> Result<()> {
        let id = self.id.clone();
        entry
            .invoke(&self.restore_policy, "rollback", |s| {
                let id = id.clone();
                async move {
                    match s.as_transactional() {
                        Some(native) => native.rollback(&id).await,
                        None => Ok(()),
                    }
                }
            })
            .await
    }

    /// Bring `entry` back to exactly `snapshot`, then verify.
    async fn restore(&self, entry: &BackendEntry, snapshot: Snapshot) -> Result<()> {
        let Snapshot { items, auxiliary } = snapshot;
        let expected: BTreeMap<String, MemoryItem> = items
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();
        let current = self.read_all(entry).await?;

        for id in current.keys().filter(|id| !expected.contains_key(*id)) {
            entry
                .invoke(&self.restore_policy, "restore.delete", |s| {
                    let id = id.clone();
                    async move { s.delete(&id).await }
                })
                .await?;
        }
        for (id, item) in &expected {
            if current.get(id).is_some_and(|c| c.same_version(item)) {
                continue;
            }
            entry
                .invoke(&self.restore_policy, "restore.store", |s| {
                    let item = item.clone();
                    async move { s.store(item).await }
                })
                .await?;
        }

        // Items first: edges need both endpoints present.
        if let Some(state) = &auxiliary {
            entry
                .invoke(&self.restore_policy, "restore.auxiliary", |s| {
                    let state = state.clone();
                    async move { s.restore_auxiliary_state(state).await }
                })
                .await?;
        }

        let restored = self.read_all(entry).await?;
        let restored_auxiliary = entry
            .invoke(&self.restore_policy, "restore.read", |s| async move {
                s.auxiliary_state().await
            })
            .await?;
        let matches = restored.len() == expected.len()
            && expected
                .iter()
                .all(|(id, item)| restored.get(id).is_some_and(|r| r.same_version(item)))
            && (auxiliary.is_none() || restored_auxiliary == auxiliary);
        if !matches {
            return Err(MemoryError::corruption(
                entry.name(),
                "contents differ from snapshot after restore",
            ));
        }
        debug!(backend = %entry.name(), items = expected.len(), "Restored from snapshot");
        Ok(())
    }

    async fn read_all(&self, entry: &BackendEntry) -> Result<BTreeMap<String, MemoryItem>> {
        let items = entry
            .invoke(&self.restore_policy, "restore.read", |s| async move {
                s.all_items().await
            })
            .await?;
        Ok(items.into_iter().map(|i| (i.id.clone(), i)).collect())
    }

    fn restore_failed(&self, failures: Vec<String>) -> MemoryError {
        error!(
            transaction_id = %self.id,
            failures = ?failures,
            "Rollback could not restore every participant"
        );
        MemoryError::Corruption {
            backend: failures
                .iter()
                .filter_map(|f| f.split(':').next())
                .collect::<Vec<_>>()
                .join(","),
            message: format!(
                "transaction {} rollback incomplete: {}",
                self.id,
                failures.join("; ")
            ),
        }
    }

    fn participant(&self, store: &str) -> Result<&BackendEntry> {
        self.participants
            .iter()
            .find(|p| p.entry.name() == store)
            .map(|p| p.entry.as_ref())
            .ok_or_else(|| {
                ValidationError::InvalidArgument(format!(
                    "'{store}' is not a participant of transaction {}",
                    self.id
                ))
                .into()
            })
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(MemoryError::InvalidTransactionState {
                transaction_id: self.id.clone(),
                state: self.state.to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    fn finish(&mut self, state: TransactionState) {
        self.state = state;
        self.guards.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        warn!(
            transaction_id = %self.id,
            state = %self.state,
            "Transaction dropped before commit or rollback, rolling back"
        );
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(transaction_id = %self.id, "No runtime to roll back dropped transaction");
            return;
        };

        // The detached copy takes over the participants and gate guards.
        let mut detached = Transaction {
            id: self.id.clone(),
            state: self.state,
            participants: std::mem::take(&mut self.participants),
            guards: std::mem::take(&mut self.guards),
            policy: self.policy.clone(),
            restore_policy: self.restore_policy.clone(),
            stats: Arc::clone(&self.stats),
            applied: std::mem::take(&mut self.applied),
        };
        self.state = TransactionState::RolledBack;
        runtime.spawn(async move {
            if let Err(err) = detached.rollback().await {
                error!(transaction_id = %detached.id, error = %err, "Background rollback failed");
            }
        });
    }
}
