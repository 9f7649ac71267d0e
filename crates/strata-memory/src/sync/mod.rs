//! Synchronization between backend pairs.
//!
//! `synchronize(source, target)` copies every source item changed since the
//! pair's checkpoint into the target inside a single-participant
//! transaction. Divergent versions are resolved last-writer-wins and both
//! sides are kept in the [`ConflictLog`].
//!
//! Writes can also be queued with [`SyncManager::queue_update`]. Flushing
//! the queue writes each item to its store and copies it to every other
//! registered backend, resolving divergent versions the same way.

pub mod checkpoint;
pub mod conflict;
pub mod transaction;

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_types::MemoryItem;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::{BackendEntry, BackendRegistry, CallPolicy};
use crate::validation::{ValidationError, validate_item};

pub use checkpoint::SyncCheckpoints;
pub use conflict::{ConflictLog, ConflictRecord, ConflictWinner, ResolutionReason, resolve};
pub use transaction::{
    Transaction, TransactionCoordinator, TransactionReport, TransactionState, TxOperation,
};

/// Counters across every synchronization and transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Items written to a target by synchronization.
    pub synchronized: u64,
    pub conflicts: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
}

/// Result of one `synchronize(source, target)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub source: String,
    pub target: String,
    /// Items written to the target.
    pub applied_count: usize,
    pub conflicts_resolved: usize,
    /// Conflicts resolved by this run.
    pub conflict_log: Vec<ConflictRecord>,
}

impl SyncReport {
    fn empty(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            applied_count: 0,
            conflicts_resolved: 0,
            conflict_log: Vec::new(),
        }
    }
}

/// A write waiting for [`SyncManager::flush_queue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedUpdate {
    pub store: String,
    pub item: MemoryItem,
}

/// Result of one `flush_queue`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Queued updates written and propagated.
    pub flushed: usize,
    /// Copies written to backends other than the update's own store.
    pub propagated: usize,
    pub conflicts_resolved: usize,
    pub conflict_log: Vec<ConflictRecord>,
}

/// Propagates writes between backends.
#[derive(Debug)]
pub struct SyncManager {
    registry: Arc<BackendRegistry>,
    policy: CallPolicy,
    coordinator: TransactionCoordinator,
    checkpoints: SyncCheckpoints,
    conflicts: ConflictLog,
    stats: Arc<Mutex<SyncStats>>,
    queue: Mutex<VecDeque<QueuedUpdate>>,
}

impl SyncManager {
    pub fn new(registry: Arc<BackendRegistry>, policy: CallPolicy) -> Self {
        let stats = Arc::new(Mutex::new(SyncStats::default()));
        let coordinator =
            TransactionCoordinator::new(Arc::clone(&registry), policy.clone(), Arc::clone(&stats));
        Self {
            registry,
            policy,
            coordinator,
            checkpoints: SyncCheckpoints::new(),
            conflicts: ConflictLog::new(),
            stats,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    /// Copy changes from `source` into `target`.
    pub async fn synchronize(&self, source: &str, target: &str) -> Result<SyncReport> {
        if source == target {
            return Err(ValidationError::InvalidArgument(format!(
                "cannot synchronize '{source}' with itself"
            ))
            .into());
        }
        let source_entry = self.registry.get(source)?;
        self.registry.get(target)?;

        let items = source_entry
            .call(&self.policy, "sync.read", |s| async move { s.all_items().await })
            .await?;
        let total = items.len();
        let changed = self.checkpoints.changed(source, target, items);
        if changed.is_empty() {
            debug!(source, target, total, "Nothing to synchronize");
            return Ok(SyncReport::empty(source, target));
        }

        let mut report = SyncReport::empty(source, target);
        let mut tx = self.coordinator.begin(&[target]).await?;
        for item in &changed {
            let existing = match tx.retrieve(target, &item.id).await {
                Ok(existing) => existing,
                Err(err) => return Err(tx.abort(err).await),
            };
            match existing {
                None => {
                    tx.apply(TxOperation::store(target, item.clone())).await?;
                    report.applied_count += 1;
                }
                Some(existing) if existing.same_version(item) => {}
                Some(existing) => {
                    let record = resolve(source, item.clone(), target, existing);
                    debug!(
                        item_id = %item.id,
                        winner = %record.winning_store(),
                        reason = ?record.reason,
                        "Resolved conflict"
                    );
                    if record.winner == ConflictWinner::StoreA {
                        tx.apply(TxOperation::store(target, item.clone())).await?;
                        report.applied_count += 1;
                    }
                    report.conflict_log.push(record);
                }
            }
        }
        tx.commit().await?;

        self.checkpoints.record(source, target, &changed);
        self.conflicts.extend(report.conflict_log.iter().cloned());
        report.conflicts_resolved = report.conflict_log.len();
        {
            let mut stats = self.stats.lock();
            stats.synchronized += report.applied_count as u64;
            stats.conflicts += report.conflicts_resolved as u64;
        }

        info!(
            source,
            target,
            changed = changed.len(),
            applied = report.applied_count,
            conflicts = report.conflicts_resolved,
            "Synchronization complete"
        );
        Ok(report)
    }

    /// `a → b`, then `b → a`.
    pub async fn synchronize_bidirectional(&self, a: &str, b: &str) -> Result<(SyncReport, SyncReport)> {
        let forward = self.synchronize(a, b).await?;
        let backward = self.synchronize(b, a).await?;
        Ok((forward, backward))
    }

    /// Queue `item` for `store`. Nothing is written until
    /// [`flush_queue`](Self::flush_queue). Returns the item's id.
    pub fn queue_update(&self, store: &str, mut item: MemoryItem) -> Result<String> {
        self.registry.get(store)?;
        validate_item(&item)?;
        let id = item.ensure_id().to_string();
        let queued = {
            let mut queue = self.queue.lock();
            queue.push_back(QueuedUpdate {
                store: store.to_string(),
                item,
            });
            queue.len()
        };
        debug!(backend = %store, item_id = %id, queued, "Queued update");
        Ok(id)
    }

    /// Updates waiting to be flushed.
    pub fn queued_updates(&self) -> usize {
        self.queue.lock().len()
    }

    /// Write and propagate every queued update, oldest first.
    ///
    /// An update that fails goes back to the front of the queue together
    /// with everything behind it, and the error is returned. Propagation is
    /// idempotent, so flushing again is safe.
    pub async fn flush_queue(&self) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        loop {
            let Some(update) = self.queue.lock().pop_front() else {
                break;
            };
            if let Err(err) = self.propagate(&update, &mut report).await {
                warn!(
                    backend = %update.store,
                    item_id = %update.item.id,
                    error = %err,
                    "Flush interrupted, update kept in queue"
                );
                self.queue.lock().push_front(update);
                return Err(err);
            }
            report.flushed += 1;
        }
        report.conflicts_resolved = report.conflict_log.len();
        if report.flushed > 0 {
            info!(
                flushed = report.flushed,
                propagated = report.propagated,
                conflicts = report.conflicts_resolved,
                "Update queue flushed"
            );
        }
        Ok(report)
    }

    /// Write `update` to its store, then bring every backend to the newest
    /// version of the item found among them.
    async fn propagate(&self, update: &QueuedUpdate, report: &mut FlushReport) -> Result<()> {
        let origin = self.registry.get(&update.store)?;
        write(&origin, &self.policy, &update.item).await?;

        let mut copies = Vec::new();
        for target in self.registry.all() {
            if target.name() == update.store {
                continue;
            }
            let existing = target
                .call(&self.policy, "queue.read", |s| {
                    let id = update.item.id.clone();
                    async move { s.retrieve(&id).await }
                })
                .await?;
            copies.push((target, existing));
        }

        let mut winner = update.item.clone();
        let mut winner_store = update.store.clone();
        for (target, existing) in &copies {
            let Some(existing) = existing else { continue };
            if existing.same_version(&winner) {
                continue;
            }
            let record = resolve(&winner_store, winner.clone(), target.name(), existing.clone());
            debug!(
                item_id = %winner.id,
                winner = %record.winning_store(),
                reason = ?record.reason,
                "Resolved conflict"
            );
            if record.winner == ConflictWinner::StoreB {
                winner = existing.clone();
                winner_store = target.name().to_string();
            }
            self.conflicts.extend([record.clone()]);
            self.stats.lock().conflicts += 1;
            report.conflict_log.push(record);
        }

        if winner_store != update.store {
            // A newer copy elsewhere flows back to the origin.
            write(&origin, &self.policy, &winner).await?;
        }
        for (target, existing) in &copies {
            if existing.as_ref().is_some_and(|e| e.same_version(&winner)) {
                continue;
            }
            write(target, &self.policy, &winner).await?;
            report.propagated += 1;
        }
        self.stats.lock().synchronized += 1;
        Ok(())
    }

    pub fn conflict_log(&self) -> Vec<ConflictRecord> {
        self.conflicts.records()
    }

    pub fn stats(&self) -> SyncStats {
        *self.stats.lock()
    }

    /// Drop checkpoints for a backend that left the registry.
    pub fn forget_backend(&self, backend: &str) {
        self.checkpoints.forget_backend(backend);
    }
}

async fn write(entry: &BackendEntry, policy: &CallPolicy, item: &MemoryItem) -> Result<String> {
    entry
        .call(policy, "queue.store", |s| {
            let item = item.clone();
            async move { s.store(item).await }
        })
        .await
}
