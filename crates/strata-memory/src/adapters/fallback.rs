//! Primary backend with ordered fallbacks.
//!
//! Reads go to the first healthy store that answers. Writes go to the
//! primary and are mirrored to every fallback; when the primary fails the
//! write lands on a fallback instead and is queued for the primary. The
//! queue is replayed the next time a primary write succeeds, or on
//! [`FallbackStore::reconcile`].
//!
//! ```text
//!            ┌──────────── FallbackStore ────────────┐
//!  write ──► │ primary ──ok──► mirror to fallbacks   │
//!            │    └─fail──► fallback[0..] + pending  │
//!  read  ──► │ primary ─fail/miss─► fallback[0..]    │
//!            └───────────────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_types::{MemoryItem, SearchHit};
use tracing::{debug, info, warn};

use crate::backend::MemoryStore;
use crate::error::{MemoryError, Result};
use crate::validation::{validate_item, validate_update};

/// Consecutive failures after which a store is skipped.
pub const DEFAULT_UNAVAILABLE_AFTER: u32 = 3;

/// Health of one store behind a [`FallbackStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreStatus {
    Available,
    /// Failed recently; still tried.
    Degraded,
    /// Failed repeatedly; skipped until [`FallbackStore::recheck`].
    Unavailable,
}

/// Status of the primary and each fallback, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackStatus {
    pub primary: StoreStatus,
    pub fallbacks: Vec<StoreStatus>,
    pub pending: usize,
}

/// A write the primary missed.
#[derive(Debug, Clone, PartialEq)]
enum PendingOp {
    Store(MemoryItem),
    Delete(String),
}

#[derive(Debug, Clone, Copy)]
struct Health {
    status: StoreStatus,
    failures: u32,
}

impl Health {
    const FRESH: Health = Health {
        status: StoreStatus::Available,
        failures: 0,
    };
}

/// Backend that fails over from a primary to its fallbacks.
pub struct FallbackStore {
    name: String,
    /// Index 0 is the primary.
    stores: Vec<Arc<dyn MemoryStore>>,
    health: Mutex<Vec<Health>>,
    pending: Mutex<VecDeque<PendingOp>>,
    unavailable_after: u32,
}

impl fmt::Debug for FallbackStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackStore")
            .field("name", &self.name)
            .field(
                "stores",
                &self.stores.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl FallbackStore {
    pub fn new(
        name: impl Into<String>,
        primary: Arc<dyn MemoryStore>,
        fallbacks: Vec<Arc<dyn MemoryStore>>,
    ) -> Self {
        let mut stores = Vec::with_capacity(fallbacks.len() + 1);
        stores.push(primary);
        stores.extend(fallbacks);
        Self {
            name: name.into(),
            health: Mutex::new(vec![Health::FRESH; stores.len()]),
            stores,
            pending: Mutex::new(VecDeque::new()),
            unavailable_after: DEFAULT_UNAVAILABLE_AFTER,
        }
    }

    /// Skip a store after `failures` consecutive failures. Zero never skips.
    pub fn with_unavailable_after(mut self, failures: u32) -> Self {
        self.unavailable_after = failures;
        self
    }

    pub fn status(&self) -> FallbackStatus {
        let health = self.health.lock();
        FallbackStatus {
            primary: health[0].status,
            fallbacks: health[1..].iter().map(|h| h.status).collect(),
            pending: self.pending.lock().len(),
        }
    }

    /// Writes waiting to reach the primary.
    pub fn pending_operations(&self) -> usize {
        self.pending.lock().len()
    }

    /// Replay pending writes on the primary, oldest first.
    ///
    /// Stops at the first failure and keeps it and everything after it
    /// queued. Returns how many were applied.
    pub async fn reconcile(&self) -> Result<usize> {
        let primary = &self.stores[0];
        let mut applied = 0;
        loop {
            let Some(op) = self.pending.lock().pop_front() else {
                break;
            };
            let outcome = match &op {
                PendingOp::Store(item) => primary.store(item.clone()).await.map(drop),
                PendingOp::Delete(id) => primary.delete(id).await.map(drop),
            };
            if let Err(err) = outcome {
                self.pending.lock().push_front(op);
                self.failed(0, &err);
                warn!(backend = %self.name, applied, error = %err, "Reconciliation interrupted");
                return Err(err);
            }
            applied += 1;
        }
        self.succeeded(0);
        if applied > 0 {
            info!(backend = %self.name, applied, "Reconciled pending operations");
        }
        Ok(applied)
    }

    /// Ask every unavailable store for its keys and mark those that answer
    /// available again, then reconcile if the primary came back.
    pub async fn recheck(&self) -> Result<FallbackStatus> {
        for (index, store) in self.stores.iter().enumerate() {
            if self.health.lock()[index].status != StoreStatus::Unavailable {
                continue;
            }
            match store.list_keys().await {
                Ok(_) => {
                    info!(backend = %self.name, store = %store.name(), "Store reachable again");
                    self.health.lock()[index] = Health {
                        status: StoreStatus::Degraded,
                        failures: 0,
                    };
                }
                Err(err) => debug!(store = %store.name(), error = %err, "Store still unreachable"),
            }
        }
        if self.health.lock()[0].status != StoreStatus::Unavailable && self.pending_operations() > 0 {
            self.reconcile().await?;
        }
        Ok(self.status())
    }

    // ── health bookkeeping ──────────────────────────────────────────────────

    fn usable(&self, index: usize) -> bool {
        self.health.lock()[index].status != StoreStatus::Unavailable
    }

    fn succeeded(&self, index: usize) {
        self.health.lock()[index] = Health::FRESH;
    }

    fn failed(&self, index: usize, err: &MemoryError) {
        let mut health = self.health.lock();
        let entry = &mut health[index];
        entry.failures = entry.failures.saturating_add(1);
        entry.status = if self.unavailable_after > 0 && entry.failures >= self.unavailable_after {
            StoreStatus::Unavailable
        } else {
            StoreStatus::Degraded
        };
        warn!(
            backend = %self.name,
            store = %self.stores[index].name(),
            failures = entry.failures,
            status = ?entry.status,
            error = %err,
            "Store call failed"
        );
    }

    fn exhausted(&self, operation: &str, failures: Vec<String>) -> MemoryError {
        MemoryError::storage(
            &self.name,
            format!("every store failed to {operation}: {}", failures.join("; ")),
        )
    }

    /// Validation and not-found errors say nothing about store health.
    fn is_store_failure(err: &MemoryError) -> bool {
        !matches!(err, MemoryError::Validation(_) | MemoryError::NotFound { .. })
    }

    /// First usable store that answers `read`, primary first.
    async fn first_answer<T, F, Fut>(&self, operation: &str, mut read: F) -> Result<T>
    where
        F: FnMut(Arc<dyn MemoryStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = Vec::new();
        for (index, store) in self.stores.iter().enumerate() {
            if !self.usable(index) {
                continue;
            }
            match read(Arc::clone(store)).await {
                Ok(value) => {
                    self.succeeded(index);
                    return Ok(value);
                }
                Err(err) if Self::is_store_failure(&err) => {
                    self.failed(index, &err);
                    failures.push(format!("{}: {err}", store.name()));
                }
                Err(err) => return Err(err),
            }
        }
        Err(self.exhausted(operation, failures))
    }

    /// Copy a primary write to every usable fallback. Failures only
    /// degrade the fallback.
    async fn mirror(&self, item: &MemoryItem) {
        for (index, store) in self.stores.iter().enumerate().skip(1) {
            if !self.usable(index) {
                continue;
            }
            match store.store(item.clone()).await {
                Ok(_) => self.succeeded(index),
                Err(err) => self.failed(index, &err),
            }
        }
    }

    /// Called after a successful primary write.
    async fn primary_recovered(&self) {
        if self.pending_operations() == 0 {
            return;
        }
        info!(backend = %self.name, "Primary available again, reconciling");
        if let Err(err) = self.reconcile().await {
            debug!(backend = %self.name, error = %err, "Pending operations kept for later");
        }
    }

    /// Write `item` to the first usable fallback and queue it.
    async fn store_on_fallback(&self, item: MemoryItem, mut failures: Vec<String>) -> Result<String> {
        for (index, store) in self.stores.iter().enumerate().skip(1) {
            if !self.usable(index) {
                continue;
            }
            match store.store(item.clone()).await {
                Ok(id) => {
                    self.succeeded(index);
                    self.pending.lock().push_back(PendingOp::Store(item));
                    info!(
                        backend = %self.name,
                        store = %store.name(),
                        item_id = %id,
                        "Stored on fallback, queued for primary"
                    );
                    return Ok(id);
                }
                Err(err) => {
                    self.failed(index, &err);
                    failures.push(format!("{}: {err}", store.name()));
                }
            }
        }
        Err(self.exhausted("store", failures))
    }
}

#[async_trait]
impl MemoryStore for FallbackStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, mut item: MemoryItem) -> Result<String> {
        validate_item(&item)?;
        // Every copy must share one id.
        item.ensure_id();

        let mut failures = Vec::new();
        if self.usable(0) {
            let primary = &self.stores[0];
            match primary.store(item.clone()).await {
                Ok(id) => {
                    self.succeeded(0);
                    self.primary_recovered().await;
                    self.mirror(&item).await;
                    return Ok(id);
                }
                Err(err) if Self::is_store_failure(&err) => {
                    self.failed(0, &err);
                    failures.push(format!("{}: {err}", primary.name()));
                }
                Err(err) => return Err(err),
            }
        }
        self.store_on_fallback(item, failures).await
    }

    /// A miss on the primary falls through to the fallbacks.
    async fn retrieve(&self, id: &str) -> Result<Option<MemoryItem>> {
        let mut failures = Vec::new();
        let mut answered = false;
        for (index, store) in self.stores.iter().enumerate() {
            if !self.usable(index) {
                continue;
            }
            match store.retrieve(id).await {
                Ok(Some(item)) => {
                    self.succeeded(index);
                    return Ok(Some(item));
                }
                Ok(None) => {
                    self.succeeded(index);
                    answered = true;
                }
                Err(err) => {
                    self.failed(index, &err);
                    failures.push(format!("{}: {err}", store.name()));
                }
            }
        }
        if answered {
            Ok(None)
        } else {
            Err(self.exhausted("retrieve", failures))
        }
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let mut hits = self
            .first_answer("search", |s| {
                let query = query.to_string();
                async move { s.search(&query, limit).await }
            })
            .await?;
        for hit in &mut hits {
            hit.backend = self.name.clone();
        }
        Ok(hits)
    }

    /// Updates the primary and mirrors the result. When the primary fails,
    /// the first fallback holding the item takes the update and the new
    /// version is queued.
    async fn update(&self, id: &str, item: MemoryItem) -> Result<bool> {
        validate_update(id, &item)?;

        let mut failures = Vec::new();
        if self.usable(0) {
            let primary = &self.stores[0];
            match primary.update(id, item.clone()).await {
                Ok(false) => {
                    self.succeeded(0);
                    return Ok(false);
                }
                Ok(true) => {
                    self.succeeded(0);
                    self.primary_recovered().await;
                    if let Ok(Some(current)) = primary.retrieve(id).await {
                        self.mirror(&current).await;
                    }
                    return Ok(true);
                }
                Err(err) if Self::is_store_failure(&err) => {
                    self.failed(0, &err);
                    failures.push(format!("{}: {err}", primary.name()));
                }
                Err(err) => return Err(err),
            }
        }

        let mut answered = false;
        for (index, store) in self.stores.iter().enumerate().skip(1) {
            if !self.usable(index) {
                continue;
            }
            match store.update(id, item.clone()).await {
                Ok(false) => {
                    self.succeeded(index);
                    answered = true;
                }
                Ok(true) => {
                    self.succeeded(index);
                    match store.retrieve(id).await? {
                        Some(current) => self.pending.lock().push_back(PendingOp::Store(current)),
                        None => warn!(backend = %self.name, item_id = %id, "Updated item vanished"),
                    }
                    info!(backend = %self.name, store = %store.name(), item_id = %id, "Updated on fallback, queued for primary");
                    return Ok(true);
                }
                Err(err) => {
                    self.failed(index, &err);
                    failures.push(format!("{}: {err}", store.name()));
                }
            }
        }
        if answered {
            Ok(false)
        } else {
            Err(self.exhausted("update", failures))
        }
    }

    /// Deletes everywhere. A delete the primary missed is queued.
    async fn delete(&self, id: &str) -> Result<bool> {
        let mut deleted = false;
        let mut primary_done = false;
        let mut answered = false;
        let mut failures = Vec::new();
        for (index, store) in self.stores.iter().enumerate() {
            if !self.usable(index) {
                continue;
            }
            match store.delete(id).await {
                Ok(found) => {
                    self.succeeded(index);
                    answered = true;
                    deleted |= found;
                    primary_done |= index == 0;
                }
                Err(err) => {
                    self.failed(index, &err);
                    failures.push(format!("{}: {err}", store.name()));
                }
            }
        }
        if !answered {
            return Err(self.exhausted("delete", failures));
        }
        if !primary_done && deleted {
            self.pending.lock().push_back(PendingOp::Delete(id.to_string()));
            info!(backend = %self.name, item_id = %id, "Deleted on fallback, queued for primary");
        }
        Ok(deleted)
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.first_answer("list keys", |s| async move { s.list_keys().await })
            .await
    }

    async fn all_items(&self) -> Result<Vec<MemoryItem>> {
        self.first_answer("read all items", |s| async move { s.all_items().await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::DocumentStore;
    use crate::testing::FlakyStore;
    use strata_types::MemoryType;

    fn item(id: &str, content: &str) -> MemoryItem {
        MemoryItem::new(MemoryType::Working, content).with_id(id)
    }

    struct Fixture {
        store: FallbackStore,
        primary_inner: Arc<DocumentStore>,
        primary: Arc<FlakyStore>,
        backup: Arc<DocumentStore>,
    }

    fn fixture() -> Fixture {
        let primary_inner = Arc::new(DocumentStore::new("primary"));
        let primary = Arc::new(FlakyStore::new(primary_inner.clone()));
        let backup = Arc::new(DocumentStore::new("backup"));
        let store = FallbackStore::new("memory", primary.clone(), vec![backup.clone()]);
        Fixture {
            store,
            primary_inner,
            primary,
            backup,
        }
    }

    #[tokio::test]
    async fn test_writes_are_mirrored_while_healthy() {
        let f = fixture();
        let id = f.store.store(item("a", "alpha")).await.unwrap();

        assert_eq!(id, "a");
        assert!(f.primary_inner.retrieve("a").await.unwrap().is_some());
        assert!(f.backup.retrieve("a").await.unwrap().is_some());
        assert_eq!(f.store.pending_operations(), 0);
        assert_eq!(f.store.status().primary, StoreStatus::Available);
    }

    #[tokio::test]
    async fn test_failed_primary_write_lands_on_fallback_and_reconciles() {
        let f = fixture();
        let primary = FlakyStore::new(f.primary_inner.clone()).fail_on_write(1);
        let store = FallbackStore::new("memory", Arc::new(primary), vec![f.backup.clone()]);

        store.store(item("a", "alpha")).await.unwrap();
        assert!(f.primary_inner.retrieve("a").await.unwrap().is_none());
        assert!(f.backup.retrieve("a").await.unwrap().is_some());
        assert_eq!(store.status().primary, StoreStatus::Degraded);
        assert_eq!(store.pending_operations(), 1);

        // The next primary write succeeds and replays the queue first.
        store.store(item("b", "beta")).await.unwrap();
        assert_eq!(f.primary_inner.list_keys().await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.pending_operations(), 0);
        assert_eq!(store.status().primary, StoreStatus::Available);
    }

    #[tokio::test]
    async fn test_reads_fall_through_on_failure_and_miss() {
        let f = fixture();
        f.backup.store(item("only-backup", "beta")).await.unwrap();
        f.store.store(item("a", "alpha")).await.unwrap();

        assert_eq!(
            f.store.retrieve("only-backup").await.unwrap().map(|i| i.content),
            Some("beta".to_string())
        );

        f.primary.set_corrupt_reads(true);
        assert!(f.store.retrieve("a").await.unwrap().is_some());
        assert_eq!(f.store.list_keys().await.unwrap(), vec!["a", "only-backup"]);
        assert_eq!(f.store.status().primary, StoreStatus::Degraded);

        let hits = f.store.search("alpha", 5).await.unwrap();
        assert_eq!(hits[0].item.id, "a");
        assert_eq!(hits[0].backend, "memory");
        assert_eq!(f.store.retrieve("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_repeated_failures_make_primary_unavailable_until_recheck() {
        let f = fixture();
        let store = FallbackStore::new("memory", f.primary.clone(), vec![f.backup.clone()])
            .with_unavailable_after(2);
        f.primary.set_corrupt_reads(true);

        store.list_keys().await.unwrap();
        store.list_keys().await.unwrap();
        assert_eq!(store.status().primary, StoreStatus::Unavailable);

        // Skipped entirely: writes queue up on the fallback.
        let writes_before = f.primary.write_calls();
        store.store(item("a", "alpha")).await.unwrap();
        assert_eq!(f.primary.write_calls(), writes_before);
        assert_eq!(store.pending_operations(), 1);

        let still_down = store.recheck().await.unwrap();
        assert_eq!(still_down.primary, StoreStatus::Unavailable);

        f.primary.set_corrupt_reads(false);
        let status = store.recheck().await.unwrap();
        assert_eq!(status.primary, StoreStatus::Available);
        assert_eq!(status.pending, 0);
        assert!(f.primary_inner.retrieve("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_and_delete_during_outage_are_replayed() {
        let f = fixture();
        f.store.store(item("a", "alpha")).await.unwrap();
        f.store.store(item("b", "beta")).await.unwrap();

        let primary = FlakyStore::new(f.primary_inner.clone())
            .fail_on_write(1)
            .fail_on_write(2);
        let store = FallbackStore::new("memory", Arc::new(primary), vec![f.backup.clone()]);

        assert!(store.update("a", item("", "alpha two")).await.unwrap());
        assert!(store.delete("b").await.unwrap());
        assert_eq!(store.pending_operations(), 2);
        assert_eq!(
            f.primary_inner.retrieve("a").await.unwrap().map(|i| i.content),
            Some("alpha".to_string())
        );

        assert_eq!(store.reconcile().await.unwrap(), 2);
        assert_eq!(
            f.primary_inner.retrieve("a").await.unwrap().map(|i| i.content),
            Some("alpha two".to_string())
        );
        assert!(f.primary_inner.retrieve("b").await.unwrap().is_none());
        assert_eq!(
            f.primary_inner.retrieve("a").await.unwrap(),
            f.backup.retrieve("a").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_every_store_failing_is_a_storage_error() {
        let primary = FlakyStore::new(Arc::new(DocumentStore::new("p"))).fail_on_write(1);
        let backup = FlakyStore::new(Arc::new(DocumentStore::new("b"))).fail_on_write(1);
        let store = FallbackStore::new("memory", Arc::new(primary), vec![Arc::new(backup)]);

        let err = store.store(item("a", "alpha")).await.unwrap_err();
        assert!(matches!(err, MemoryError::Storage { ref backend, .. } if backend == "memory"));
        assert!(err.is_retryable());
        assert_eq!(store.pending_operations(), 0);
    }
}
