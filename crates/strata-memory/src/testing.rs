//! Fault injection for exercising failure paths.
//!
//! [`FlakyStore`] wraps any backend and can delay every call, fail chosen
//! write attempts with a transient `Storage` error, fail searches, or report
//! corruption on reads. Capabilities and native transactions are delegated
//! to the wrapped backend; native commits can be made to fail.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_types::{MemoryItem, SearchHit};
use tracing::debug;

use crate::backend::{Capabilities, MemoryStore, TransactionalStore, VectorStore};
use crate::error::{MemoryError, Result};

/// Backend wrapper that misbehaves on request.
pub struct FlakyStore {
    inner: Arc<dyn MemoryStore>,
    delay: Mutex<Option<Duration>>,
    write_calls: AtomicU64,
    /// Write attempts (1-indexed) that fail.
    fail_on_writes: Mutex<Vec<u64>>,
    fail_searches: AtomicBool,
    fail_commits: AtomicBool,
    corrupt_reads: AtomicBool,
}

impl std::fmt::Debug for FlakyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyStore")
            .field("inner", &self.inner.name())
            .field("delay", &*self.delay.lock())
            .field("write_calls", &self.write_calls.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn MemoryStore>) -> Self {
        Self {
            inner,
            delay: Mutex::new(None),
            write_calls: AtomicU64::new(0),
            fail_on_writes: Mutex::new(Vec::new()),
            fail_searches: AtomicBool::new(false),
            fail_commits: AtomicBool::new(false),
            corrupt_reads: AtomicBool::new(false),
        }
    }

    /// Sleep before every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(Some(delay));
        self
    }

    /// Fail the `n`th write attempt (store, update or delete), counting from 1.
    pub fn fail_on_write(self, n: u64) -> Self {
        self.fail_on_writes.lock().push(n);
        self
    }

    pub fn failing_searches(self) -> Self {
        self.set_fail_searches(true);
        self
    }

    /// Fail every native commit. Only meaningful over a transactional backend.
    pub fn failing_commits(self) -> Self {
        self.set_fail_commits(true);
        self
    }

    pub fn corrupt_reads(self) -> Self {
        self.set_corrupt_reads(true);
        self
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn set_fail_searches(&self, fail: bool) {
        self.fail_searches.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn set_corrupt_reads(&self, corrupt: bool) {
        self.corrupt_reads.store(corrupt, Ordering::SeqCst);
    }

    /// Write attempts seen so far, including failed ones.
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn before_write(&self, operation: &str) -> Result<()> {
        self.pause().await;
        let call = self.write_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_writes.lock().contains(&call) {
            debug!(backend = %self.inner.name(), call, operation, "Injected write failure");
            return Err(MemoryError::storage(
                self.inner.name(),
                format!("injected failure on write #{call} ({operation})"),
            ));
        }
        Ok(())
    }

    fn native(&self) -> Result<&dyn TransactionalStore> {
        self.inner
            .as_transactional()
            .ok_or_else(|| MemoryError::storage(self.inner.name(), "no native transactions"))
    }

    async fn before_read(&self) -> Result<()> {
        self.pause().await;
        if self.corrupt_reads.load(Ordering::SeqCst) {
            return Err(MemoryError::corruption(self.inner.name(), "injected corruption"));
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for FlakyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn store(&self, item: MemoryItem) -> Result<String> {
        self.before_write("store").await?;
        self.inner.store(item).await
    }

    async fn retrieve(&self, id: &str) -> Result<Option<MemoryItem>> {
        self.before_read().await?;
        self.inner.retrieve(id).await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.before_read().await?;
        if self.fail_searches.load(Ordering::SeqCst) {
            return Err(MemoryError::storage(self.inner.name(), "injected search failure"));
        }
        self.inner.search(query, limit).await
    }

    async fn update(&self, id: &str, item: MemoryItem) -> Result<bool> {
        self.before_write("update").await?;
        self.inner.update(id, item).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.before_write("delete").await?;
        self.inner.delete(id).await
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.before_read().await?;
        self.inner.list_keys().await
    }

    async fn all_items(&self) -> Result<Vec<MemoryItem>> {
        self.before_read().await?;
        self.inner.all_items().await
    }

    async fn auxiliary_state(&self) -> Result<Option<serde_json::Value>> {
        self.before_read().await?;
        self.inner.auxiliary_state().await
    }

    async fn restore_auxiliary_state(&self, state: serde_json::Value) -> Result<()> {
        self.pause().await;
        self.inner.restore_auxiliary_state(state).await
    }

    fn as_vector_store(&self) -> Option<&dyn VectorStore> {
        self.inner.as_vector_store()
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalStore> {
        self.inner
            .as_transactional()
            .map(|_| self as &dyn TransactionalStore)
    }
}

#[async_trait]
impl TransactionalStore for FlakyStore {
    async fn begin(&self, transaction_id: &str) -> Result<()> {
        self.native()?.begin(transaction_id).await
    }

    async fn commit(&self, transaction_id: &str) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            debug!(backend = %self.inner.name(), transaction_id, "Injected commit failure");
            return Err(MemoryError::storage(self.inner.name(), "injected commit failure"));
        }
        self.native()?.commit(transaction_id).await
    }

    async fn rollback(&self, transaction_id: &str) -> Result<()> {
        self.native()?.rollback(transaction_id).await
    }

    fn active_transaction(&self) -> Option<String> {
        self.inner
            .as_transactional()
            .and_then(|native| native.active_transaction())
    }
}
