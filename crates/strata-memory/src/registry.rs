//! Registry of named backends and the call policy applied to each call.
//!
//! The registry is read-mostly. Lookups clone `Arc` handles out of a short
//! `parking_lot` read lock so the lock is never held across an await.
//!
//! Every entry carries an async gate. Ordinary calls hold it shared for the
//! duration of the backend call; the transaction coordinator holds it
//! exclusively from snapshot to commit or rollback, which keeps partial
//! transaction state invisible to other callers.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock as AsyncRwLock};
use tracing::{debug, info};

use crate::backend::{Capabilities, MemoryStore};
use crate::error::{MemoryError, Result};
use crate::retry::{RetryConfig, retry};
use crate::validation::ValidationError;

/// Deadline and retry policy for one backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry: RetryConfig::query(),
        }
    }
}

impl CallPolicy {
    pub fn new(timeout: Duration, retry: RetryConfig) -> Self {
        Self { timeout, retry }
    }

    /// Same deadline, different retry policy.
    pub fn with_retry(&self, retry: RetryConfig) -> Self {
        Self {
            timeout: self.timeout,
            retry,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry
// ─────────────────────────────────────────────────────────────────────────────

/// A registered backend.
pub struct BackendEntry {
    name: String,
    store: Arc<dyn MemoryStore>,
    capabilities: Capabilities,
    order: u64,
    gate: Arc<AsyncRwLock<()>>,
}

impl std::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEntry")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl BackendEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Registration sequence number; lower registered earlier.
    pub fn order(&self) -> u64 {
        self.order
    }

    /// Call the backend under the shared gate.
    ///
    /// Waiting for the gate counts against the call deadline, so a backend
    /// held by a transaction times out like a slow one.
    pub async fn call<T, F, Fut>(&self, policy: &CallPolicy, operation: &str, f: F) -> Result<T>
    where
        F: FnMut(Arc<dyn MemoryStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Ok(_shared) = tokio::time::timeout(policy.timeout, self.gate.read()).await else {
            debug!(backend = %self.name, operation, "Gate busy past the call deadline");
            return Err(MemoryError::Timeout {
                backend: self.name.clone(),
                after: policy.timeout,
            });
        };
        self.invoke(policy, operation, f).await
    }

    /// Call the backend without touching the gate. Only valid while the
    /// caller already holds it exclusively.
    pub(crate) async fn invoke<T, F, Fut>(
        &self,
        policy: &CallPolicy,
        operation: &str,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<dyn MemoryStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let label = format!("{}.{}", self.name, operation);
        let deadline = policy.timeout;
        retry(&label, &policy.retry, || {
            let call = f(Arc::clone(&self.store));
            async move {
                match tokio::time::timeout(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => Err(MemoryError::Timeout {
                        backend: self.name.clone(),
                        after: deadline,
                    }),
                }
            }
        })
        .await
    }

    /// Take the gate exclusively until the returned guard is dropped.
    pub(crate) async fn lock_exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.gate).write_owned().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Name → backend map with stable registration order.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    entries: RwLock<Vec<Arc<BackendEntry>>>,
    next_order: AtomicU64,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `store` under `name`.
    pub fn register(
        &self,
        name: impl Into<String>,
        store: Arc<dyn MemoryStore>,
    ) -> Result<Arc<BackendEntry>> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::InvalidArgument("backend name is empty".into()).into());
        }

        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.name == name) {
            return Err(MemoryError::DuplicateBackend(name));
        }

        let entry = Arc::new(BackendEntry {
            capabilities: store.capabilities(),
            name,
            store,
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
            gate: Arc::new(AsyncRwLock::new(())),
        });
        entries.push(Arc::clone(&entry));
        info!(
            backend = %entry.name,
            vector = entry.capabilities.vector,
            transactional = entry.capabilities.transactional,
            "Backend registered"
        );
        Ok(entry)
    }

    /// Remove a backend. Calls already holding its entry run to completion.
    pub fn unregister(&self, name: &str) -> Result<Arc<BackendEntry>> {
        let mut entries = self.entries.write();
        let index = entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| MemoryError::BackendNotFound(name.to_string()))?;
        let entry = entries.remove(index);
        info!(backend = %name, "Backend unregistered");
        Ok(entry)
    }

    pub fn get(&self, name: &str) -> Result<Arc<BackendEntry>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| {
                debug!(backend = %name, "Lookup for unregistered backend");
                MemoryError::BackendNotFound(name.to_string())
            })
    }

    /// Resolve several names, failing on the first unknown one.
    pub fn get_many<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<BackendEntry>>> {
        names.iter().map(|n| self.get(n.as_ref())).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().iter().any(|e| e.name == name)
    }

    /// Every entry, in registration order.
    pub fn all(&self) -> Vec<Arc<BackendEntry>> {
        self.entries.read().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
