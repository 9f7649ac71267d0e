//! Top-level facade over the registry, cache, router and sync manager.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata_memory::{HashEmbedder, MemoryManager, QueryStrategy, VectorMemoryStore};
//!
//! let manager = MemoryManager::builder()
//!     .with_backend("vec", Arc::new(VectorMemoryStore::new("vec", Arc::new(HashEmbedder::default()))))
//!     .build()?;
//!
//! let id = manager.store("vec", MemoryItem::new(MemoryType::Working, "hello")).await?;
//! let results = manager.route_query("hello", QueryStrategy::Federated, None).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use strata_cache::{CacheConfig, CacheStats, TieredCache};
use strata_config::{Discovery, RouterConfig, StrataConfig, SyncConfig};
use strata_types::{MemoryItem, MemoryType, MemoryVector, ScoredVector, SearchHit};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::build_backend;
use crate::backend::{CollectionStats, MemoryStore};
use crate::embedding::SharedEmbedder;
use crate::error::{MemoryError, Result};
use crate::recovery::{LoggedOperation, MemorySnapshot, RecoveryManager, RecoveryReport};
use crate::registry::{BackendEntry, BackendRegistry, CallPolicy};
use crate::retry::RetryConfig;
use crate::router::{QueryRouter, QueryStrategy, RouteRequest, RoutedResults};
use crate::sync::{
    ConflictRecord, FlushReport, SyncManager, SyncReport, SyncStats, Transaction,
    TransactionReport, TxOperation,
};
use crate::validation::{ValidationError, validate_item, validate_update};

/// Separates collection and id in item cache keys.
const KEY_SEPARATOR: char = '\u{1f}';

fn cache_key(collection: &str, id: &str) -> String {
    format!("{collection}{KEY_SEPARATOR}{id}")
}

fn collection_prefix(collection: &str) -> String {
    format!("{collection}{KEY_SEPARATOR}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`MemoryManager`].
#[derive(Default)]
pub struct MemoryManagerBuilder {
    backends: Vec<(String, Arc<dyn MemoryStore>)>,
    cache: CacheConfig,
    routes: BTreeMap<MemoryType, String>,
    default_backend: Option<String>,
    retry: Option<RetryConfig>,
    router: RouterConfig,
    sync: SyncConfig,
    recovery: Option<Arc<RecoveryManager>>,
}

impl MemoryManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. Registration order breaks merge ties.
    pub fn with_backend(mut self, name: impl Into<String>, store: Arc<dyn MemoryStore>) -> Self {
        self.backends.push((name.into(), store));
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Route writes of `memory_type` to `backend` in `store_by_type`.
    pub fn with_route(mut self, memory_type: MemoryType, backend: impl Into<String>) -> Self {
        self.routes.insert(memory_type, backend.into());
        self
    }

    pub fn with_default_backend(mut self, backend: impl Into<String>) -> Self {
        self.default_backend = Some(backend.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Deadline applied to each backend call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.router.call_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_router_config(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    pub fn with_sync_config(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Log every item write and allow snapshots and recovery.
    pub fn with_recovery(mut self, recovery: Arc<RecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn build(self) -> Result<MemoryManager> {
        let registry = Arc::new(BackendRegistry::new());
        for (name, store) in self.backends {
            registry.register(name, store)?;
        }

        for backend in self.routes.values().chain(self.default_backend.iter()) {
            if !registry.contains(backend) {
                return Err(MemoryError::BackendNotFound(backend.clone()));
            }
        }

        let policy = CallPolicy::new(
            self.router.call_timeout(),
            self.retry.unwrap_or_else(RetryConfig::query),
        );
        let router = QueryRouter::new(
            Arc::clone(&registry),
            policy.clone(),
            self.router,
            self.routes.clone(),
        );
        let sync = SyncManager::new(Arc::clone(&registry), policy.clone());

        info!(
            backends = ?registry.names(),
            cache_capacity = self.cache.effective_capacity(),
            recovery = ?self.recovery.as_ref().map(|r| r.dir()),
            "Memory manager ready"
        );
        Ok(MemoryManager {
            registry,
            cache: TieredCache::new(self.cache),
            router,
            sync,
            policy,
            type_table: self.routes,
            default_backend: self.default_backend,
            sync_config: self.sync,
            recovery: self.recovery,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Single entry point for storing, reading, routing and synchronizing
/// memory across backends.
///
/// Reads go through a bounded LRU cache keyed by `(collection, id)`. Writes
/// invalidate the cached entry and any routed results involving the
/// collection.
pub struct MemoryManager {
    registry: Arc<BackendRegistry>,
    cache: TieredCache<MemoryItem>,
    router: QueryRouter,
    sync: SyncManager,
    policy: CallPolicy,
    type_table: BTreeMap<MemoryType, String>,
    default_backend: Option<String>,
    sync_config: SyncConfig,
    recovery: Option<Arc<RecoveryManager>>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("backends", &self.registry.names())
            .field("cached", &self.cache.size())
            .field("type_table", &self.type_table)
            .field("default_backend", &self.default_backend)
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    pub fn builder() -> MemoryManagerBuilder {
        MemoryManagerBuilder::new()
    }

    /// Build every declared backend and wire the manager from configuration.
    pub fn from_config(config: &StrataConfig, embedder: SharedEmbedder) -> Result<Self> {
        config.validate()?;

        let mut builder = Self::builder();
        for (name, backend) in &config.backends {
            builder = builder.with_backend(name.clone(), build_backend(name, backend, &embedder)?);
        }

        let routing = config.routing_config();
        for (memory_type, backend) in routing.type_table()? {
            builder = builder.with_route(memory_type, backend);
        }
        if let Some(default_backend) = routing.default_backend {
            builder = builder.with_default_backend(default_backend);
        }

        let cache = config.cache_config();
        let mut cache_config = CacheConfig::new().with_capacity(cache.capacity);
        if let Some(ttl) = cache.ttl() {
            cache_config = cache_config.with_ttl(ttl);
        }

        if let Some(recovery) = &config.recovery {
            let dir = recovery.resolved_dir().ok_or_else(|| {
                MemoryError::Recovery("no recovery directory configured or discoverable".into())
            })?;
            builder = builder.with_recovery(Arc::new(RecoveryManager::new(dir)?));
        }

        builder
            .with_cache(cache_config)
            .with_retry(RetryConfig::from(&config.retry_config()))
            .with_router_config(config.router_config())
            .with_sync_config(config.sync_config())
            .build()
    }

    /// Discover layered config files and build from the merged result.
    /// Skipped layers are logged.
    pub fn discover(discovery: &Discovery, embedder: SharedEmbedder) -> Result<Self> {
        let found = discovery.load()?;
        for warning in found.warnings() {
            warn!("{warning}");
        }
        debug!(files = ?found.merged_files(), "Loaded configuration");
        Self::from_config(&found.config, embedder)
    }

    // ── item operations ─────────────────────────────────────────────────────

    /// Store `item` in `collection`. An empty id is replaced by a fresh one
    /// before the call so retries stay idempotent.
    pub async fn store(&self, collection: &str, mut item: MemoryItem) -> Result<String> {
        let entry = self.registry.get(collection)?;
        validate_item(&item)?;
        item.ensure_id();

        let id = entry
            .call(&self.policy, "store", |s| {
                let item = item.clone();
                async move { s.store(item).await }
            })
            .await?;

        self.invalidate_item(collection, &id);
        if self.recovery.is_some() {
            item.id = id.clone();
            self.log_write(collection, LoggedOperation::Store { item });
        }
        debug!(backend = %collection, item_id = %id, "Stored item");
        Ok(id)
    }

    /// Read through the cache.
    pub async fn retrieve(&self, collection: &str, id: &str) -> Result<Option<MemoryItem>> {
        let entry = self.registry.get(collection)?;
        let key = cache_key(collection, id);
        if let Some(item) = self.cache.get(&key) {
            return Ok(Some(item));
        }

        let token = self.cache.read_token();
        let item = entry
            .call(&self.policy, "retrieve", |s| {
                let id = id.to_string();
                async move { s.retrieve(&id).await }
            })
            .await?;
        if let Some(item) = &item {
            self.cache.put_if_unchanged(key, item.clone(), token);
        }
        Ok(item)
    }

    pub async fn search(&self, collection: &str, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let entry = self.registry.get(collection)?;
        let mut hits = entry
            .call(&self.policy, "search", |s| {
                let query = query.to_string();
                async move { s.search(&query, limit).await }
            })
            .await?;
        for hit in &mut hits {
            hit.backend = collection.to_string();
        }
        Ok(hits)
    }

    /// Replace the content of an existing item. Returns `false` when `id`
    /// does not exist.
    pub async fn update(&self, collection: &str, id: &str, item: MemoryItem) -> Result<bool> {
        let entry = self.registry.get(collection)?;
        validate_update(id, &item)?;

        let updated = entry
            .call(&self.policy, "update", |s| {
                let (id, item) = (id.to_string(), item.clone());
                async move { s.update(&id, item).await }
            })
            .await?;

        self.invalidate_item(collection, id);
        if updated {
            let id = id.to_string();
            self.log_write(collection, LoggedOperation::Update { id, item });
        }
        Ok(updated)
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let entry = self.registry.get(collection)?;
        let deleted = entry
            .call(&self.policy, "delete", |s| {
                let id = id.to_string();
                async move { s.delete(&id).await }
            })
            .await?;

        self.invalidate_item(collection, id);
        if deleted {
            let id = id.to_string();
            self.log_write(collection, LoggedOperation::Delete { id });
        }
        Ok(deleted)
    }

    pub async fn list_keys(&self, collection: &str) -> Result<Vec<String>> {
        let entry = self.registry.get(collection)?;
        entry
            .call(&self.policy, "list_keys", |s| async move { s.list_keys().await })
            .await
    }

    /// Write `item` to the backend its memory type routes to.
    /// Returns `(backend, id)`.
    pub async fn store_by_type(&self, item: MemoryItem) -> Result<(String, String)> {
        let backend = self.backend_for_type(item.memory_type)?.to_string();
        let id = self.store(&backend, item).await?;
        Ok((backend, id))
    }

    /// Backend that `store_by_type` uses for `memory_type`.
    pub fn backend_for_type(&self, memory_type: MemoryType) -> Result<&str> {
        self.type_table
            .get(&memory_type)
            .or(self.default_backend.as_ref())
            .map(String::as_str)
            .ok_or_else(|| ValidationError::UnroutableType(memory_type).into())
    }

    // ── vector operations ───────────────────────────────────────────────────

    pub async fn store_vector(&self, collection: &str, vector: MemoryVector) -> Result<String> {
        let entry = self.vector_entry(collection)?;
        let name = collection.to_string();
        let id = entry
            .call(&self.policy, "store_vector", |s| {
                let (vector, name) = (vector.clone(), name.clone());
                async move {
                    match s.as_vector_store() {
                        Some(v) => v.store_vector(vector).await,
                        None => Err(ValidationError::NotVectorCapable(name).into()),
                    }
                }
            })
            .await?;
        self.invalidate_item(collection, &id);
        Ok(id)
    }

    pub async fn similarity_search(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredVector>> {
        let entry = self.vector_entry(collection)?;
        let name = collection.to_string();
        entry
            .call(&self.policy, "similarity_search", |s| {
                let (embedding, name) = (embedding.to_vec(), name.clone());
                async move {
                    match s.as_vector_store() {
                        Some(v) => v.similarity_search(&embedding, top_k).await,
                        None => Err(ValidationError::NotVectorCapable(name).into()),
                    }
                }
            })
            .await
    }

    pub async fn collection_stats(&self, collection: &str) -> Result<CollectionStats> {
        let entry = self.vector_entry(collection)?;
        let name = collection.to_string();
        entry
            .call(&self.policy, "collection_stats", |s| {
                let name = name.clone();
                async move {
                    match s.as_vector_store() {
                        Some(v) => v.collection_stats().await,
                        None => Err(ValidationError::NotVectorCapable(name).into()),
                    }
                }
            })
            .await
    }

    fn vector_entry(&self, collection: &str) -> Result<Arc<BackendEntry>> {
        let entry = self.registry.get(collection)?;
        if !entry.capabilities().vector {
            return Err(ValidationError::NotVectorCapable(collection.to_string()).into());
        }
        Ok(entry)
    }

    // ── routing ─────────────────────────────────────────────────────────────

    /// Route a query with the router's default limit.
    pub async fn route_query(
        &self,
        query: &str,
        strategy: QueryStrategy,
        stores: Option<&[&str]>,
    ) -> Result<RoutedResults> {
        let mut request = RouteRequest::new(query, strategy);
        if let Some(stores) = stores {
            request = request.with_stores(stores.iter().copied());
        }
        self.router.route(request).await
    }

    pub async fn route(&self, request: RouteRequest) -> Result<RoutedResults> {
        self.router.route(request).await
    }

    pub fn clear_query_cache(&self) {
        self.router.clear_cache();
    }

    // ── synchronization ─────────────────────────────────────────────────────

    pub async fn synchronize(&self, source: &str, target: &str) -> Result<SyncReport> {
        let report = self.sync.synchronize(source, target).await?;
        if report.applied_count > 0 {
            self.invalidate_collection(target);
        }
        self.router.invalidate_backends(&[source, target]);
        Ok(report)
    }

    pub async fn synchronize_bidirectional(&self, a: &str, b: &str) -> Result<(SyncReport, SyncReport)> {
        let forward = self.synchronize(a, b).await?;
        let backward = self.synchronize(b, a).await?;
        Ok((forward, backward))
    }

    /// Apply `operations` all-or-nothing across `stores`.
    pub async fn cross_store_transaction(
        &self,
        operations: Vec<TxOperation>,
        stores: &[&str],
    ) -> Result<TransactionReport> {
        // Also before: a cancelled caller never reaches the second pass.
        self.invalidate_stores(stores);
        let result = self.sync.coordinator().execute(operations, stores).await;
        self.invalidate_stores(stores);
        result
    }

    /// Open a transaction for step-by-step use. Cached reads of the
    /// participants are dropped up front; ordinary calls to them time out
    /// until the transaction ends.
    pub async fn begin_transaction(&self, stores: &[&str]) -> Result<Transaction> {
        let tx = self.sync.coordinator().begin(stores).await?;
        self.invalidate_stores(stores);
        Ok(tx)
    }

    /// Queue a write for `store` to be propagated to every backend on the
    /// next [`flush_queue`](Self::flush_queue). Returns the item's id.
    pub fn queue_update(&self, store: &str, item: MemoryItem) -> Result<String> {
        self.sync.queue_update(store, item)
    }

    pub fn queued_updates(&self) -> usize {
        self.sync.queued_updates()
    }

    /// Write and propagate every queued update.
    pub async fn flush_queue(&self) -> Result<FlushReport> {
        let result = self.sync.flush_queue().await;
        // Even a failed flush may have written some copies.
        self.clear_cache();
        result
    }

    fn invalidate_stores(&self, stores: &[&str]) {
        for store in stores {
            self.invalidate_collection(store);
        }
        self.router.invalidate_backends(stores);
    }

    /// Replicate `pairs` every `interval` until `shutdown` fires.
    ///
    /// Each tick first flushes the update queue. A failing round is logged
    /// and retried on the next tick.
    pub fn spawn_periodic_sync(
        self: &Arc<Self>,
        pairs: Vec<(String, String)>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            info!(pairs = pairs.len(), ?interval, "Periodic sync started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if manager.queued_updates() > 0
                            && let Err(err) = manager.flush_queue().await
                        {
                            warn!(error = %err, "Queued update flush failed");
                        }
                        for (source, target) in &pairs {
                            if let Err(err) = manager.synchronize(source, target).await {
                                warn!(source = %source, target = %target, error = %err, "Periodic sync failed");
                            }
                        }
                    }
                }
            }
            info!("Periodic sync stopped");
        })
    }

    /// [`spawn_periodic_sync`](Self::spawn_periodic_sync) with the configured
    /// pairs and interval.
    pub fn spawn_configured_sync(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let pairs = self
            .sync_config
            .pairs
            .iter()
            .map(|p| (p.source.clone(), p.target.clone()))
            .collect();
        self.spawn_periodic_sync(pairs, self.sync_config.interval(), shutdown)
    }

    pub fn conflict_log(&self) -> Vec<ConflictRecord> {
        self.sync.conflict_log()
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    // ── recovery ────────────────────────────────────────────────────────────

    pub fn recovery(&self) -> Option<&Arc<RecoveryManager>> {
        self.recovery.as_ref()
    }

    /// Snapshot `collection` while no other call can write to it.
    pub async fn create_snapshot(&self, collection: &str) -> Result<MemorySnapshot> {
        let recovery = self.require_recovery()?;
        let entry = self.registry.get(collection)?;
        let _exclusive = entry.lock_exclusive().await;
        recovery.create_snapshot(collection, entry.store().as_ref()).await
    }

    /// Rebuild `collection` from its latest snapshot and the operations
    /// logged since.
    pub async fn recover(&self, collection: &str) -> Result<RecoveryReport> {
        let recovery = self.require_recovery()?;
        let entry = self.registry.get(collection)?;
        let result = {
            let _exclusive = entry.lock_exclusive().await;
            recovery.recover_store(collection, entry.store().as_ref()).await
        };
        self.invalidate_stores(&[collection]);
        result
    }

    fn require_recovery(&self) -> Result<&Arc<RecoveryManager>> {
        self.recovery
            .as_ref()
            .ok_or_else(|| MemoryError::Recovery("recovery is not enabled".into()))
    }

    /// The write already happened; a log failure is reported, not returned.
    fn log_write(&self, collection: &str, operation: LoggedOperation) {
        if let Some(recovery) = &self.recovery
            && let Err(err) = recovery.log_operation(collection, operation)
        {
            warn!(backend = %collection, error = %err, "Operation log append failed");
        }
    }

    // ── registry ────────────────────────────────────────────────────────────

    pub fn register_backend(&self, name: impl Into<String>, store: Arc<dyn MemoryStore>) -> Result<()> {
        self.registry.register(name, store)?;
        self.router.clear_cache();
        Ok(())
    }

    pub fn unregister_backend(&self, name: &str) -> Result<()> {
        self.registry.unregister(name)?;
        self.invalidate_collection(name);
        self.router.clear_cache();
        self.sync.forget_backend(name);
        Ok(())
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.registry.names()
    }

    // ── cache ───────────────────────────────────────────────────────────────

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached item and routed result.
    pub fn clear_cache(&self) {
        self.cache.clear();
        self.router.clear_cache();
    }

    /// Whether `(collection, id)` is currently cached.
    pub fn is_cached(&self, collection: &str, id: &str) -> bool {
        self.cache.contains(&cache_key(collection, id))
    }

    fn invalidate_item(&self, collection: &str, id: &str) {
        self.cache.remove(&cache_key(collection, id));
        self.router.invalidate_backends(&[collection]);
    }

    fn invalidate_collection(&self, collection: &str) {
        let prefix = collection_prefix(collection);
        let dropped = self.cache.invalidate_where(|key, _| key.starts_with(&prefix));
        if dropped > 0 {
            debug!(backend = %collection, dropped, "Invalidated cached items");
        }
    }
}
