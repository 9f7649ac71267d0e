//! Query routing across registered backends.
//!
//! | strategy        | targets                                   | failure handling                 |
//! |-----------------|-------------------------------------------|----------------------------------|
//! | `direct`        | exactly one named backend                 | any error fails the request      |
//! | `cross-store`   | caller-named subset, concurrently         | skipped with a warning           |
//! | `cascading`     | priority order, first non-empty result    | timeout fails, other errors fall through |
//! | `federated`     | every registered backend, concurrently    | skipped with a warning           |
//! | `context-aware` | backends picked by memory type or hints   | as federated                     |
//!
//! Fan-out strategies fail only when every targeted backend fails.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use strata_cache::{CacheConfig, TieredCache};
use strata_config::RouterConfig;
use strata_types::{MemoryType, SearchHit};
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};
use crate::registry::{BackendEntry, BackendRegistry, CallPolicy};
use crate::validation::ValidationError;

// ─────────────────────────────────────────────────────────────────────────────
// Strategy
// ─────────────────────────────────────────────────────────────────────────────

/// How a query is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryStrategy {
    Direct,
    CrossStore,
    Cascading,
    Federated,
    ContextAware,
}

impl QueryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::CrossStore => "cross-store",
            Self::Cascading => "cascading",
            Self::Federated => "federated",
            Self::ContextAware => "context-aware",
        }
    }

    /// Whether results of this strategy go through the query cache.
    fn cacheable(&self) -> bool {
        matches!(self, Self::CrossStore | Self::Federated | Self::ContextAware)
    }
}

impl fmt::Display for QueryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "direct" => Ok(Self::Direct),
            "cross-store" => Ok(Self::CrossStore),
            "cascading" => Ok(Self::Cascading),
            "federated" => Ok(Self::Federated),
            "context-aware" => Ok(Self::ContextAware),
            _ => Err(ValidationError::InvalidArgument(format!(
                "unknown query strategy '{s}'"
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request / Response
// ─────────────────────────────────────────────────────────────────────────────

/// A routed query.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub query: String,
    pub strategy: QueryStrategy,
    /// Explicit targets. Required for `direct` and `cross-store`; overrides
    /// the configured order for `cascading`.
    pub stores: Option<Vec<String>>,
    /// Maximum merged hits. Falls back to the router's default limit.
    pub limit: Option<usize>,
    pub memory_type: Option<MemoryType>,
    pub hints: Vec<String>,
}

impl RouteRequest {
    pub fn new(query: impl Into<String>, strategy: QueryStrategy) -> Self {
        Self {
            query: query.into(),
            strategy,
            stores: None,
            limit: None,
            memory_type: None,
            hints: Vec::new(),
        }
    }

    pub fn with_stores<I, S>(mut self, stores: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stores = Some(stores.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Failed,
    TimedOut,
}

/// A backend that was skipped while answering a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendWarning {
    pub backend: String,
    pub kind: WarningKind,
    pub message: String,
}

impl BackendWarning {
    fn from_error(backend: &str, error: &MemoryError) -> Self {
        Self {
            backend: backend.to_string(),
            kind: if error.is_timeout() {
                WarningKind::TimedOut
            } else {
                WarningKind::Failed
            },
            message: error.to_string(),
        }
    }
}

/// Merged answer to a routed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedResults {
    pub strategy: QueryStrategy,
    /// Backends the query was resolved to, in registration order.
    pub stores: Vec<String>,
    pub hits: Vec<SearchHit>,
    pub warnings: Vec<BackendWarning>,
    /// Some targeted backend did not contribute.
    pub partial: bool,
    pub from_cache: bool,
}

impl RoutedResults {
    fn empty(strategy: QueryStrategy, stores: Vec<String>) -> Self {
        Self {
            strategy,
            stores,
            hits: Vec::new(),
            warnings: Vec::new(),
            partial: false,
            from_cache: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.item.id.as_str()).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Dispatches queries to backends and merges their answers.
pub struct QueryRouter {
    registry: Arc<BackendRegistry>,
    policy: CallPolicy,
    config: RouterConfig,
    type_table: BTreeMap<MemoryType, String>,
    cache: TieredCache<RoutedResults>,
}

impl fmt::Debug for QueryRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRouter")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .field("cached", &self.cache.size())
            .finish_non_exhaustive()
    }
}

impl QueryRouter {
    pub fn new(
        registry: Arc<BackendRegistry>,
        policy: CallPolicy,
        config: RouterConfig,
        type_table: BTreeMap<MemoryType, String>,
    ) -> Self {
        let mut cache_config = CacheConfig::new().with_capacity(config.query_cache_capacity);
        if let Some(ttl) = config.query_cache_ttl() {
            cache_config = cache_config.with_ttl(ttl);
        }
        Self {
            registry,
            policy,
            config,
            type_table,
            cache: TieredCache::new(cache_config),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Route a query.
    pub async fn route(&self, request: RouteRequest) -> Result<RoutedResults> {
        let limit = request.limit.unwrap_or(self.config.default_limit);
        if limit == 0 {
            return Err(ValidationError::InvalidArgument("limit must be positive".into()).into());
        }
        debug!(
            strategy = %request.strategy,
            query = %request.query,
            limit,
            "Routing query"
        );

        match request.strategy {
            QueryStrategy::Direct => self.route_direct(&request, limit).await,
            QueryStrategy::Cascading => self.route_cascading(&request, limit).await,
            QueryStrategy::CrossStore => {
                let stores = match request.stores.as_deref() {
                    Some(stores) if !stores.is_empty() => stores,
                    _ => {
                        return Err(ValidationError::InvalidArgument(
                            "cross-store queries need at least one store".into(),
                        )
                        .into());
                    }
                };
                let targets = self.registry.get_many(stores)?;
                self.fan_out_cached(request.strategy, targets, &request.query, limit)
                    .await
            }
            QueryStrategy::Federated => {
                let targets = self.registry.all();
                self.fan_out_cached(request.strategy, targets, &request.query, limit)
                    .await
            }
            QueryStrategy::ContextAware => {
                let mut targets = self.select_by_context(&request);
                if targets.is_empty() {
                    debug!(query = %request.query, "No context match, degrading to federated");
                    targets = self.registry.all();
                }
                self.fan_out_cached(request.strategy, targets, &request.query, limit)
                    .await
            }
        }
    }

    /// Drop cached results that involved any of `backends`.
    pub fn invalidate_backends(&self, backends: &[&str]) -> usize {
        self.cache
            .invalidate_where(|_, results| results.stores.iter().any(|s| backends.contains(&s.as_str())))
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cached_queries(&self) -> usize {
        self.cache.size()
    }

    // ── strategies ──────────────────────────────────────────────────────────

    async fn route_direct(&self, request: &RouteRequest, limit: usize) -> Result<RoutedResults> {
        let name = match request.stores.as_deref() {
            Some([name]) => name,
            _ => {
                return Err(ValidationError::InvalidArgument(
                    "direct queries need exactly one store".into(),
                )
                .into());
            }
        };
        let entry = self.registry.get(name)?;
        let hits = self.search(&entry, &request.query, limit).await?;

        let mut results = RoutedResults::empty(request.strategy, vec![entry.name().to_string()]);
        results.hits = merge(vec![(entry.order(), hits)], limit);
        Ok(results)
    }

    async fn route_cascading(&self, request: &RouteRequest, limit: usize) -> Result<RoutedResults> {
        let order = self.cascade_order(request)?;
        let mut warnings = Vec::new();
        let mut attempted = Vec::new();

        for entry in order {
            attempted.push(entry.name().to_string());
            match self.search(&entry, &request.query, limit).await {
                Ok(hits) if !hits.is_empty() => {
                    debug!(backend = %entry.name(), hits = hits.len(), "Cascade answered");
                    let mut results =
                        RoutedResults::empty(request.strategy, vec![entry.name().to_string()]);
                    results.hits = merge(vec![(entry.order(), hits)], limit);
                    results.partial = !warnings.is_empty();
                    results.warnings = warnings;
                    return Ok(results);
                }
                Ok(_) => {
                    debug!(backend = %entry.name(), "Cascade step empty, falling through");
                }
                Err(err) if err.is_timeout() => {
                    warn!(backend = %entry.name(), error = %err, "Cascade step timed out");
                    return Err(err);
                }
                Err(err) => {
                    warn!(backend = %entry.name(), error = %err, "Cascade step failed, falling through");
                    warnings.push(BackendWarning::from_error(entry.name(), &err));
                }
            }
        }

        if !attempted.is_empty() && warnings.len() == attempted.len() {
            return Err(all_failed(request.strategy, &warnings));
        }

        let mut results = RoutedResults::empty(request.strategy, attempted);
        results.partial = !warnings.is_empty();
        results.warnings = warnings;
        Ok(results)
    }

    async fn fan_out_cached(
        &self,
        strategy: QueryStrategy,
        mut targets: Vec<Arc<BackendEntry>>,
        query: &str,
        limit: usize,
    ) -> Result<RoutedResults> {
        targets.sort_by_key(|e| e.order());
        targets.dedup_by(|a, b| a.name() == b.name());
        let stores: Vec<String> = targets.iter().map(|e| e.name().to_string()).collect();

        let key = cache_key(strategy, &stores, limit, query);
        if strategy.cacheable()
            && let Some(mut cached) = self.cache.get(&key)
        {
            debug!(strategy = %strategy, "Query cache hit");
            cached.from_cache = true;
            return Ok(cached);
        }
        let token = self.cache.read_token();

        let results = self.fan_out(strategy, targets, stores, query, limit).await?;

        if strategy.cacheable() && !results.partial {
            self.cache.put_if_unchanged(key, results.clone(), token);
        }
        Ok(results)
    }

    async fn fan_out(
        &self,
        strategy: QueryStrategy,
        targets: Vec<Arc<BackendEntry>>,
        stores: Vec<String>,
        query: &str,
        limit: usize,
    ) -> Result<RoutedResults> {
        if targets.is_empty() {
            return Ok(RoutedResults::empty(strategy, stores));
        }

        let outcomes = join_all(targets.iter().map(|entry| async move {
            (entry, self.search(entry, query, limit).await)
        }))
        .await;

        let mut batches = Vec::with_capacity(outcomes.len());
        let mut warnings = Vec::new();
        for (entry, outcome) in outcomes {
            match outcome {
                Ok(hits) => batches.push((entry.order(), hits)),
                Err(err) => {
                    warn!(backend = %entry.name(), strategy = %strategy, error = %err, "Skipping backend");
                    warnings.push(BackendWarning::from_error(entry.name(), &err));
                }
            }
        }

        if batches.is_empty() {
            return Err(all_failed(strategy, &warnings));
        }

        let mut results = RoutedResults::empty(strategy, stores);
        results.hits = merge(batches, limit);
        results.partial = !warnings.is_empty();
        results.warnings = warnings;
        Ok(results)
    }

    // ── helpers ─────────────────────────────────────────────────────────────

    async fn search(&self, entry: &BackendEntry, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let mut hits = entry
            .call(&self.policy, "search", |store| {
                let query = query.to_string();
                async move { store.search(&query, limit).await }
            })
            .await?;
        for hit in &mut hits {
            hit.backend = entry.name().to_string();
        }
        Ok(hits)
    }

    fn cascade_order(&self, request: &RouteRequest) -> Result<Vec<Arc<BackendEntry>>> {
        if let Some(stores) = request.stores.as_deref()
            && !stores.is_empty()
        {
            return self.registry.get_many(stores);
        }
        if !self.config.cascade_order.is_empty() {
            return Ok(self
                .config
                .cascade_order
                .iter()
                .filter_map(|name| self.registry.get(name).ok())
                .collect());
        }
        Ok(self.registry.all())
    }

    fn select_by_context(&self, request: &RouteRequest) -> Vec<Arc<BackendEntry>> {
        let mut names: Vec<&str> = Vec::new();
        if let Some(memory_type) = request.memory_type
            && let Some(backend) = self.type_table.get(&memory_type)
        {
            names.push(backend);
        }
        for hint in &request.hints {
            match self.config.hints.get(hint) {
                Some(backends) => names.extend(backends.iter().map(String::as_str)),
                None => names.push(hint),
            }
        }
        names
            .into_iter()
            .filter_map(|name| self.registry.get(name).ok())
            .collect()
    }
}

fn cache_key(strategy: QueryStrategy, stores: &[String], limit: usize, query: &str) -> String {
    format!("{strategy}\u{1f}{}\u{1f}{limit}\u{1f}{query}", stores.join(","))
}

fn all_failed(strategy: QueryStrategy, warnings: &[BackendWarning]) -> MemoryError {
    MemoryError::AllBackendsFailed {
        strategy: strategy.to_string(),
        failures: warnings
            .iter()
            .map(|w| format!("{}: {}", w.backend, w.message))
            .collect(),
    }
}

/// Merge per-backend hits.
///
/// Duplicates share an id, or a content fingerprint across different
/// backends. Items from one backend with distinct ids are never collapsed.
/// The version with the latest `updated_at` survives; on equal timestamps the earlier-registered
/// backend wins. Survivors are ranked by score, then registration order,
/// then id.
pub(crate) fn merge(batches: Vec<(u64, Vec<SearchHit>)>, limit: usize) -> Vec<SearchHit> {
    let mut merged: Vec<(u64, SearchHit)> = Vec::new();

    for (order, hits) in batches {
        for hit in hits {
            let fingerprint = hit.item.fingerprint();
            let existing = merged.iter().position(|(kept_order, kept)| {
                kept.item.id == hit.item.id
                    || (*kept_order != order && kept.item.fingerprint() == fingerprint)
            });
            match existing {
                Some(index) => {
                    let (kept_order, kept) = &merged[index];
                    let newer = hit.item.updated_at > kept.item.updated_at;
                    let tie_wins =
                        hit.item.updated_at == kept.item.updated_at && order < *kept_order;
                    if newer || tie_wins {
                        merged[index] = (order, hit);
                    }
                }
                None => merged.push((order, hit)),
            }
        }
    }

    merged.sort_by(|(order_a, a), (order_b, b)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| order_a.cmp(order_b))
            .then_with(|| a.item.id.cmp(&b.item.id))
    });
    merged.truncate(limit);
    merged.into_iter().map(|(_, hit)| hit).collect()
}
