//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [cache]                  # manager read cache
//! [router]                 # deadlines, cascade order, query cache, hints
//! [sync]                   # periodic replication pairs
//! [retry]                  # backoff for transient storage errors
//! [routing]                # memory type -> backend dispatch table
//! [backends.<name>]        # backend declarations
//! [recovery]               # snapshot and operation log directory
//! [logging]                # subscriber settings for embedding applications
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_types::MemoryType;

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Manager read cache.
    pub cache: Option<CacheSection>,

    /// Query router tuning.
    pub router: Option<RouterConfig>,

    /// Periodic synchronization.
    pub sync: Option<SyncConfig>,

    /// Retry policy for transient backend failures.
    pub retry: Option<RetrySection>,

    /// Memory-type dispatch table.
    pub routing: Option<RoutingConfig>,

    /// Declared backends, registered in name order.
    pub backends: BTreeMap<String, BackendConfig>,

    /// Snapshot and operation log storage.
    pub recovery: Option<RecoveryConfig>,

    /// Logging settings.
    pub logging: Option<LoggingConfig>,
}

impl StrataConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: StrataConfig) {
        if other.cache.is_some() {
            self.cache = other.cache;
        }

        if other.router.is_some() {
            self.router = other.router;
        }

        if other.sync.is_some() {
            self.sync = other.sync;
        }

        if other.retry.is_some() {
            self.retry = other.retry;
        }

        if other.routing.is_some() {
            self.routing = other.routing;
        }

        for (name, backend) in other.backends {
            self.backends.insert(name, backend);
        }

        if other.recovery.is_some() {
            self.recovery = other.recovery;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Resolve relative file paths (SQLite databases, the recovery
    /// directory) against `base`, the directory of the file they came from.
    pub fn anchor_paths(&mut self, base: &Path) {
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        for backend in self.backends.values_mut() {
            if let Some(path) = &mut backend.path {
                anchor(path);
            }
        }
        if let Some(dir) = self.recovery.as_mut().and_then(|r| r.dir.as_mut()) {
            anchor(dir);
        }
    }

    /// Cache section, or defaults.
    pub fn cache_config(&self) -> CacheSection {
        self.cache.clone().unwrap_or_default()
    }

    /// Router section, or defaults.
    pub fn router_config(&self) -> RouterConfig {
        self.router.clone().unwrap_or_default()
    }

    /// Sync section, or defaults.
    pub fn sync_config(&self) -> SyncConfig {
        self.sync.clone().unwrap_or_default()
    }

    /// Retry section, or defaults.
    pub fn retry_config(&self) -> RetrySection {
        self.retry.clone().unwrap_or_default()
    }

    /// Routing section, or an empty table.
    pub fn routing_config(&self) -> RoutingConfig {
        self.routing.clone().unwrap_or_default()
    }

    /// Check cross-references and value ranges.
    ///
    /// Every backend named by `[routing]`, `[router]` or `[sync]` must be
    /// declared under `[backends]`, routing keys must be memory types, and
    /// vector backends need a non-zero dimensionality.
    pub fn validate(&self) -> Result<()> {
        for (name, backend) in &self.backends {
            if backend.dimensions == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: format!("backends.{name}.dimensions"),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if let Some(routing) = &self.routing {
            routing.type_table()?;
            for (key, target) in &routing.types {
                self.require_backend(target, &format!("routing.types.{key}"))?;
            }
            if let Some(default) = &routing.default_backend {
                self.require_backend(default, "routing.default_backend")?;
            }
        }

        if let Some(router) = &self.router {
            for name in &router.cascade_order {
                self.require_backend(name, "router.cascade_order")?;
            }
            for (hint, targets) in &router.hints {
                for name in targets {
                    self.require_backend(name, &format!("router.hints.{hint}"))?;
                }
            }
        }

        if let Some(sync) = &self.sync {
            for pair in &sync.pairs {
                self.require_backend(&pair.source, "sync.pairs")?;
                self.require_backend(&pair.target, "sync.pairs")?;
            }
        }

        if let Some(retry) = &self.retry
            && !(retry.factor.is_finite() && retry.factor >= 1.0)
        {
            return Err(ConfigError::InvalidValue {
                field: "retry.factor".to_string(),
                reason: "must be a finite number of at least 1.0".to_string(),
            });
        }

        Ok(())
    }

    fn require_backend(&self, name: &str, context: &str) -> Result<()> {
        if self.backends.contains_key(name) {
            Ok(())
        } else {
            Err(ConfigError::UndefinedBackend {
                name: name.to_string(),
                context: context.to_string(),
            })
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// `[cache]` section for the manager's item cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Maximum number of cached items.
    pub capacity: usize,
    /// Idle TTL in seconds; unset means entries never expire.
    pub ttl_secs: Option<u64>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            ttl_secs: None,
        }
    }
}

impl CacheSection {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Router Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// `[router]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Deadline for a single backend call, in milliseconds.
    pub call_timeout_ms: u64,
    /// Result limit used when a caller does not pass one.
    pub default_limit: usize,
    /// Priority order for the cascading strategy.
    pub cascade_order: Vec<String>,
    /// Capacity of the routed-query cache.
    pub query_cache_capacity: usize,
    /// TTL of routed-query cache entries, in seconds.
    pub query_cache_ttl_secs: Option<u64>,
    /// Task hint -> backends, for context-aware routing.
    pub hints: BTreeMap<String, Vec<String>>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            default_limit: 10,
            cascade_order: Vec::new(),
            query_cache_capacity: 256,
            query_cache_ttl_secs: Some(300),
            hints: BTreeMap::new(),
        }
    }
}

impl RouterConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn query_cache_ttl(&self) -> Option<Duration> {
        self.query_cache_ttl_secs.map(Duration::from_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sync Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// `[sync]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between periodic synchronization rounds.
    pub interval_secs: u64,
    /// Ordered `(source, target)` pairs replicated on every round.
    pub pairs: Vec<SyncPair>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            pairs: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// One replication direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPair {
    pub source: String,
    pub target: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            factor: 2.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// `[routing]` section: which backend receives each memory type.
///
/// ```toml
/// [routing]
/// default_backend = "docs"
///
/// [routing.types]
/// WORKING = "vec"
/// relationship = "graph"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Backend for memory types without an explicit entry.
    pub default_backend: Option<String>,
    /// Memory type name -> backend name.
    pub types: BTreeMap<String, String>,
}

impl RoutingConfig {
    /// Parse the memory-type keys.
    pub fn type_table(&self) -> Result<BTreeMap<MemoryType, String>> {
        self.types
            .iter()
            .map(|(key, backend)| {
                key.parse::<MemoryType>()
                    .map(|t| (t, backend.clone()))
                    .map_err(|_| ConfigError::UnknownMemoryType(key.clone()))
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Storage technology of a declared backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Document,
    Vector,
    Graph,
    Sqlite,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Document => "document",
            Self::Vector => "vector",
            Self::Graph => "graph",
            Self::Sqlite => "sqlite",
        };
        f.write_str(name)
    }
}

/// `[backends.<name>]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Database file for `sqlite` backends; unset means in-memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Embedding dimensionality for `vector` backends; defaults to the
    /// embedding provider's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

impl BackendConfig {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            path: None,
            dimensions: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// `[recovery]` section. Present means recovery is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Where snapshots and operation logs are written; unset means the
    /// platform data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl RecoveryConfig {
    /// The configured directory, else `<data dir>/strata/recovery`.
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        self.dir
            .clone()
            .or_else(|| crate::discovery::data_dir().map(|d| d.join("recovery")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// `[logging]` section, read by applications that install a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[cache]
capacity = 64
ttl_secs = 30

[router]
call_timeout_ms = 250
cascade_order = ["graph", "docs"]

[router.hints]
code = ["docs"]

[sync]
interval_secs = 5
pairs = [{ source = "docs", target = "graph" }]

[retry]
max_retries = 5

[routing]
default_backend = "docs"

[routing.types]
WORKING = "vec"
relationship = "graph"

[backends.docs]
kind = "document"

[backends.vec]
kind = "vector"
dimensions = 32

[backends.graph]
kind = "graph"

[logging]
level = "debug"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = StrataConfig::from_toml(FULL).unwrap();

        assert_eq!(config.cache_config().capacity, 64);
        assert_eq!(config.cache_config().ttl(), Some(Duration::from_secs(30)));
        let router = config.router_config();
        assert_eq!(router.call_timeout(), Duration::from_millis(250));
        assert_eq!(router.cascade_order, vec!["graph", "docs"]);
        assert_eq!(router.default_limit, 10);
        assert_eq!(router.hints["code"], vec!["docs"]);
        assert_eq!(config.sync_config().pairs.len(), 1);
        assert_eq!(config.retry_config().max_retries, 5);
        assert_eq!(config.retry_config().factor, 2.0);
        assert_eq!(config.backends["vec"].kind, BackendKind::Vector);
        assert_eq!(config.backends["vec"].dimensions, Some(32));
        assert_eq!(config.logging.as_ref().unwrap().level, "debug");

        let table = config.routing_config().type_table().unwrap();
        assert_eq!(table[&MemoryType::Working], "vec");
        assert_eq!(table[&MemoryType::Relationship], "graph");

        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = StrataConfig::from_toml("").unwrap();
        assert!(config.backends.is_empty());
        assert_eq!(config.cache_config(), CacheSection::default());
        assert_eq!(config.router_config().query_cache_capacity, 256);
        config.validate().unwrap();
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = StrataConfig::from_toml(FULL).unwrap();
        let text = config.to_toml().unwrap();
        let back = StrataConfig::from_toml(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_merge_overrides_sections_and_adds_backends() {
        let mut base = StrataConfig::from_toml(FULL).unwrap();
        let overlay = StrataConfig::from_toml(
            r#"
[cache]
capacity = 8

[backends.store]
kind = "sqlite"
path = "/tmp/strata.db"
"#,
        )
        .unwrap();

        base.merge(overlay);

        assert_eq!(base.cache_config().capacity, 8);
        assert_eq!(base.cache_config().ttl_secs, None);
        assert_eq!(base.backends.len(), 4);
        // Untouched sections survive.
        assert_eq!(base.retry_config().max_retries, 5);
    }

    #[test]
    fn test_validate_unknown_memory_type() {
        let config = StrataConfig::from_toml(
            r#"
[routing.types]
DREAMS = "docs"

[backends.docs]
kind = "document"
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMemoryType(ref t) if t == "DREAMS"));
    }

    #[test]
    fn test_validate_undefined_backend() {
        let config = StrataConfig::from_toml(
            r#"
[routing]
default_backend = "missing"
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::UndefinedBackend { ref name, .. } if name == "missing"));
    }

    #[test]
    fn test_validate_zero_dimensions() {
        let config = StrataConfig::from_toml(
            r#"
[backends.vec]
kind = "vector"
dimensions = 0
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_retry_factor_range() {
        for factor in ["0.5", "inf", "nan"] {
            let config = StrataConfig::from_toml(&format!("[retry]\nfactor = {factor}\n")).unwrap();
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidValue { ref field, .. }) if field == "retry.factor"),
                "factor {factor} accepted"
            );
        }
        let config = StrataConfig::from_toml("[retry]\nfactor = 1.5\n").unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_anchor_paths_only_touches_relative_paths() {
        let mut config = StrataConfig::from_toml(
            r#"
[backends.local]
kind = "sqlite"
path = "data/memory.db"

[backends.fixed]
kind = "sqlite"
path = "/var/lib/strata.db"

[backends.mem]
kind = "sqlite"

[recovery]
dir = "recovery"
"#,
        )
        .unwrap();

        config.anchor_paths(Path::new("/etc/strata"));

        assert_eq!(
            config.backends["local"].path.as_deref(),
            Some(Path::new("/etc/strata/data/memory.db"))
        );
        assert_eq!(
            config.backends["fixed"].path.as_deref(),
            Some(Path::new("/var/lib/strata.db"))
        );
        assert_eq!(config.backends["mem"].path, None);
        assert_eq!(
            config.recovery.unwrap().dir.as_deref(),
            Some(Path::new("/etc/strata/recovery"))
        );
    }

    #[test]
    fn test_unknown_backend_kind_fails_to_parse() {
        let err = StrataConfig::from_toml(
            r#"
[backends.x]
kind = "tape"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
