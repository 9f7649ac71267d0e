//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use strata_memory::{
    DocumentStore, FlakyStore, HashEmbedder, MemoryManager, MemoryManagerBuilder, RetryConfig,
    VectorMemoryStore,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static TRACING: Once = Once::new();

/// Install a subscriber honouring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

pub const DIMENSIONS: usize = 32;

pub fn documents(name: &str) -> Arc<DocumentStore> {
    Arc::new(DocumentStore::new(name))
}

pub fn vectors(name: &str) -> Arc<VectorMemoryStore> {
    Arc::new(VectorMemoryStore::new(name, Arc::new(HashEmbedder::new(DIMENSIONS))))
}

/// A document store that sleeps longer than [`CALL_TIMEOUT`] on every call.
pub fn slow_documents(name: &str) -> Arc<FlakyStore> {
    Arc::new(FlakyStore::new(documents(name)).with_delay(Duration::from_millis(500)))
}

pub const CALL_TIMEOUT: Duration = Duration::from_millis(100);

/// Builder with no retries and a short call deadline.
pub fn builder() -> MemoryManagerBuilder {
    init_tracing();
    MemoryManager::builder()
        .with_retry(RetryConfig::none())
        .with_call_timeout(CALL_TIMEOUT)
}
