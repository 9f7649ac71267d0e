//! Query routing across several backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use strata_memory::{
    FlakyStore, MemoryError, MemoryItem, MemoryManager, MemoryStore, MemoryType, QueryStrategy,
    RouteRequest, ValidationError, WarningKind,
};

fn item(id: &str, content: &str) -> MemoryItem {
    MemoryItem::new(MemoryType::Semantic, content).with_id(id)
}

/// `a` and `b` answer normally, `slow` sleeps past the call deadline.
async fn three_backends() -> Result<MemoryManager> {
    let a = common::documents("a");
    let b = common::documents("b");
    let slow_inner = common::documents("slow");
    a.store(item("a1", "rust ownership")).await?;
    b.store(item("b1", "rust lifetimes")).await?;
    b.store(item("b2", "python typing")).await?;
    slow_inner.store(item("s1", "rust macros")).await?;
    let slow = FlakyStore::new(slow_inner).with_delay(Duration::from_millis(500));

    Ok(common::builder()
        .with_backend("a", a)
        .with_backend("b", b)
        .with_backend("slow", Arc::new(slow))
        .build()?)
}

#[tokio::test]
async fn test_federated_returns_partial_results_when_one_backend_times_out() -> Result<()> {
    let manager = three_backends().await?;

    let results = manager
        .route_query("rust", QueryStrategy::Federated, None)
        .await?;

    assert!(results.partial);
    assert_eq!(results.stores, vec!["a", "b", "slow"]);
    assert_eq!(results.warnings.len(), 1);
    assert_eq!(results.warnings[0].backend, "slow");
    assert_eq!(results.warnings[0].kind, WarningKind::TimedOut);

    let mut ids = results.ids();
    ids.sort_unstable();
    assert_eq!(ids, vec!["a1", "b1"]);

    // Partial answers are never served from the query cache.
    let again = manager
        .route_query("rust", QueryStrategy::Federated, None)
        .await?;
    assert!(!again.from_cache);
    assert!(again.partial);

    Ok(())
}

#[tokio::test]
async fn test_cross_store_queries_only_named_backends() -> Result<()> {
    let manager = three_backends().await?;

    let results = manager
        .route_query("rust", QueryStrategy::CrossStore, Some(&["b"][..]))
        .await?;
    assert_eq!(results.stores, vec!["b"]);
    assert_eq!(results.ids(), vec!["b1"]);
    assert!(!results.partial);

    let cached = manager
        .route_query("rust", QueryStrategy::CrossStore, Some(&["b"][..]))
        .await?;
    assert!(cached.from_cache);

    let err = manager
        .route_query("rust", QueryStrategy::CrossStore, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(ValidationError::InvalidArgument(_))));

    let err = manager
        .route_query("rust", QueryStrategy::CrossStore, Some(&["a", "nope"][..]))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::BackendNotFound(name) if name == "nope"));

    Ok(())
}

#[tokio::test]
async fn test_direct_needs_exactly_one_store() -> Result<()> {
    let manager = three_backends().await?;

    let results = manager
        .route_query("rust", QueryStrategy::Direct, Some(&["a"][..]))
        .await?;
    assert_eq!(results.ids(), vec!["a1"]);

    for stores in [None, Some(&["a", "b"][..])] {
        let err = manager
            .route_query("rust", QueryStrategy::Direct, stores)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    let err = manager
        .route_query("rust", QueryStrategy::Direct, Some(&["slow"][..]))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    Ok(())
}

#[tokio::test]
async fn test_cascading_falls_through_empty_and_failing_backends() -> Result<()> {
    let empty = common::documents("empty");
    let broken = FlakyStore::new(common::documents("broken")).failing_searches();
    let full = common::documents("full");
    full.store(item("f1", "rust async")).await?;

    let manager = common::builder()
        .with_backend("empty", empty)
        .with_backend("broken", Arc::new(broken))
        .with_backend("full", full)
        .build()?;

    let results = manager
        .route_query("rust", QueryStrategy::Cascading, None)
        .await?;
    assert_eq!(results.stores, vec!["full"]);
    assert_eq!(results.ids(), vec!["f1"]);
    assert!(results.partial);
    assert_eq!(results.warnings.len(), 1);
    assert_eq!(results.warnings[0].backend, "broken");
    assert_eq!(results.warnings[0].kind, WarningKind::Failed);

    // Nothing anywhere: an empty, complete answer.
    let nothing = manager
        .route_query("haskell", QueryStrategy::Cascading, Some(&["empty", "full"][..]))
        .await?;
    assert!(nothing.is_empty());
    assert!(!nothing.partial);

    let err = manager
        .route_query("rust", QueryStrategy::Cascading, Some(&["broken"][..]))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::AllBackendsFailed { .. }));

    Ok(())
}

#[tokio::test]
async fn test_cascading_stops_on_timeout() -> Result<()> {
    let manager = three_backends().await?;

    let err = manager
        .route_query("rust", QueryStrategy::Cascading, Some(&["slow", "a"][..]))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Timeout { ref backend, .. } if backend == "slow"));

    Ok(())
}

#[tokio::test]
async fn test_context_aware_uses_type_table_and_hints() -> Result<()> {
    let code = common::documents("code");
    let notes = common::documents("notes");
    code.store(MemoryItem::new(MemoryType::Code, "fn rust_main() {}").with_id("c1"))
        .await?;
    notes.store(item("n1", "rust notes")).await?;

    let manager = common::builder()
        .with_backend("code", code)
        .with_backend("notes", notes)
        .with_route(MemoryType::Code, "code")
        .build()?;

    let by_type = manager
        .route(
            RouteRequest::new("rust", QueryStrategy::ContextAware).with_memory_type(MemoryType::Code),
        )
        .await?;
    assert_eq!(by_type.stores, vec!["code"]);

    let by_hint = manager
        .route(RouteRequest::new("rust", QueryStrategy::ContextAware).with_hint("notes"))
        .await?;
    assert_eq!(by_hint.stores, vec!["notes"]);
    assert_eq!(by_hint.ids(), vec!["n1"]);

    // Nothing matches: every backend is consulted.
    let fallback = manager
        .route(RouteRequest::new("rust", QueryStrategy::ContextAware).with_hint("unknown"))
        .await?;
    assert_eq!(fallback.stores, vec!["code", "notes"]);

    Ok(())
}

#[tokio::test]
async fn test_federated_merge_keeps_latest_duplicate() -> Result<()> {
    let first = common::documents("first");
    let second = common::documents("second");
    let older = item("x", "rust generics").with_updated_at(chrono::Utc::now() - chrono::Duration::minutes(5));
    let newer = item("y", "rust generics");
    first.store(older).await?;
    second.store(newer).await?;

    let manager = common::builder()
        .with_backend("first", first)
        .with_backend("second", second)
        .build()?;

    let results = manager
        .route_query("generics", QueryStrategy::Federated, None)
        .await?;

    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].item.id, "y");
    assert_eq!(results.hits[0].backend, "second");

    Ok(())
}

#[tokio::test]
async fn test_limit_is_honoured_and_zero_rejected() -> Result<()> {
    let docs = common::documents("docs");
    for n in 0..8 {
        docs.store(item(&format!("d{n}"), &format!("rust item {n}"))).await?;
    }
    let manager = common::builder().with_backend("docs", docs).build()?;

    let results = manager
        .route(RouteRequest::new("rust", QueryStrategy::Federated).with_limit(3))
        .await?;
    assert_eq!(results.hits.len(), 3);

    let err = manager
        .route(RouteRequest::new("rust", QueryStrategy::Federated).with_limit(0))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));

    Ok(())
}

#[tokio::test]
async fn test_same_content_under_distinct_ids_in_one_backend_is_kept() -> Result<()> {
    let docs = common::documents("docs");
    docs.store(item("a", "rust borrow checker")).await?;
    docs.store(item("b", "rust borrow checker")).await?;
    assert_eq!(docs.search("borrow", 10).await?.len(), 2);

    let manager = common::builder().with_backend("docs", docs).build()?;

    for strategy in [QueryStrategy::Direct, QueryStrategy::Federated] {
        let results = manager
            .route_query("borrow", strategy, Some(&["docs"][..]))
            .await?;
        let mut ids = results.ids();
        ids.sort_unstable();
        assert_eq!(ids, vec!["a", "b"], "{strategy} collapsed distinct items");
    }

    Ok(())
}

#[tokio::test]
async fn test_federated_skips_backend_held_by_transaction() -> Result<()> {
    let a = common::documents("a");
    let b = common::documents("b");
    a.store(item("a1", "rust ownership")).await?;
    b.store(item("b1", "rust lifetimes")).await?;
    let manager = common::builder()
        .with_backend("a", a)
        .with_backend("b", b)
        .build()?;

    let mut tx = manager.begin_transaction(&["b"]).await?;

    let results = tokio::time::timeout(
        Duration::from_secs(2),
        manager.route_query("rust", QueryStrategy::Federated, None),
    )
    .await??;
    assert!(results.partial);
    assert_eq!(results.ids(), vec!["a1"]);
    assert_eq!(results.warnings.len(), 1);
    assert_eq!(results.warnings[0].backend, "b");
    assert_eq!(results.warnings[0].kind, WarningKind::TimedOut);

    tx.rollback().await?;
    let after = manager
        .route_query("rust", QueryStrategy::Federated, None)
        .await?;
    assert!(!after.partial);
    assert_eq!(after.hits.len(), 2);

    Ok(())
}
