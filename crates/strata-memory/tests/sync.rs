//! Synchronization, conflict resolution and cross-store transactions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use strata_memory::{
    ConflictWinner, FlakyStore, GraphMemoryStore, MemoryError, MemoryItem, MemoryManager,
    MemoryStore, MemoryType, Relationship, RelationshipType, ResolutionReason, SqliteStore,
    TransactionalStore, TxOperation,
};

fn item(id: &str, content: &str) -> MemoryItem {
    MemoryItem::new(MemoryType::Semantic, content).with_id(id)
}

#[tokio::test]
async fn test_second_synchronize_applies_nothing() -> Result<()> {
    let docs = common::documents("docs");
    let sql = Arc::new(SqliteStore::open_in_memory("sql")?);
    for n in 0..5 {
        docs.store(item(&format!("i{n}"), &format!("fact {n}"))).await?;
    }
    let manager = common::builder()
        .with_backend("docs", docs)
        .with_backend("sql", sql.clone())
        .build()?;

    let first = manager.synchronize("docs", "sql").await?;
    assert_eq!(first.applied_count, 5);
    assert_eq!(sql.list_keys().await?.len(), 5);

    let second = manager.synchronize("docs", "sql").await?;
    assert_eq!(second.applied_count, 0);
    assert_eq!(second.conflicts_resolved, 0);

    // Only the edited item travels.
    manager
        .update("docs", "i2", MemoryItem::new(MemoryType::Semantic, "fact two, revised"))
        .await?;
    let third = manager.synchronize("docs", "sql").await?;
    assert_eq!(third.applied_count, 1);
    assert_eq!(
        manager.retrieve("sql", "i2").await?.map(|i| i.content),
        Some("fact two, revised".to_string())
    );

    Ok(())
}

#[tokio::test]
async fn test_conflicting_versions_converge_on_newest() -> Result<()> {
    let now = chrono::Utc::now();
    let t1 = now - chrono::Duration::minutes(10);
    let t2 = now - chrono::Duration::minutes(5);

    let a = common::documents("a");
    let b = Arc::new(SqliteStore::open_in_memory("b")?);
    a.store(item("x", "first draft").with_updated_at(t1)).await?;
    b.store(item("x", "second draft").with_updated_at(t2)).await?;

    let manager = common::builder()
        .with_backend("a", a.clone())
        .with_backend("b", b.clone())
        .build()?;

    let forward = manager.synchronize("a", "b").await?;
    assert_eq!(forward.applied_count, 0);
    assert_eq!(forward.conflicts_resolved, 1);
    assert_eq!(forward.conflict_log[0].winner, ConflictWinner::StoreB);
    assert_eq!(forward.conflict_log[0].reason, ResolutionReason::Newer);

    let backward = manager.synchronize("b", "a").await?;
    assert_eq!(backward.applied_count, 1);

    let in_a = a.retrieve("x").await?.expect("x in a");
    let in_b = b.retrieve("x").await?.expect("x in b");
    assert_eq!(in_a.updated_at, t2);
    assert_eq!(in_b.updated_at, t2);
    assert_eq!(in_a.content, "second draft");
    assert!(in_a.same_version(&in_b));

    let log = manager.conflict_log();
    assert!(!log.is_empty());
    assert!(log.iter().all(|r| r.item_id == "x"));
    assert!(log.iter().all(|r| r.winning_version().updated_at == t2));
    assert!(
        log.iter()
            .any(|r| r.losing_version().updated_at == t1 && r.losing_version().content == "first draft")
    );

    // Converged: nothing left to move in either direction.
    let (there, back) = manager.synchronize_bidirectional("a", "b").await?;
    assert_eq!(there.applied_count + back.applied_count, 0);
    assert_eq!(there.conflicts_resolved + back.conflicts_resolved, 0);

    Ok(())
}

#[tokio::test]
async fn test_equal_timestamps_break_ties_by_backend_name() -> Result<()> {
    let ts = chrono::Utc::now();
    let alpha = common::documents("alpha");
    let beta = common::documents("beta");
    alpha.store(item("x", "alpha version").with_updated_at(ts)).await?;
    beta.store(item("x", "beta version").with_updated_at(ts)).await?;

    let manager = common::builder()
        .with_backend("alpha", alpha.clone())
        .with_backend("beta", beta.clone())
        .build()?;

    let from_beta = manager.synchronize("beta", "alpha").await?;
    assert_eq!(from_beta.applied_count, 0);
    let record = &from_beta.conflict_log[0];
    assert_eq!(record.reason, ResolutionReason::TieBreak);
    assert_eq!(record.winning_store(), "alpha");

    let from_alpha = manager.synchronize("alpha", "beta").await?;
    assert_eq!(from_alpha.applied_count, 1);
    assert_eq!(
        beta.retrieve("x").await?.map(|i| i.content),
        Some("alpha version".to_string())
    );

    Ok(())
}

#[tokio::test]
async fn test_failed_operation_restores_every_participant() -> Result<()> {
    let docs = common::documents("docs");
    let inner = common::documents("flaky");
    docs.store(item("d", "docs original")).await?;
    inner.store(item("f", "flaky original")).await?;
    let docs_before = docs.all_items().await?;
    let flaky_before = inner.all_items().await?;

    // The first write reaching the wrapper fails.
    let flaky = Arc::new(FlakyStore::new(inner.clone()).fail_on_write(1));
    let manager = common::builder()
        .with_backend("docs", docs.clone())
        .with_backend("flaky", flaky.clone())
        .build()?;

    let result = manager
        .cross_store_transaction(
            vec![
                TxOperation::store("docs", item("n1", "written then undone")),
                TxOperation::store("flaky", item("n2", "never written")),
                TxOperation::delete("docs", "d"),
            ],
            &["docs", "flaky"],
        )
        .await;

    match result {
        Err(MemoryError::TransactionAborted { reason, .. }) => {
            assert!(reason.contains("injected failure"), "unexpected reason: {reason}");
        }
        other => panic!("expected an aborted transaction, got {other:?}"),
    }
    assert_eq!(docs.all_items().await?, docs_before);
    assert_eq!(inner.all_items().await?, flaky_before);
    assert_eq!(flaky.write_calls(), 1);
    assert_eq!(manager.sync_stats().transactions_rolled_back, 1);

    Ok(())
}

#[tokio::test]
async fn test_native_participants_roll_back_together() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let graph = Arc::new(GraphMemoryStore::new("graph"));
    let sql = Arc::new(SqliteStore::open("sql", dir.path().join("tx.db"))?);
    graph.store(item("g", "graph original")).await?;
    sql.store(item("s", "sql original")).await?;
    let graph_before = graph.all_items().await?;
    let sql_before = sql.all_items().await?;

    let manager = common::builder()
        .with_backend("graph", graph.clone())
        .with_backend("sql", sql.clone())
        .build()?;

    let result = manager
        .cross_store_transaction(
            vec![
                TxOperation::store("graph", item("g2", "new node")),
                TxOperation::store("sql", item("s2", "new row")),
                TxOperation::delete("sql", "missing"),
            ],
            &["graph", "sql"],
        )
        .await;

    assert!(matches!(result, Err(MemoryError::TransactionAborted { .. })));
    assert_eq!(graph.all_items().await?, graph_before);
    assert_eq!(sql.all_items().await?, sql_before);

    let report = manager
        .cross_store_transaction(
            vec![
                TxOperation::store("graph", item("g2", "new node")),
                TxOperation::update("sql", "s", item("s", "sql revised")),
            ],
            &["sql", "graph"],
        )
        .await?;
    assert_eq!(report.participants, vec!["graph", "sql"]);
    assert_eq!(graph.list_keys().await?, vec!["g", "g2"]);
    assert_eq!(
        sql.retrieve("s").await?.map(|i| i.content),
        Some("sql revised".to_string())
    );

    Ok(())
}

#[tokio::test]
async fn test_compensated_graph_keeps_its_edges() -> Result<()> {
    let graph = Arc::new(GraphMemoryStore::new("graph"));
    graph.store(item("problem", "deploy failed")).await?;
    graph.store(item("fix", "pin the toolchain")).await?;
    graph.relate(Relationship::new("fix", "problem", RelationshipType::Solves))?;
    let graph_before = graph.all_items().await?;

    // "graph" commits before "sql", whose commit then fails.
    let sql = Arc::new(SqliteStore::open_in_memory("sql")?);
    let flaky_sql = Arc::new(FlakyStore::new(sql.clone()).failing_commits());
    let manager = common::builder()
        .with_backend("graph", graph.clone())
        .with_backend("sql", flaky_sql)
        .build()?;

    let result = manager
        .cross_store_transaction(
            vec![
                TxOperation::delete("graph", "problem"),
                TxOperation::store("sql", item("s1", "row")),
            ],
            &["graph", "sql"],
        )
        .await;

    match result {
        Err(MemoryError::TransactionAborted { reason, .. }) => {
            assert!(reason.contains("injected commit failure"), "unexpected reason: {reason}");
        }
        other => panic!("expected an aborted transaction, got {other:?}"),
    }
    assert_eq!(graph.all_items().await?, graph_before);
    assert_eq!(graph.stats().relationships, 1);
    assert_eq!(graph.related("problem")[0].1.id, "fix");
    assert!(sql.list_keys().await?.is_empty());
    assert_eq!(sql.active_transaction(), None);

    Ok(())
}

#[tokio::test]
async fn test_queued_update_reaches_every_backend() -> Result<()> {
    let docs = common::documents("docs");
    let sql = Arc::new(SqliteStore::open_in_memory("sql")?);
    let graph = Arc::new(GraphMemoryStore::new("graph"));
    let manager = common::builder()
        .with_backend("docs", docs.clone())
        .with_backend("sql", sql.clone())
        .with_backend("graph", graph.clone())
        .build()?;

    manager.store("sql", item("n", "first")).await?;
    assert_eq!(manager.retrieve("sql", "n").await?.map(|i| i.content), Some("first".into()));

    let revised = item("n", "revised").with_updated_at(chrono::Utc::now() + chrono::Duration::seconds(1));
    manager.queue_update("docs", revised.clone())?;
    assert_eq!(manager.queued_updates(), 1);
    // Nothing moves before the flush.
    assert!(docs.retrieve("n").await?.is_none());

    let report = manager.flush_queue().await?;
    assert_eq!(report.flushed, 1);
    assert_eq!(report.propagated, 2);
    assert_eq!(report.conflicts_resolved, 1);
    assert_eq!(report.conflict_log[0].winning_store(), "docs");

    for backend in ["docs", "sql", "graph"] {
        let fetched = manager.retrieve(backend, "n").await?.expect("propagated");
        assert!(fetched.same_version(&revised), "{backend} holds a stale copy");
    }
    assert_eq!(manager.queued_updates(), 0);

    Ok(())
}

#[tokio::test]
async fn test_periodic_sync_flushes_queue() -> Result<()> {
    let docs = common::documents("docs");
    let other = common::documents("other");
    let manager = Arc::new(
        common::builder()
            .with_backend("docs", docs.clone())
            .with_backend("other", other.clone())
            .build()?,
    );
    manager.queue_update("docs", item("q", "queued"))?;

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = manager.spawn_periodic_sync(Vec::new(), Duration::from_millis(10), shutdown.clone());
    tokio::time::timeout(Duration::from_secs(5), async {
        while other.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await??;

    assert_eq!(docs.list_keys().await?, vec!["q"]);
    assert_eq!(manager.queued_updates(), 0);

    Ok(())
}

#[tokio::test]
async fn test_sync_into_unknown_backend_fails() -> Result<()> {
    let manager = common::builder()
        .with_backend("docs", common::documents("docs"))
        .build()?;

    let err = manager.synchronize("docs", "ghost").await.unwrap_err();
    assert!(matches!(err, MemoryError::BackendNotFound(name) if name == "ghost"));
    Ok(())
}

/// Wait until `manager` has finished `n` transactions either way.
async fn settled(manager: &MemoryManager, n: u64) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = manager.sync_stats();
            if stats.transactions_committed + stats.transactions_rolled_back >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_cancelled_caller_does_not_leave_half_applied_transaction() -> Result<()> {
    let docs = common::documents("docs");
    let slow_inner = common::documents("slow");
    let slow = Arc::new(FlakyStore::new(slow_inner.clone()).with_delay(Duration::from_millis(300)));
    let manager = common::builder()
        .with_call_timeout(Duration::from_secs(2))
        .with_backend("docs", docs.clone())
        .with_backend("slow", slow)
        .build()?;

    let cancelled = tokio::time::timeout(
        Duration::from_millis(450),
        manager.cross_store_transaction(
            vec![
                TxOperation::store("docs", item("x", "first half")),
                TxOperation::store("slow", item("y", "second half")),
            ],
            &["docs", "slow"],
        ),
    )
    .await;
    assert!(cancelled.is_err(), "the caller should have given up first");

    settled(&manager, 1).await?;
    let in_docs = docs.retrieve("x").await?.is_some();
    let in_slow = slow_inner.retrieve("y").await?.is_some();
    assert_eq!(in_docs, in_slow, "docs.x={in_docs} slow.y={in_slow}");
    assert!(in_docs);
    assert_eq!(manager.sync_stats().transactions_committed, 1);

    Ok(())
}

#[tokio::test]
async fn test_cancelled_caller_releases_native_transaction() -> Result<()> {
    let sql = Arc::new(SqliteStore::open_in_memory("sql")?);
    let slow = Arc::new(
        FlakyStore::new(common::documents("slow")).with_delay(Duration::from_millis(300)),
    );
    let manager = common::builder()
        .with_call_timeout(Duration::from_secs(2))
        .with_backend("sql", sql.clone())
        .with_backend("slow", slow)
        .build()?;

    let cancelled = tokio::time::timeout(
        Duration::from_millis(450),
        manager.cross_store_transaction(
            vec![
                TxOperation::store("sql", item("s1", "native write")),
                TxOperation::store("slow", item("w1", "slow write")),
            ],
            &["sql", "slow"],
        ),
    )
    .await;
    assert!(cancelled.is_err());

    settled(&manager, 1).await?;
    assert_eq!(sql.active_transaction(), None);

    let report = manager
        .cross_store_transaction(vec![TxOperation::store("sql", item("s2", "next"))], &["sql"])
        .await?;
    assert_eq!(report.applied, vec!["s2"]);
    assert_eq!(sql.list_keys().await?, vec!["s1", "s2"]);

    Ok(())
}

#[tokio::test]
async fn test_dropped_manual_transaction_is_rolled_back() -> Result<()> {
    let sql = Arc::new(SqliteStore::open_in_memory("sql")?);
    sql.store(item("keep", "original")).await?;
    let manager = common::builder()
        .with_call_timeout(Duration::from_secs(2))
        .with_backend("sql", sql.clone())
        .build()?;

    let mut tx = manager.begin_transaction(&["sql"]).await?;
    tx.apply(TxOperation::store("sql", item("gone", "abandoned"))).await?;
    tx.apply(TxOperation::delete("sql", "keep")).await?;
    drop(tx);

    settled(&manager, 1).await?;
    assert_eq!(manager.sync_stats().transactions_rolled_back, 1);
    assert_eq!(sql.active_transaction(), None);
    assert_eq!(sql.list_keys().await?, vec!["keep"]);

    let report = manager
        .cross_store_transaction(vec![TxOperation::store("sql", item("n", "after"))], &["sql"])
        .await?;
    assert_eq!(report.applied, vec!["n"]);

    Ok(())
}
