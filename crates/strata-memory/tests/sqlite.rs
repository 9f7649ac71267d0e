//! SQLite adapter behaviour against real database files.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use strata_memory::{
    MemoryError, MemoryItem, MemoryStore, MemoryType, SqliteStore, TransactionalStore,
};

#[tokio::test]
async fn test_items_survive_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nested").join("memory.db");

    let original = MemoryItem::new(MemoryType::LongTerm, "remember the milk")
        .with_id("m1")
        .with_metadata("tags", serde_json::json!(["errand", "home"]));
    {
        let store = SqliteStore::open("sql", &path)?;
        store.store(original.clone()).await?;
    }

    let reopened = SqliteStore::open("sql", &path)?;
    let fetched = reopened.retrieve("m1").await?.expect("item persisted");
    assert_eq!(fetched, original);
    assert_eq!(reopened.list_keys().await?, vec!["m1"]);

    Ok(())
}

#[tokio::test]
async fn test_undecodable_rows_surface_as_corruption() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("memory.db");
    {
        let store = SqliteStore::open("sql", &path)?;
        store
            .store(MemoryItem::new(MemoryType::Working, "fine").with_id("ok"))
            .await?;
        store
            .store(MemoryItem::new(MemoryType::Working, "soon broken").with_id("bad"))
            .await?;
    }

    {
        let conn = rusqlite::Connection::open(&path)?;
        conn.execute(
            "UPDATE memory_items SET memory_type = 'NOT_A_TYPE' WHERE id = 'bad'",
            [],
        )?;
    }

    let store = Arc::new(SqliteStore::open("sql", &path)?);
    assert!(store.retrieve("ok").await?.is_some());
    assert!(matches!(
        store.retrieve("bad").await,
        Err(MemoryError::Corruption { .. })
    ));

    // Corruption is never retried and reaches the caller unchanged.
    let manager = common::builder().with_backend("sql", store).build()?;
    let err = manager.retrieve("sql", "bad").await.unwrap_err();
    assert!(matches!(err, MemoryError::Corruption { ref backend, .. } if backend == "sql"));
    assert!(!err.is_retryable());

    Ok(())
}

#[tokio::test]
async fn test_search_and_update_on_disk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = SqliteStore::open("sql", dir.path().join("memory.db"))?;
    store
        .store(MemoryItem::new(MemoryType::Documentation, "tokio runtime guide").with_id("d1"))
        .await?;
    store
        .store(MemoryItem::new(MemoryType::Documentation, "serde derive guide").with_id("d2"))
        .await?;

    let hits = store.search("tokio guide", 10).await?;
    assert_eq!(hits[0].item.id, "d1");
    assert_eq!(hits.len(), 2);

    let before = store.retrieve("d2").await?.expect("d2 stored");
    assert!(
        store
            .update("d2", MemoryItem::new(MemoryType::Documentation, "serde attributes"))
            .await?
    );
    let after = store.retrieve("d2").await?.expect("d2 still stored");
    assert_eq!(after.content, "serde attributes");
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at > before.updated_at);

    assert!(!store.update("nope", MemoryItem::new(MemoryType::Documentation, "x")).await?);
    assert!(store.delete("d1").await?);
    assert!(!store.delete("d1").await?);

    Ok(())
}

#[tokio::test]
async fn test_write_blocked_by_other_connection_times_out() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("memory.db");
    let holder = SqliteStore::open("holder", &path)?;
    let blocked = Arc::new(SqliteStore::open("sql", &path)?);
    let manager = common::builder().with_backend("sql", blocked).build()?;

    let tx = holder.as_transactional().expect("sqlite is transactional");
    tx.begin("hold").await?;

    let started = Instant::now();
    let err = manager
        .store("sql", MemoryItem::new(MemoryType::Working, "waits").with_id("w"))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "expected a timeout, got {err}");
    assert!(started.elapsed() < Duration::from_secs(2));

    tx.rollback("hold").await?;
    Ok(())
}
