//! Integration tests for the composed data store over SQLite.
//!
//! These tests verify:
//! - Stream positions resume across restarts without reuse
//! - Change caches are primed from persisted rows
//! - Startup snapshots and the unified token view
//! - Construction failures name the failing store

use anyhow::Result;
use chorusstore::stores::NewReceipt;
use chorusstore::{
    prepare_database, CacheAnswer, DataStore, ManualClock, SqliteDatabase, StoreConfig,
    StoreError, StreamToken,
};
use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn config() -> StoreConfig {
    StoreConfig {
        server_name: "example.org".to_string(),
        ..StoreConfig::default()
    }
}

async fn open_store(path: &Path) -> Result<(Arc<SqliteDatabase>, DataStore)> {
    let db = Arc::new(SqliteDatabase::open(path)?);
    prepare_database(db.as_ref(), "example.org").await?;
    let store = DataStore::new(Arc::clone(&db), Arc::new(ManualClock::new(1_000)), config()).await?;
    Ok((db, store))
}

#[tokio::test]
async fn test_fresh_store_starts_at_zero() -> Result<()> {
    let temp = TempDir::new()?;
    let (_db, store) = open_store(&temp.path().join("homeserver.db")).await?;

    assert_eq!(store.get_room_max_stream_ordering(), StreamToken::ZERO);
    assert_eq!(store.get_device_stream_token(), StreamToken::ZERO);
    assert_eq!(store.stream_order_on_start(), StreamToken::ZERO);
    assert_eq!(store.min_stream_order_on_start(), StreamToken::ZERO);
    assert_eq!(store.server_name(), "example.org");
    Ok(())
}

#[tokio::test]
async fn test_restart_resumes_stream_positions() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("homeserver.db");

    {
        let (_db, store) = open_store(&path).await?;
        let first = store.events().persist_event("$a", "!room:example.org", "@alice:example.org", "m.room.message").await?;
        let second = store.events().persist_event("$b", "!room:example.org", "@alice:example.org", "m.room.message").await?;
        assert_eq!(first, StreamToken(1));
        assert_eq!(second, StreamToken(2));
    }

    let (_db, store) = open_store(&path).await?;
    assert_eq!(store.stream_order_on_start(), StreamToken(2));
    let third = store
        .events()
        .persist_event("$c", "!room:example.org", "@alice:example.org", "m.room.message")
        .await?;
    assert_eq!(third, StreamToken(3));
    Ok(())
}

#[tokio::test]
async fn test_state_deltas_share_event_numbering() -> Result<()> {
    let temp = TempDir::new()?;
    let (_db, store) = open_store(&temp.path().join("homeserver.db")).await?;
    let events = store.events();

    let event = events.persist_event("$create", "!r:example.org", "@alice:example.org", "m.room.create").await?;
    let delta = events.persist_state_delta("!r:example.org", "m.room.create", "", Some("$create")).await?;
    assert!(delta > event);
    assert_eq!(store.get_room_max_stream_ordering(), delta);

    assert_eq!(
        events.has_room_state_changed_since("!r:example.org", event),
        CacheAnswer::Known(true)
    );
    assert_eq!(
        events.has_room_state_changed_since("!r:example.org", delta),
        CacheAnswer::Known(false)
    );
    Ok(())
}

#[tokio::test]
async fn test_caches_primed_after_restart() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("homeserver.db");

    {
        let (_db, store) = open_store(&path).await?;
        store.events().persist_state_delta("!a:example.org", "m.room.name", "", Some("$1")).await?;
        store.events().persist_state_delta("!b:example.org", "m.room.topic", "", Some("$2")).await?;
        store.device_lists().add_device_change_to_stream("@alice:example.org", &["DEV".to_string()]).await?;
    }

    let (_db, store) = open_store(&path).await?;
    let deltas = store.events().state_delta_cache();
    assert_eq!(
        deltas.get_changed_since(StreamToken(1)),
        CacheAnswer::Known(HashSet::from(["!b:example.org".to_string()]))
    );
    assert_eq!(
        deltas.has_changed("!a:example.org", StreamToken::ZERO),
        CacheAnswer::Known(true)
    );
    assert_eq!(
        store.device_lists().get_users_whose_devices_changed(StreamToken::ZERO),
        CacheAnswer::Known(HashSet::from(["@alice:example.org".to_string()]))
    );
    Ok(())
}

#[tokio::test]
async fn test_min_and_max_snapshots() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("homeserver.db");

    {
        let (_db, store) = open_store(&path).await?;
        for id in ["$1", "$2", "$3"] {
            store.events().persist_event(id, "!r:example.org", "@bob:example.org", "m.room.message").await?;
        }
    }

    let (_db, store) = open_store(&path).await?;
    assert_eq!(store.min_stream_order_on_start(), StreamToken(1));
    assert_eq!(store.stream_order_on_start(), StreamToken(3));

    // Snapshots do not move with later writes.
    store.events().persist_event("$4", "!r:example.org", "@bob:example.org", "m.room.message").await?;
    assert_eq!(store.stream_order_on_start(), StreamToken(3));
    assert_eq!(store.get_room_max_stream_ordering(), StreamToken(4));
    Ok(())
}

#[tokio::test]
async fn test_current_tokens_lists_every_stream() -> Result<()> {
    let temp = TempDir::new()?;
    let (_db, store) = open_store(&temp.path().join("homeserver.db")).await?;

    store.events().persist_event("$1", "!r:example.org", "@alice:example.org", "m.room.message").await?;
    store.device_lists().add_device_change_to_stream("@alice:example.org", &["A".to_string(), "B".to_string()]).await?;
    let receipts = vec![
        NewReceipt {
            room_id: "!r:example.org".to_string(),
            receipt_type: "m.read".to_string(),
            user_id: "@alice:example.org".to_string(),
            event_id: "$1".to_string(),
        };
        3
    ];
    let tokens = store.receipts().insert_receipts(&receipts).await?;
    assert_eq!(tokens, vec![StreamToken(1), StreamToken(2), StreamToken(3)]);

    let expected: BTreeMap<String, StreamToken> = [
        ("current_state_deltas", 1),
        ("device_lists_stream", 1),
        ("events", 1),
        ("receipts", 3),
    ]
    .into_iter()
    .map(|(name, token)| (name.to_string(), StreamToken(token)))
    .collect();
    assert_eq!(store.current_tokens(), expected);
    Ok(())
}

#[tokio::test]
async fn test_failed_write_leaves_gap() -> Result<()> {
    let temp = TempDir::new()?;
    let (_db, store) = open_store(&temp.path().join("homeserver.db")).await?;
    let events = store.events();

    events.persist_event("$dup", "!r:example.org", "@alice:example.org", "m.room.message").await?;
    let err = events
        .persist_event("$dup", "!r:example.org", "@alice:example.org", "m.room.message")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Database(_)));
    assert_eq!(events.stream().in_flight(), 0);

    let next = events.persist_event("$next", "!r:example.org", "@alice:example.org", "m.room.message").await?;
    assert_eq!(next, StreamToken(3));
    assert_eq!(store.get_room_max_stream_ordering(), StreamToken(3));
    Ok(())
}

#[tokio::test]
async fn test_two_processes_share_counters() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("homeserver.db");
    let (_db_a, a) = open_store(&path).await?;
    let (_db_b, b) = open_store(&path).await?;

    let mut seen = HashSet::new();
    for i in 0..5 {
        let ta = a.events().persist_event(&format!("$a{i}"), "!r:example.org", "@a:example.org", "m.room.message").await?;
        let tb = b.events().persist_event(&format!("$b{i}"), "!r:example.org", "@b:example.org", "m.room.message").await?;
        assert!(seen.insert(ta));
        assert!(seen.insert(tb));
    }
    assert_eq!(seen.len(), 10);
    Ok(())
}

#[tokio::test]
async fn test_missing_table_fails_named_store() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("homeserver.db");
    let db = Arc::new(SqliteDatabase::open(&path)?);
    prepare_database(db.as_ref(), "example.org").await?;
    db.execute_batch("DROP TABLE device_lists_stream;")?;

    let err = DataStore::new(Arc::clone(&db), Arc::new(ManualClock::new(0)), config())
        .await
        .unwrap_err();
    match &err {
        StoreError::Construction { store, source } => {
            assert_eq!(*store, "device_lists");
            assert!(matches!(**source, StoreError::Database(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_fatal());
    Ok(())
}

#[tokio::test]
async fn test_counter_behind_persisted_events_is_refused() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("homeserver.db");
    let db = Arc::new(SqliteDatabase::open(&path)?);
    prepare_database(db.as_ref(), "example.org").await?;
    db.execute_batch(
        "INSERT INTO events (event_id, room_id, sender, type, stream_ordering, received_ts)
         VALUES ('$old', '!r:example.org', '@a:example.org', 'm.room.message', 50, 0);",
    )?;

    let err = DataStore::new(Arc::clone(&db), Arc::new(ManualClock::new(0)), config())
        .await
        .unwrap_err();
    match err {
        StoreError::Construction { store, source } => {
            assert_eq!(store, "events");
            assert!(matches!(*source, StoreError::Invariant { store: "events", .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_unmigrated_database_fails_construction() -> Result<()> {
    let temp = TempDir::new()?;
    let db = Arc::new(SqliteDatabase::open(temp.path().join("homeserver.db"))?);

    let err = DataStore::new(db, Arc::new(ManualClock::new(0)), config())
        .await
        .unwrap_err();
    match err {
        StoreError::Construction { store, source } => {
            assert_eq!(store, "events");
            assert!(matches!(*source, StoreError::AllocationUnavailable { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_server_name_change_refused_at_startup() -> Result<()> {
    let temp = TempDir::new()?;
    let db = SqliteDatabase::open(temp.path().join("homeserver.db"))?;
    prepare_database(&db, "example.org").await?;
    db.register_user("@alice:example.org", 0).await?;

    let err = prepare_database(&db, "example.net").await.unwrap_err();
    assert!(matches!(err, StoreError::ConfigurationDrift { .. }));
    assert!(err.to_string().contains("example.net"));

    prepare_database(&db, "example.org").await?;
    Ok(())
}
