//! User directory store behaviour over SQLite.

use anyhow::Result;
use chorusstore::database::UserDirectoryEntry;
use chorusstore::{prepare_database, DataStore, ManualClock, SqliteDatabase, StoreConfig, StreamToken};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

const ALICE: &str = "@alice:a";
const BOB: &str = "@bob:b";
const BOBBY: &str = "@bobby:a";
// The localpart differs from the display name so display name lookup is exercised.
const BELA: &str = "@somenickname:a";

fn entry(user_id: &str, display_name: &str) -> UserDirectoryEntry {
    UserDirectoryEntry {
        user_id: user_id.to_string(),
        display_name: Some(display_name.to_string()),
        avatar_url: None,
    }
}

/// alice and bob share a public room. bobby does not, but shares a server
/// with alice.
async fn populated(search_all_users: bool) -> Result<(TempDir, DataStore)> {
    let temp = TempDir::new()?;
    let db = Arc::new(SqliteDatabase::open(temp.path().join("homeserver.db"))?);
    prepare_database(db.as_ref(), "a").await?;

    let config = StoreConfig {
        server_name: "a".to_string(),
        search_all_users,
        ..StoreConfig::default()
    };
    let store = DataStore::new(db, Arc::new(ManualClock::new(0)), config).await?;

    let dir = store.user_directory();
    dir.update_profile_in_user_dir(ALICE, Some("alice"), None).await?;
    dir.update_profile_in_user_dir(BOB, Some("bob"), None).await?;
    dir.update_profile_in_user_dir(BOBBY, Some("bobby"), None).await?;
    dir.update_profile_in_user_dir(BELA, Some("Bela"), None).await?;
    dir.add_users_in_public_rooms("!room:id", &[ALICE, BOB]).await?;

    Ok((temp, store))
}

#[tokio::test]
async fn test_search_user_dir() -> Result<()> {
    let (_temp, store) = populated(false).await?;

    // bobby doesn't share a room with anyone, so alice only finds bob.
    let r = store.user_directory().search_user_dir(ALICE, "bob", 10).await?;
    assert!(!r.limited);
    assert_eq!(r.results, vec![entry(BOB, "bob")]);
    Ok(())
}

#[tokio::test]
async fn test_search_user_dir_all_users() -> Result<()> {
    let (_temp, store) = populated(true).await?;

    let r = store.user_directory().search_user_dir(ALICE, "bob", 10).await?;
    assert!(!r.limited);
    assert_eq!(r.results, vec![entry(BOB, "bob"), entry(BOBBY, "bobby")]);
    Ok(())
}

#[tokio::test]
async fn test_search_user_dir_short_prefix() -> Result<()> {
    let (_temp, store) = populated(true).await?;

    // "be" would be a stop word to a full text index.
    let r = store.user_directory().search_user_dir(ALICE, "be", 10).await?;
    assert!(!r.limited);
    assert_eq!(r.results, vec![entry(BELA, "Bela")]);
    Ok(())
}

#[tokio::test]
async fn test_search_user_dir_limited() -> Result<()> {
    let (_temp, store) = populated(true).await?;

    let r = store.user_directory().search_user_dir(ALICE, "bob", 1).await?;
    assert!(r.limited);
    assert_eq!(r.results, vec![entry(BOB, "bob")]);
    Ok(())
}

#[tokio::test]
async fn test_profile_update_replaces_entry() -> Result<()> {
    let (_temp, store) = populated(true).await?;
    let dir = store.user_directory();

    dir.update_profile_in_user_dir(BOB, Some("Robert"), Some("mxc://b/avatar")).await?;
    let r = dir.search_user_dir(ALICE, "rob", 10).await?;
    assert_eq!(
        r.results,
        vec![UserDirectoryEntry {
            user_id: BOB.to_string(),
            display_name: Some("Robert".to_string()),
            avatar_url: Some("mxc://b/avatar".to_string()),
        }]
    );
    Ok(())
}

#[tokio::test]
async fn test_purge_and_stream_pos() -> Result<()> {
    let (_temp, store) = populated(false).await?;
    let dir = store.user_directory();

    store
        .events()
        .persist_event("$1", "!room:id", ALICE, "m.room.member")
        .await?;
    assert_eq!(dir.mark_caught_up().await?, StreamToken(1));
    assert_eq!(dir.get_user_directory_stream_pos().await?, Some(StreamToken(1)));

    dir.update_user_directory_stream_pos(None).await?;
    dir.delete_all_from_user_dir().await?;

    assert_eq!(dir.get_user_directory_stream_pos().await?, None);
    assert_eq!(dir.get_users_in_public_rooms().await?, Vec::<(String, String)>::new());
    let r = dir.search_user_dir(ALICE, "bob", 10).await?;
    assert!(r.results.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_public_room_membership_listed() -> Result<()> {
    let (_temp, store) = populated(false).await?;
    let mut members = store.user_directory().get_users_in_public_rooms().await?;
    members.sort();
    assert_eq!(
        members,
        vec![
            (ALICE.to_string(), "!room:id".to_string()),
            (BOB.to_string(), "!room:id".to_string()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_disabled_directory_skips_writes() -> Result<()> {
    let temp = TempDir::new()?;
    let db = Arc::new(SqliteDatabase::open(temp.path().join("homeserver.db"))?);
    prepare_database(db.as_ref(), "a").await?;

    let disabled = StoreConfig {
        server_name: "a".to_string(),
        user_directory_enabled: false,
        search_all_users: true,
        ..StoreConfig::default()
    };
    let store = DataStore::new(Arc::clone(&db), Arc::new(ManualClock::new(0)), disabled.clone()).await?;
    let dir = store.user_directory();
    assert!(!dir.is_enabled());

    dir.update_profile_in_user_dir(ALICE, Some("alice"), None).await?;
    dir.add_users_in_public_rooms("!room:id", &[ALICE, BOB]).await?;
    store
        .events()
        .persist_event("$1", "!room:id", ALICE, "m.room.member")
        .await?;
    assert_eq!(dir.mark_caught_up().await?, StreamToken(1));

    assert_eq!(dir.get_user_directory_stream_pos().await?, None);
    assert_eq!(dir.get_users_in_public_rooms().await?, Vec::<(String, String)>::new());

    let enabled = StoreConfig {
        user_directory_enabled: true,
        ..disabled
    };
    let reopened = DataStore::new(db, Arc::new(ManualClock::new(0)), enabled).await?;
    let r = reopened.user_directory().search_user_dir(BOB, "alice", 10).await?;
    assert!(r.results.is_empty());
    Ok(())
}
