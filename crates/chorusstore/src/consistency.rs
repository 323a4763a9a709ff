//! Startup check that the configured server name matches persisted users.
//!
//! Runs once, before any schema migration. Changing `server_name` after users
//! exist would orphan every local identity, so startup refuses instead.

use tracing::{debug, info, Level};

use crate::database::{ConsistencyCursor, Database};
use crate::error::{Result, StoreError};
use crate::fault::FaultRecord;
use crate::types::get_domain_from_id;

/// Compare the domain of one persisted user against `server_name`.
///
/// An empty database, or one whose users table does not exist yet, passes.
pub async fn check_database_before_upgrade<C>(cursor: &C, server_name: &str) -> Result<()>
where
    C: ConsistencyCursor + ?Sized,
{
    let Some(user_id) = cursor.first_user_id().await? else {
        debug!(server_name, "no persisted users, skipping server name check");
        return Ok(());
    };

    let domain =
        get_domain_from_id(&user_id).ok_or_else(|| StoreError::InvalidIdentity(user_id.clone()))?;

    if domain != server_name {
        let err = StoreError::ConfigurationDrift {
            configured: server_name.to_string(),
            stored: domain.to_string(),
        };
        let (record, _) = FaultRecord::new(
            "chorusstore::consistency",
            Level::ERROR,
            "server name does not match persisted users",
        )
        .fields([
            ("configured", server_name.to_string()),
            ("stored_user", user_id.clone()),
        ]);
        record.cause(&err).emit();
        return Err(err);
    }

    Ok(())
}

/// Check consistency, then apply outstanding migrations. Returns how many
/// migrations ran. Nothing is migrated when the check fails.
pub async fn prepare_database<D>(db: &D, server_name: &str) -> Result<usize>
where
    D: Database + ?Sized,
{
    check_database_before_upgrade(db, server_name).await?;
    let applied = db.apply_migrations().await?;
    info!(server_name, applied, "database prepared");
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteDatabase;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedCursor(Option<&'static str>);

    #[async_trait]
    impl ConsistencyCursor for FixedCursor {
        async fn first_user_id(&self) -> anyhow::Result<Option<String>> {
            Ok(self.0.map(str::to_string))
        }
    }

    #[tokio::test]
    async fn test_empty_database_passes() {
        check_database_before_upgrade(&FixedCursor(None), "example.com")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_matching_domain_passes() {
        check_database_before_upgrade(&FixedCursor(Some("@alice:example.com")), "example.com")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_port_is_part_of_domain() {
        let err = check_database_before_upgrade(
            &FixedCursor(Some("@alice:example.com:8448")),
            "example.com",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::ConfigurationDrift { .. }));
    }

    #[tokio::test]
    async fn test_mismatch_names_both_domains() {
        let err = check_database_before_upgrade(&FixedCursor(Some("@alice:example.com")), "example.org")
            .await
            .unwrap_err();

        match &err {
            StoreError::ConfigurationDrift { configured, stored } => {
                assert_eq!(configured, "example.org");
                assert_eq!(stored, "example.com");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("example.org"));
        assert!(message.contains("example.com"));
        assert!(message.contains("cannot change a server_name"));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_identity_without_domain_is_rejected() {
        let err = check_database_before_upgrade(&FixedCursor(Some("alice")), "example.org")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentity(ref id) if id == "alice"));
    }

    #[tokio::test]
    async fn test_prepare_migrates_fresh_database() {
        let dir = TempDir::new().unwrap();
        let db = SqliteDatabase::open(dir.path().join("homeserver.db")).unwrap();
        let applied = prepare_database(&db, "example.org").await.unwrap();
        assert!(applied > 0);
        assert_eq!(prepare_database(&db, "example.org").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drift_blocks_migrations() {
        let dir = TempDir::new().unwrap();
        let db = SqliteDatabase::open(dir.path().join("homeserver.db")).unwrap();
        // An older deployment: users exist, newer schema steps do not.
        db.execute_batch(
            "CREATE TABLE users (name TEXT PRIMARY KEY, creation_ts INTEGER NOT NULL);
             INSERT INTO users (name, creation_ts) VALUES ('@alice:example.com', 0);",
        )
        .unwrap();

        let err = prepare_database(&db, "example.org").await.unwrap_err();
        assert!(matches!(err, StoreError::ConfigurationDrift { .. }));
        assert_eq!(db.schema_version().unwrap(), 0);
    }
}
