//! SQLite implementation of the database boundary.
//!
//! Connection-per-call: every operation opens a fresh connection with WAL and
//! a busy timeout, and runs on the blocking pool. Several processes may open
//! the same file; stream counters are advanced with a single atomic upsert.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use crate::database::{
    CachePrime, CachePrimeQuery, ConsistencyCursor, Database, DeviceListRow, EventRow,
    ReceiptRow, StateDeltaRow, StreamCounters, UserDirectoryEntry,
};
use crate::types::StreamToken;

/// Versioned schema steps. Applied in order, each exactly once.
const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS stream_positions (
    stream_name TEXT PRIMARY KEY,
    position INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    name TEXT PRIMARY KEY,
    creation_ts INTEGER NOT NULL
);
"#,
    ),
    (
        2,
        r#"
CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    type TEXT NOT NULL,
    stream_ordering INTEGER NOT NULL UNIQUE,
    received_ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS events_room_stream ON events(room_id, stream_ordering);

CREATE TABLE IF NOT EXISTS current_state_delta_stream (
    stream_id INTEGER NOT NULL,
    room_id TEXT NOT NULL,
    type TEXT NOT NULL,
    state_key TEXT NOT NULL,
    event_id TEXT
);
CREATE INDEX IF NOT EXISTS current_state_delta_stream_idx
    ON current_state_delta_stream(stream_id);
"#,
    ),
    (
        3,
        r#"
CREATE TABLE IF NOT EXISTS device_lists_stream (
    stream_id INTEGER NOT NULL,
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS device_lists_stream_idx ON device_lists_stream(stream_id);

CREATE TABLE IF NOT EXISTS receipts (
    stream_id INTEGER NOT NULL,
    room_id TEXT NOT NULL,
    receipt_type TEXT NOT NULL,
    user_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS receipts_stream_idx ON receipts(stream_id);
"#,
    ),
    (
        4,
        r#"
CREATE TABLE IF NOT EXISTS user_directory (
    user_id TEXT PRIMARY KEY,
    display_name TEXT,
    avatar_url TEXT
);

CREATE TABLE IF NOT EXISTS users_in_public_rooms (
    user_id TEXT NOT NULL,
    room_id TEXT NOT NULL,
    PRIMARY KEY (user_id, room_id)
);

CREATE TABLE IF NOT EXISTS user_directory_stream_pos (
    lock TEXT NOT NULL DEFAULT 'X' UNIQUE,
    stream_id INTEGER,
    CHECK (lock = 'X')
);
INSERT OR IGNORE INTO user_directory_stream_pos (lock, stream_id) VALUES ('X', NULL);
"#,
    ),
];

/// Database handle. Cheap to clone; holds only the file path.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    path: PathBuf,
}

impl SqliteDatabase {
    /// Open (creating if necessary) the database file at `path`.
    ///
    /// The schema is not touched; run migrations through
    /// [`crate::consistency::prepare_database`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db = Self { path };
        db.conn()?;
        Ok(db)
    }

    /// Create a temporary database file with a unique name.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let db_name = format!("chorus_{}_{}.db", std::process::id(), unique_id);
        Self::open(std::env::temp_dir().join(db_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection> {
        open_connection(&self.path)
    }

    /// Run a closure against a fresh connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path)?;
            f(&mut conn)
        })
        .await
        .context("database task panicked")?
    }

    /// Record a registered local or remote user.
    pub async fn register_user(&self, user_id: &str, creation_ts: u64) -> Result<()> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO users (name, creation_ts) VALUES (?1, ?2)",
                params![user_id, to_sql(creation_ts)],
            )?;
            Ok(())
        })
        .await
    }

    /// Run raw SQL. Intended for fixtures and administrative repair.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?
            .execute_batch(sql)
            .context("Failed to execute SQL batch")
    }

    /// Schema version currently applied, zero for a fresh database.
    pub fn schema_version(&self) -> Result<u32> {
        let conn = self.conn()?;
        if !table_exists(&conn, "schema_migrations")? {
            return Ok(0);
        }
        let version: Option<u32> =
            conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))?;
        Ok(version.unwrap_or(0))
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open database: {:?}", path))?;

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    Ok(conn)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn token_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<StreamToken> {
    let raw: i64 = row.get(idx)?;
    Ok(StreamToken(raw.max(0) as u64))
}

#[async_trait]
impl StreamCounters for SqliteDatabase {
    async fn advance_stream(&self, counter: &str, count: u64) -> Result<StreamToken> {
        let counter = counter.to_string();
        self.with_conn(move |conn| {
            let position = conn
                .query_row(
                    "INSERT INTO stream_positions (stream_name, position) VALUES (?1, ?2)
                     ON CONFLICT(stream_name) DO UPDATE SET position = position + excluded.position
                     RETURNING position",
                    params![counter, to_sql(count)],
                    |row| token_at(row, 0),
                )
                .with_context(|| format!("Failed to advance stream counter {counter}"))?;
            Ok(position)
        })
        .await
    }

    async fn stream_position(&self, counter: &str) -> Result<StreamToken> {
        let counter = counter.to_string();
        self.with_conn(move |conn| {
            let position = conn
                .query_row(
                    "SELECT position FROM stream_positions WHERE stream_name = ?1",
                    [&counter],
                    |row| token_at(row, 0),
                )
                .optional()
                .with_context(|| format!("Failed to read stream counter {counter}"))?;
            Ok(position.unwrap_or(StreamToken::ZERO))
        })
        .await
    }
}

#[async_trait]
impl ConsistencyCursor for SqliteDatabase {
    async fn first_user_id(&self) -> Result<Option<String>> {
        self.with_conn(|conn| {
            if !table_exists(conn, "users")? {
                return Ok(None);
            }
            let user_id = conn
                .query_row("SELECT name FROM users LIMIT 1", [], |row| row.get(0))
                .optional()?;
            Ok(user_id)
        })
        .await
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn apply_migrations(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
                )",
            )?;
            let current: u32 = tx
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                    [],
                    |row| row.get(0),
                )
                .context("Failed to read schema version")?;

            let mut applied = 0;
            for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
                tx.execute_batch(sql)
                    .with_context(|| format!("Failed to apply migration {version}"))?;
                tx.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [version])?;
                debug!(version, "applied schema migration");
                applied += 1;
            }
            tx.commit()?;

            if applied > 0 {
                info!(applied, from = current, "database schema upgraded");
            }
            Ok(applied)
        })
        .await
    }

    async fn prime_change_cache(&self, query: &CachePrimeQuery) -> Result<CachePrime> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let floor = query.floor();
            let sql = format!(
                "SELECT {entity}, MAX({stream}) FROM {table}
                 WHERE {stream} > ?1 AND {stream} <= ?2
                 GROUP BY {entity}
                 ORDER BY MAX({stream}) ASC",
                entity = query.entity_column,
                stream = query.stream_column,
                table = query.table,
            );
            let mut stmt = conn
                .prepare(&sql)
                .with_context(|| format!("Failed to prepare prime query on {}", query.table))?;
            let entries = stmt
                .query_map(params![to_sql(floor.0), to_sql(query.max_value.0)], |row| {
                    Ok((row.get::<_, String>(0)?, token_at(row, 1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(CachePrime { entries, floor })
        })
        .await
    }

    async fn max_stream_ordering(&self) -> Result<StreamToken> {
        self.with_conn(|conn| {
            let max = conn.query_row(
                "SELECT COALESCE(MAX(stream_ordering), 0) FROM events",
                [],
                |row| token_at(row, 0),
            )?;
            Ok(max)
        })
        .await
    }

    async fn min_stream_ordering(&self) -> Result<StreamToken> {
        self.with_conn(|conn| {
            let min = conn.query_row(
                "SELECT COALESCE(MIN(stream_ordering), 0) FROM events",
                [],
                |row| token_at(row, 0),
            )?;
            Ok(min)
        })
        .await
    }

    async fn insert_event(&self, row: &EventRow) -> Result<()> {
        let row = row.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO events (event_id, room_id, sender, type, stream_ordering, received_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.event_id,
                    row.room_id,
                    row.sender,
                    row.event_type,
                    to_sql(row.stream_ordering.0),
                    to_sql(row.received_ts),
                ],
            )
            .with_context(|| format!("Failed to insert event {}", row.event_id))?;
            Ok(())
        })
        .await
    }

    async fn insert_state_delta(&self, row: &StateDeltaRow) -> Result<()> {
        let row = row.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO current_state_delta_stream (stream_id, room_id, type, state_key, event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    to_sql(row.stream_id.0),
                    row.room_id,
                    row.event_type,
                    row.state_key,
                    row.event_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_device_list_changes(&self, rows: &[DeviceListRow]) -> Result<()> {
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO device_lists_stream (stream_id, user_id, device_id, ts)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for row in &rows {
                    stmt.execute(params![
                        to_sql(row.stream_id.0),
                        row.user_id,
                        row.device_id,
                        to_sql(row.ts)
                    ])
                    .with_context(|| {
                        format!("Failed to insert device list change {} {}", row.user_id, row.device_id)
                    })?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert_receipts(&self, rows: &[ReceiptRow]) -> Result<()> {
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO receipts (stream_id, room_id, receipt_type, user_id, event_id, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for row in &rows {
                    stmt.execute(params![
                        to_sql(row.stream_id.0),
                        row.room_id,
                        row.receipt_type,
                        row.user_id,
                        row.event_id,
                        to_sql(row.ts),
                    ])
                    .with_context(|| format!("Failed to insert receipt for {}", row.room_id))?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn upsert_user_directory_entry(&self, entry: &UserDirectoryEntry) -> Result<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO user_directory (user_id, display_name, avatar_url) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    avatar_url = excluded.avatar_url",
                params![entry.user_id, entry.display_name, entry.avatar_url],
            )?;
            Ok(())
        })
        .await
    }

    async fn add_users_in_public_room(&self, room_id: &str, user_ids: &[String]) -> Result<()> {
        let room_id = room_id.to_string();
        let user_ids = user_ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO users_in_public_rooms (user_id, room_id) VALUES (?1, ?2)",
                )?;
                for user_id in &user_ids {
                    stmt.execute(params![user_id, room_id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn user_directory_entries(&self) -> Result<Vec<UserDirectoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, display_name, avatar_url FROM user_directory ORDER BY user_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(UserDirectoryEntry {
                    user_id: row.get(0)?,
                    display_name: row.get(1)?,
                    avatar_url: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
        .await
    }

    async fn users_in_public_rooms(&self) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, room_id FROM users_in_public_rooms ORDER BY user_id, room_id",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
        .await
    }

    async fn delete_all_from_user_dir(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                DELETE FROM user_directory;
                DELETE FROM users_in_public_rooms;
                ",
            )?;
            Ok(())
        })
        .await
    }

    async fn user_directory_stream_pos(&self) -> Result<Option<StreamToken>> {
        self.with_conn(|conn| {
            let pos: Option<i64> = conn
                .query_row(
                    "SELECT stream_id FROM user_directory_stream_pos WHERE lock = 'X'",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            Ok(pos.map(|p| StreamToken(p.max(0) as u64)))
        })
        .await
    }

    async fn set_user_directory_stream_pos(&self, pos: Option<StreamToken>) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO user_directory_stream_pos (lock, stream_id) VALUES ('X', ?1)
                 ON CONFLICT(lock) DO UPDATE SET stream_id = excluded.stream_id",
                [pos.map(|p| to_sql(p.0))],
            )?;
            Ok(())
        })
        .await
    }
}
