//! The narrow database boundary the coordination layer consumes.
//!
//! Query planning and SQL live behind these traits. Implementations return
//! `anyhow::Result`; the stores translate failures into `StoreError`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::StreamToken;

/// Durable, monotonically increasing counters backing stream allocators.
///
/// Several processes may share one counter. Implementations must make
/// `advance_stream` atomic with respect to every other caller of the same
/// counter, in this process or any other.
#[async_trait]
pub trait StreamCounters: Send + Sync {
    /// Reserve `count` positions on `counter` and return the last one reserved.
    /// A counter that has never been advanced starts at zero.
    async fn advance_stream(&self, counter: &str, count: u64) -> Result<StreamToken>;

    /// The last position durably reserved on `counter`.
    async fn stream_position(&self, counter: &str) -> Result<StreamToken>;
}

/// Read access for the one-shot startup consistency check.
#[async_trait]
pub trait ConsistencyCursor: Send + Sync {
    /// Any one persisted user id, or `None` when no users exist (including
    /// when the users table has not been created yet).
    async fn first_user_id(&self) -> Result<Option<String>>;
}

/// Parameters for the query that primes a change cache at startup.
///
/// Selects, per entity, the latest `stream_column` value in
/// `(max_value - limit, max_value]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePrimeQuery {
    pub table: &'static str,
    pub entity_column: &'static str,
    pub stream_column: &'static str,
    pub max_value: StreamToken,
    pub limit: u64,
}

impl CachePrimeQuery {
    /// Lowest `since` token the primed rows can answer precisely.
    pub fn floor(&self) -> StreamToken {
        StreamToken(self.max_value.0.saturating_sub(self.limit))
    }
}

/// Rows returned by a priming query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePrime {
    pub entries: Vec<(String, StreamToken)>,
    pub floor: StreamToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRow {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub event_type: String,
    pub stream_ordering: StreamToken,
    pub received_ts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDeltaRow {
    pub stream_id: StreamToken,
    pub room_id: String,
    pub event_type: String,
    pub state_key: String,
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListRow {
    pub stream_id: StreamToken,
    pub user_id: String,
    pub device_id: String,
    pub ts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRow {
    pub stream_id: StreamToken,
    pub room_id: String,
    pub receipt_type: String,
    pub user_id: String,
    pub event_id: String,
    pub ts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDirectoryEntry {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Everything the domain stores need from the storage engine.
#[async_trait]
pub trait Database: StreamCounters + ConsistencyCursor {
    /// Apply outstanding schema migrations, returning how many ran.
    async fn apply_migrations(&self) -> Result<usize>;

    async fn prime_change_cache(&self, query: &CachePrimeQuery) -> Result<CachePrime>;

    /// Highest persisted event stream ordering, zero when there are no events.
    async fn max_stream_ordering(&self) -> Result<StreamToken>;

    /// Lowest persisted event stream ordering, zero when there are no events.
    async fn min_stream_ordering(&self) -> Result<StreamToken>;

    async fn insert_event(&self, row: &EventRow) -> Result<()>;

    async fn insert_state_delta(&self, row: &StateDeltaRow) -> Result<()>;

    /// Insert every row or none of them.
    async fn insert_device_list_changes(&self, rows: &[DeviceListRow]) -> Result<()>;

    /// Insert every row or none of them.
    async fn insert_receipts(&self, rows: &[ReceiptRow]) -> Result<()>;

    async fn upsert_user_directory_entry(&self, entry: &UserDirectoryEntry) -> Result<()>;

    async fn add_users_in_public_room(&self, room_id: &str, user_ids: &[String]) -> Result<()>;

    async fn user_directory_entries(&self) -> Result<Vec<UserDirectoryEntry>>;

    /// `(user_id, room_id)` pairs for users in public rooms.
    async fn users_in_public_rooms(&self) -> Result<Vec<(String, String)>>;

    async fn delete_all_from_user_dir(&self) -> Result<()>;

    async fn user_directory_stream_pos(&self) -> Result<Option<StreamToken>>;

    async fn set_user_directory_stream_pos(&self, pos: Option<StreamToken>) -> Result<()>;
}
