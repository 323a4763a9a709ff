//! The composed data store.
//!
//! `DataStore` builds every domain store in dependency order against one
//! database, takes its startup snapshots, and exposes the stores plus a few
//! cross-cutting accessors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chorusconf::ChorusConfig;
use tracing::{info, Level};

use crate::clock::Clock;
use crate::database::{Database, StreamCounters};
use crate::error::{Result, StoreError};
use crate::fault::FaultRecord;
use crate::stores::{
    DeviceListsStore, EventsStore, ReceiptsStore, StoreContext, StreamSource, UserDirectoryStore,
};
use crate::stream_id::DEFAULT_ALLOCATION_TIMEOUT;
use crate::types::StreamToken;

/// Settings the data store is constructed with.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub server_name: String,
    /// History capacity of each change cache, after scaling.
    pub change_cache_capacity: usize,
    pub user_directory_enabled: bool,
    pub search_all_users: bool,
    pub allocation_timeout: Duration,
}

impl StoreConfig {
    pub fn from_config(config: &ChorusConfig) -> Self {
        Self {
            server_name: config.server.server_name.clone(),
            change_cache_capacity: config.caches.change_cache_capacity(),
            user_directory_enabled: config.user_directory.enabled,
            search_all_users: config.user_directory.search_all_users,
            allocation_timeout: DEFAULT_ALLOCATION_TIMEOUT,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_config(&ChorusConfig::default())
    }
}

pub struct DataStore {
    config: StoreConfig,
    db: Arc<dyn Database>,
    events: EventsStore,
    device_lists: DeviceListsStore,
    receipts: ReceiptsStore,
    user_directory: UserDirectoryStore,
    stream_order_on_start: StreamToken,
    min_stream_order_on_start: StreamToken,
}

impl DataStore {
    /// Construct every domain store. The database must already be prepared
    /// (see [`crate::consistency::prepare_database`]).
    pub async fn new<D>(db: Arc<D>, clock: Arc<dyn Clock>, config: StoreConfig) -> Result<Self>
    where
        D: Database + 'static,
    {
        let counters: Arc<dyn StreamCounters> = Arc::clone(&db) as Arc<dyn StreamCounters>;
        let db: Arc<dyn Database> = db;
        let ctx = StoreContext {
            db: Arc::clone(&db),
            counters,
            clock,
            cache_capacity: config.change_cache_capacity,
            allocation_timeout: config.allocation_timeout,
        };

        let events = EventsStore::new(&ctx)
            .await
            .map_err(|e| construction("events", e))?;
        let device_lists = DeviceListsStore::new(&ctx)
            .await
            .map_err(|e| construction("device_lists", e))?;
        let receipts = ReceiptsStore::new(&ctx)
            .await
            .map_err(|e| construction("receipts", e))?;
        let user_directory = UserDirectoryStore::new(
            &ctx,
            events.stream().clone(),
            config.user_directory_enabled,
            config.search_all_users,
        )
        .await
        .map_err(|e| construction("user_directory", e))?;

        let stream_order_on_start = events.get_room_max_stream_ordering();
        let min_stream_order_on_start = db
            .min_stream_ordering()
            .await
            .map_err(|e| construction("events", e.into()))?;

        info!(
            server_name = %config.server_name,
            %stream_order_on_start,
            %min_stream_order_on_start,
            device_stream = %device_lists.get_device_stream_token(),
            "data store ready"
        );

        Ok(Self {
            config,
            db,
            events,
            device_lists,
            receipts,
            user_directory,
            stream_order_on_start,
            min_stream_order_on_start,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn events(&self) -> &EventsStore {
        &self.events
    }

    pub fn device_lists(&self) -> &DeviceListsStore {
        &self.device_lists
    }

    pub fn receipts(&self) -> &ReceiptsStore {
        &self.receipts
    }

    pub fn user_directory(&self) -> &UserDirectoryStore {
        &self.user_directory
    }

    /// Highest event stream ordering visible when the store was built.
    pub fn stream_order_on_start(&self) -> StreamToken {
        self.stream_order_on_start
    }

    /// Lowest persisted event stream ordering when the store was built.
    pub fn min_stream_order_on_start(&self) -> StreamToken {
        self.min_stream_order_on_start
    }

    pub fn get_device_stream_token(&self) -> StreamToken {
        self.device_lists.get_device_stream_token()
    }

    pub fn get_room_max_stream_ordering(&self) -> StreamToken {
        self.events.get_room_max_stream_ordering()
    }

    /// Current token of every logical stream, keyed by stream name.
    /// Streams sharing an allocator report the same token.
    pub fn current_tokens(&self) -> BTreeMap<String, StreamToken> {
        let sources: [&dyn StreamSource; 4] = [
            &self.events,
            &self.device_lists,
            &self.receipts,
            &self.user_directory,
        ];

        let mut tokens = BTreeMap::new();
        for source in sources {
            for generator in source.generators() {
                let current = generator.current_token();
                for name in generator.stream_names() {
                    tokens.insert(name.clone(), current);
                }
            }
        }
        tokens
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("server_name", &self.config.server_name)
            .field("stream_order_on_start", &self.stream_order_on_start)
            .field("min_stream_order_on_start", &self.min_stream_order_on_start)
            .finish()
    }
}

fn construction(store: &'static str, source: StoreError) -> StoreError {
    let err = StoreError::Construction {
        store,
        source: Box::new(source),
    };
    let (record, _) = FaultRecord::new("chorusstore::data_store", Level::ERROR, "store construction failed")
        .fields([("store", store.to_string())]);
    record.cause(&err).emit();
    err
}
