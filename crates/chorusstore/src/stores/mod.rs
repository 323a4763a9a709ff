//! Domain stores composed by [`crate::DataStore`].
//!
//! Each store owns the allocators and change caches for its streams. Writes
//! follow one shape: reserve a token, register the cache changes on the
//! reservation, persist the rows, then complete the reservation. The changes
//! are noted before the token becomes visible even when the write fails.

mod devices;
mod events;
mod receipts;
mod user_directory;

pub use devices::DeviceListsStore;
pub use events::EventsStore;
pub use receipts::{NewReceipt, ReceiptsStore};
pub use user_directory::{SearchResults, UserDirectoryStore};

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::change_cache::StreamChangeCache;
use crate::clock::Clock;
use crate::database::{CachePrimeQuery, Database, StreamCounters};
use crate::error::Result;
use crate::stream_id::StreamIdGenerator;
use crate::types::StreamToken;

/// Rows read back per cache when priming at startup.
pub const CACHE_PRIME_LIMIT: u64 = 1000;

/// Shared dependencies handed to every domain store constructor.
#[derive(Clone)]
pub struct StoreContext {
    pub db: Arc<dyn Database>,
    pub counters: Arc<dyn StreamCounters>,
    pub clock: Arc<dyn Clock>,
    /// History capacity for each change cache, already scaled.
    pub cache_capacity: usize,
    pub allocation_timeout: Duration,
}

impl StoreContext {
    pub(crate) async fn generator(&self, counter: &str, streams: &[&str]) -> Result<StreamIdGenerator> {
        StreamIdGenerator::with_timeout(
            Arc::clone(&self.counters),
            counter,
            streams,
            self.allocation_timeout,
        )
        .await
    }

    /// Build a change cache and prefill it from the latest rows of `table`.
    pub(crate) async fn primed_cache(
        &self,
        name: &str,
        table: &'static str,
        entity_column: &'static str,
        stream_column: &'static str,
        max_value: StreamToken,
    ) -> Result<Arc<StreamChangeCache>> {
        let query = CachePrimeQuery {
            table,
            entity_column,
            stream_column,
            max_value,
            limit: CACHE_PRIME_LIMIT,
        };
        let prime = self.db.prime_change_cache(&query).await?;
        let cache = StreamChangeCache::new(name, prime.floor, self.cache_capacity);
        let rows = prime.entries.len();
        cache.prefill(prime.entries, prime.floor);
        debug!(cache = name, rows, floor = %cache.floor(), max = %max_value, "primed change cache");
        Ok(Arc::new(cache))
    }
}

/// A store that allocates on one or more streams.
pub trait StreamSource {
    /// Allocators owned by this store. Stores that only read another
    /// store's position return nothing.
    fn generators(&self) -> Vec<&StreamIdGenerator>;
}
