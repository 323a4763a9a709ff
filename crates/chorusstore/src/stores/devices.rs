use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::{StoreContext, StreamSource};
use crate::change_cache::{CacheAnswer, StreamChangeCache};
use crate::clock::Clock;
use crate::database::{Database, DeviceListRow};
use crate::error::Result;
use crate::stream_id::StreamIdGenerator;
use crate::types::StreamToken;

/// Device list changes, keyed by user.
pub struct DeviceListsStore {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    stream: StreamIdGenerator,
    cache: Arc<StreamChangeCache>,
}

impl DeviceListsStore {
    pub const COUNTER: &'static str = "device_lists_stream";

    pub async fn new(ctx: &StoreContext) -> Result<Self> {
        let stream = ctx.generator(Self::COUNTER, &[Self::COUNTER]).await?;
        let cache = ctx
            .primed_cache(
                "device_lists_stream",
                "device_lists_stream",
                "user_id",
                "stream_id",
                stream.current_token(),
            )
            .await?;

        Ok(Self {
            db: Arc::clone(&ctx.db),
            clock: Arc::clone(&ctx.clock),
            stream,
            cache,
        })
    }

    pub fn stream(&self) -> &StreamIdGenerator {
        &self.stream
    }

    pub fn cache(&self) -> &Arc<StreamChangeCache> {
        &self.cache
    }

    pub fn get_device_stream_token(&self) -> StreamToken {
        self.stream.current_token()
    }

    /// Record that `device_ids` of `user_id` changed. All rows share one token.
    pub async fn add_device_change_to_stream(
        &self,
        user_id: &str,
        device_ids: &[String],
    ) -> Result<StreamToken> {
        let mut reservation = self.stream.allocate().await?;
        let token = reservation.token();
        reservation.track(&self.cache, user_id, token);
        let ts = self.clock.time_msec();

        let rows: Vec<DeviceListRow> = device_ids
            .iter()
            .map(|device_id| DeviceListRow {
                stream_id: token,
                user_id: user_id.to_string(),
                device_id: device_id.clone(),
                ts,
            })
            .collect();
        self.db.insert_device_list_changes(&rows).await?;
        reservation.complete();

        debug!(user_id, devices = device_ids.len(), %token, "device list change recorded");
        Ok(token)
    }

    /// Users whose device lists changed after `since`.
    pub fn get_users_whose_devices_changed(&self, since: StreamToken) -> CacheAnswer<HashSet<String>> {
        self.cache.get_changed_since(since)
    }
}

impl StreamSource for DeviceListsStore {
    fn generators(&self) -> Vec<&StreamIdGenerator> {
        vec![&self.stream]
    }
}

impl std::fmt::Debug for DeviceListsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceListsStore")
            .field("stream", &self.stream)
            .finish()
    }
}
