use std::sync::Arc;

use tracing::{debug, info};

use super::{StoreContext, StreamSource};
use crate::change_cache::{CacheAnswer, StreamChangeCache};
use crate::clock::Clock;
use crate::database::{Database, EventRow, StateDeltaRow};
use crate::error::{Result, StoreError};
use crate::stream_id::StreamIdGenerator;
use crate::types::StreamToken;

/// Events and current-state deltas. Both share the `events` counter, so a
/// state delta is ordered against the event that caused it.
pub struct EventsStore {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    stream: StreamIdGenerator,
    room_events_cache: Arc<StreamChangeCache>,
    state_delta_cache: Arc<StreamChangeCache>,
}

impl EventsStore {
    pub const COUNTER: &'static str = "events";
    pub const STATE_DELTA_STREAM: &'static str = "current_state_deltas";

    pub async fn new(ctx: &StoreContext) -> Result<Self> {
        let stream = ctx
            .generator(Self::COUNTER, &[Self::COUNTER, Self::STATE_DELTA_STREAM])
            .await?;

        let persisted = ctx.db.max_stream_ordering().await?;
        let events_max = stream.current_token();
        if events_max < persisted {
            return Err(StoreError::Invariant {
                store: "events",
                message: format!(
                    "durable counter at {events_max} is behind persisted stream ordering {persisted}"
                ),
            });
        }

        let room_events_cache = ctx
            .primed_cache("events_stream", "events", "room_id", "stream_ordering", events_max)
            .await?;
        let state_delta_cache = ctx
            .primed_cache(
                "current_state_delta_stream",
                "current_state_delta_stream",
                "room_id",
                "stream_id",
                events_max,
            )
            .await?;

        info!(%events_max, "events store ready");

        Ok(Self {
            db: Arc::clone(&ctx.db),
            clock: Arc::clone(&ctx.clock),
            stream,
            room_events_cache,
            state_delta_cache,
        })
    }

    /// Allocator shared by events and current-state deltas.
    pub fn stream(&self) -> &StreamIdGenerator {
        &self.stream
    }

    pub fn room_events_cache(&self) -> &Arc<StreamChangeCache> {
        &self.room_events_cache
    }

    pub fn state_delta_cache(&self) -> &Arc<StreamChangeCache> {
        &self.state_delta_cache
    }

    /// Highest event stream ordering readers may observe.
    pub fn get_room_max_stream_ordering(&self) -> StreamToken {
        self.stream.current_token()
    }

    /// Persist one event and return its stream ordering.
    pub async fn persist_event(
        &self,
        event_id: &str,
        room_id: &str,
        sender: &str,
        event_type: &str,
    ) -> Result<StreamToken> {
        let mut reservation = self.stream.allocate().await?;
        let token = reservation.token();
        reservation.track(&self.room_events_cache, room_id, token);

        let row = EventRow {
            event_id: event_id.to_string(),
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            event_type: event_type.to_string(),
            stream_ordering: token,
            received_ts: self.clock.time_msec(),
        };
        self.db.insert_event(&row).await?;
        reservation.complete();

        debug!(event_id, room_id, %token, "persisted event");
        Ok(token)
    }

    /// Record a change to a room's current state. `event_id` of `None`
    /// means the state entry was removed.
    pub async fn persist_state_delta(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        event_id: Option<&str>,
    ) -> Result<StreamToken> {
        let mut reservation = self.stream.allocate().await?;
        let token = reservation.token();
        reservation.track(&self.state_delta_cache, room_id, token);

        let row = StateDeltaRow {
            stream_id: token,
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            state_key: state_key.to_string(),
            event_id: event_id.map(str::to_string),
        };
        self.db.insert_state_delta(&row).await?;
        reservation.complete();

        debug!(room_id, event_type, state_key, %token, "persisted current state delta");
        Ok(token)
    }

    pub fn has_room_changed_since(&self, room_id: &str, since: StreamToken) -> CacheAnswer<bool> {
        self.room_events_cache.has_changed(room_id, since)
    }

    pub fn has_room_state_changed_since(&self, room_id: &str, since: StreamToken) -> CacheAnswer<bool> {
        self.state_delta_cache.has_changed(room_id, since)
    }
}

impl StreamSource for EventsStore {
    fn generators(&self) -> Vec<&StreamIdGenerator> {
        vec![&self.stream]
    }
}

impl std::fmt::Debug for EventsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventsStore")
            .field("stream", &self.stream)
            .field("state_delta_floor", &self.state_delta_cache.floor())
            .finish()
    }
}
