use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{StoreContext, StreamSource};
use crate::change_cache::{CacheAnswer, StreamChangeCache};
use crate::clock::Clock;
use crate::database::{Database, ReceiptRow};
use crate::error::Result;
use crate::stream_id::StreamIdGenerator;
use crate::types::StreamToken;

/// A receipt waiting to be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReceipt {
    pub room_id: String,
    pub receipt_type: String,
    pub user_id: String,
    pub event_id: String,
}

/// Read receipts, with a change cache keyed by room.
pub struct ReceiptsStore {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    stream: StreamIdGenerator,
    cache: Arc<StreamChangeCache>,
}

impl ReceiptsStore {
    pub const COUNTER: &'static str = "receipts";

    pub async fn new(ctx: &StoreContext) -> Result<Self> {
        let stream = ctx.generator(Self::COUNTER, &[Self::COUNTER]).await?;
        let cache = ctx
            .primed_cache(
                "receipts_room_change_cache",
                "receipts",
                "room_id",
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

    pub fn get_max_receipt_stream_id(&self) -> StreamToken {
        self.stream.current_token()
    }

    pub async fn insert_receipt(&self, receipt: &NewReceipt) -> Result<StreamToken> {
        let mut tokens = self.insert_receipts(std::slice::from_ref(receipt)).await?;
        Ok(tokens.pop().unwrap_or(StreamToken::ZERO))
    }

    /// Persist a batch under one reservation of consecutive tokens.
    pub async fn insert_receipts(&self, receipts: &[NewReceipt]) -> Result<Vec<StreamToken>> {
        if receipts.is_empty() {
            return Ok(Vec::new());
        }

        let mut reservation = self.stream.allocate_many(receipts.len() as u64).await?;
        let ts = self.clock.time_msec();
        let tokens: Vec<StreamToken> = reservation.tokens().collect();

        let rows: Vec<ReceiptRow> = receipts
            .iter()
            .zip(&tokens)
            .map(|(receipt, token)| ReceiptRow {
                stream_id: *token,
                room_id: receipt.room_id.clone(),
                receipt_type: receipt.receipt_type.clone(),
                user_id: receipt.user_id.clone(),
                event_id: receipt.event_id.clone(),
                ts,
            })
            .collect();
        for row in &rows {
            reservation.track(&self.cache, row.room_id.as_str(), row.stream_id);
        }
        self.db.insert_receipts(&rows).await?;
        reservation.complete();

        debug!(count = tokens.len(), last = ?tokens.last(), "persisted receipts");
        Ok(tokens)
    }

    pub fn has_room_receipts_changed(&self, room_id: &str, since: StreamToken) -> CacheAnswer<bool> {
        self.cache.has_changed(room_id, since)
    }
}

impl StreamSource for ReceiptsStore {
    fn generators(&self) -> Vec<&StreamIdGenerator> {
        vec![&self.stream]
    }
}

impl std::fmt::Debug for ReceiptsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptsStore")
            .field("stream", &self.stream)
            .finish()
    }
}
