//! Stream position allocation.
//!
//! A `StreamIdGenerator` hands out positions from one durable counter. Several
//! logical streams may share the counter (events and current-state deltas do),
//! so one token orders writes across all of them.
//!
//! Tokens are *reserved* by `allocate` and become *visible* through
//! `current_token` only once every locally reserved token at or below them
//! has finished. A writer registers the change-cache entries its rows will
//! produce on the reservation before touching the database. Those entries are
//! applied when the reservation completes or is dropped, always before the
//! tokens become visible, so a failed or cancelled write can only cost a
//! spurious "changed" answer, never a missed one.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, Level};

use crate::change_cache::StreamChangeCache;
use crate::database::StreamCounters;
use crate::error::{Result, StoreError};
use crate::fault::FaultRecord;
use crate::types::StreamToken;

/// How long a durable counter round trip may take before allocation fails.
pub const DEFAULT_ALLOCATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct AllocState {
    /// Highest token reserved by this generator (or the durable baseline).
    max_issued: u64,
    /// Highest token readers may observe.
    visible: u64,
    /// Reserved and not yet finished.
    in_flight: BTreeSet<u64>,
    /// Finished but still above an in-flight token.
    finished: BTreeSet<u64>,
}

impl AllocState {
    fn finish(&mut self, tokens: impl Iterator<Item = u64>) {
        for token in tokens {
            if self.in_flight.remove(&token) {
                self.finished.insert(token);
            }
        }

        let limit = self.in_flight.first().copied();
        while let Some(&token) = self.finished.first() {
            if limit.is_some_and(|l| token > l) {
                break;
            }
            self.visible = self.visible.max(token);
            self.finished.pop_first();
        }
    }
}

struct Inner {
    counter: String,
    streams: Vec<String>,
    counters: Arc<dyn StreamCounters>,
    timeout: Duration,
    /// Serializes reservations so tokens enter `in_flight` in issue order.
    reserve_lock: tokio::sync::Mutex<()>,
    state: Mutex<AllocState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, AllocState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Allocator for one durable counter shared by one or more logical streams.
#[derive(Clone)]
pub struct StreamIdGenerator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIdGenerator")
            .field("counter", &self.inner.counter)
            .field("streams", &self.inner.streams)
            .field("current", &self.current_token())
            .finish()
    }
}

impl StreamIdGenerator {
    /// Create a generator over `counter`, resuming from its durable position.
    ///
    /// `streams` names every logical stream sharing the numbering; the first
    /// one is conventionally the counter's own name.
    pub async fn new(
        counters: Arc<dyn StreamCounters>,
        counter: &str,
        streams: &[&str],
    ) -> Result<Self> {
        Self::with_timeout(counters, counter, streams, DEFAULT_ALLOCATION_TIMEOUT).await
    }

    pub async fn with_timeout(
        counters: Arc<dyn StreamCounters>,
        counter: &str,
        streams: &[&str],
        timeout: Duration,
    ) -> Result<Self> {
        let baseline = match tokio::time::timeout(timeout, counters.stream_position(counter)).await
        {
            Ok(Ok(position)) => position,
            Ok(Err(source)) => return Err(unavailable(counter, source)),
            Err(_) => return Err(unavailable(counter, anyhow::anyhow!("timed out after {timeout:?}"))),
        };

        let mut streams: Vec<String> = streams.iter().map(|s| s.to_string()).collect();
        if streams.is_empty() {
            streams.push(counter.to_string());
        }

        debug!(counter, %baseline, ?streams, "stream id generator resumed");

        Ok(Self {
            inner: Arc::new(Inner {
                counter: counter.to_string(),
                streams,
                counters,
                timeout,
                reserve_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(AllocState {
                    max_issued: baseline.0,
                    visible: baseline.0,
                    ..AllocState::default()
                }),
            }),
        })
    }

    /// Name of the durable counter.
    pub fn counter(&self) -> &str {
        &self.inner.counter
    }

    /// Logical streams sharing this generator's numbering.
    pub fn stream_names(&self) -> &[String] {
        &self.inner.streams
    }

    /// Highest token whose write, and every write below it, has finished.
    pub fn current_token(&self) -> StreamToken {
        StreamToken(self.inner.state().visible)
    }

    /// Number of reservations not yet completed or released.
    pub fn in_flight(&self) -> usize {
        self.inner.state().in_flight.len()
    }

    /// Reserve the next token.
    pub async fn allocate(&self) -> Result<Reservation> {
        self.allocate_many(1).await
    }

    /// Reserve `count` consecutive tokens with a single durable round trip.
    pub async fn allocate_many(&self, count: u64) -> Result<Reservation> {
        let count = count.max(1);
        let _serial = self.inner.reserve_lock.lock().await;

        let advanced = tokio::time::timeout(
            self.inner.timeout,
            self.inner.counters.advance_stream(&self.inner.counter, count),
        )
        .await;

        let last = match advanced {
            Ok(Ok(last)) => last.0,
            Ok(Err(source)) => return Err(self.report(unavailable(&self.inner.counter, source))),
            Err(_) => {
                let source = anyhow::anyhow!("timed out after {:?}", self.inner.timeout);
                return Err(self.report(unavailable(&self.inner.counter, source)));
            }
        };
        let first = last.saturating_sub(count - 1);

        let mut state = self.inner.state();
        if first <= state.max_issued || first == 0 {
            // The durable counter went backwards (restored backup, foreign
            // writer resetting it). Handing these out would duplicate tokens.
            let err = StoreError::StaleReservation {
                stream: self.inner.counter.clone(),
                token: StreamToken(first),
            };
            drop(state);
            return Err(self.report(err));
        }

        state.max_issued = last;
        state.in_flight.extend(first..=last);
        drop(state);

        debug!(counter = %self.inner.counter, first, last, "reserved stream positions");

        Ok(Reservation {
            inner: Arc::clone(&self.inner),
            first,
            last,
            completed: false,
            pending: Vec::new(),
        })
    }

    fn report(&self, err: StoreError) -> StoreError {
        let record = FaultRecord::new(
            "chorusstore::stream_id",
            Level::ERROR,
            "stream position allocation failed",
        );
        let (record, _) = record.fields([
            ("counter", self.inner.counter.clone()),
            ("streams", self.inner.streams.join(",")),
        ]);
        record.cause(&err).emit();
        err
    }
}

fn unavailable(counter: &str, source: anyhow::Error) -> StoreError {
    StoreError::AllocationUnavailable {
        stream: counter.to_string(),
        source,
    }
}

/// Tokens reserved by one `allocate` call.
///
/// Complete it once the write is persisted. Dropping it without completing
/// releases the tokens: they become gaps in the stream and are never handed
/// out again. Either way, changes registered with [`Reservation::track`] are
/// noted in their caches first.
#[must_use = "a reservation holds back current_token until completed or dropped"]
pub struct Reservation {
    inner: Arc<Inner>,
    first: u64,
    last: u64,
    completed: bool,
    pending: Vec<(Arc<StreamChangeCache>, String, StreamToken)>,
}

impl Reservation {
    /// The reserved token (the last one for multi-token reservations).
    pub fn token(&self) -> StreamToken {
        StreamToken(self.last)
    }

    /// Every reserved token, in order.
    pub fn tokens(&self) -> impl Iterator<Item = StreamToken> {
        (self.first..=self.last).map(StreamToken)
    }

    /// Register a change to note in `cache` before the tokens become
    /// visible. Call before persisting the rows it describes.
    pub fn track(&mut self, cache: &Arc<StreamChangeCache>, entity: impl Into<String>, token: StreamToken) {
        self.pending.push((Arc::clone(cache), entity.into(), token));
    }

    /// Mark the write finished, making the tokens visible once nothing
    /// earlier is still in flight.
    pub fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.completed {
            debug!(
                counter = %self.inner.counter,
                first = self.first,
                last = self.last,
                pending = self.pending.len(),
                "stream reservation released without completing"
            );
        }
        for (cache, entity, token) in self.pending.drain(..) {
            cache.note_change(entity, token);
        }
        self.inner.state().finish(self.first..=self.last);
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("counter", &self.inner.counter)
            .field("first", &self.first)
            .field("last", &self.last)
            .finish()
    }
}
