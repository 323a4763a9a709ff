//! In-memory "has this entity changed since position P" index.
//!
//! `StreamChangeCache` keeps, per entity, the latest stream token at which it
//! changed, plus a bounded history of `(token, entity)` pairs. Superseded pairs
//! stay in the history until evicted, so memory is bounded by the history
//! size rather than by how many entities exist.
//!
//! The cache answers precisely for any `since >= floor`. Below the floor it
//! answers `CacheAnswer::Unknown` and the caller must assume a change.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, trace};

use crate::types::StreamToken;

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAnswer<T> {
    /// The cache can answer precisely.
    Known(T),
    /// The query reaches below the cache floor. Treat as "possibly changed".
    Unknown,
}

impl<T> CacheAnswer<T> {
    pub fn is_unknown(&self) -> bool {
        matches!(self, CacheAnswer::Unknown)
    }

    pub fn known(self) -> Option<T> {
        match self {
            CacheAnswer::Known(value) => Some(value),
            CacheAnswer::Unknown => None,
        }
    }
}

impl CacheAnswer<bool> {
    /// The conservative reading: `Unknown` counts as changed.
    pub fn possibly_changed(&self) -> bool {
        match self {
            CacheAnswer::Known(changed) => *changed,
            CacheAnswer::Unknown => true,
        }
    }
}

#[derive(Debug)]
struct CacheState<K> {
    floor: StreamToken,
    latest: HashMap<K, StreamToken>,
    history: BTreeMap<StreamToken, BTreeSet<K>>,
    pairs: usize,
    written: bool,
}

/// Bounded change index for one stream.
#[derive(Debug)]
pub struct StreamChangeCache<K = String> {
    name: String,
    capacity: usize,
    state: RwLock<CacheState<K>>,
}

impl<K> StreamChangeCache<K>
where
    K: Clone + Eq + Hash + Ord,
{
    /// An empty cache that can answer for any `since >= floor`.
    pub fn new(name: impl Into<String>, floor: StreamToken, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            state: RwLock::new(CacheState {
                floor,
                latest: HashMap::new(),
                history: BTreeMap::new(),
                pairs: 0,
                written: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest `since` token the cache answers precisely.
    pub fn floor(&self) -> StreamToken {
        self.read().floor
    }

    /// Number of `(token, entity)` pairs held.
    pub fn len(&self) -> usize {
        self.read().pairs
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest token recorded for any entity.
    pub fn max_token(&self) -> Option<StreamToken> {
        self.read().history.last_key_value().map(|(token, _)| *token)
    }

    /// Bulk-load a snapshot taken from durable storage and set the floor.
    ///
    /// On a cache that has already been written to this only raises the
    /// floor; the entries are ignored.
    pub fn prefill<I>(&self, entries: I, floor: StreamToken)
    where
        I: IntoIterator<Item = (K, StreamToken)>,
    {
        let mut state = self.write();
        state.floor = state.floor.max(floor);

        if state.written {
            Self::drop_below_floor(&mut state);
            debug!(cache = %self.name, floor = %state.floor, "prefill after writes only raised floor");
            return;
        }

        state.written = true;
        let mut loaded = 0usize;
        for (entity, token) in entries {
            if Self::record(&mut state, entity, token) {
                loaded += 1;
            }
        }
        Self::drop_below_floor(&mut state);
        self.evict(&mut state);

        debug!(
            cache = %self.name,
            loaded,
            floor = %state.floor,
            "change cache prefilled"
        );
    }

    /// Record that `entity` changed at `token`.
    ///
    /// Never moves an entity's recorded token backwards, and ignores changes
    /// below the floor since no answerable query can observe them.
    pub fn note_change(&self, entity: impl Into<K>, token: StreamToken) {
        let mut state = self.write();
        state.written = true;
        if Self::record(&mut state, entity.into(), token) {
            self.evict(&mut state);
        }
    }

    /// Whether `entity` changed after `since`.
    pub fn has_changed<Q>(&self, entity: &Q, since: StreamToken) -> CacheAnswer<bool>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let state = self.read();
        if since < state.floor {
            return CacheAnswer::Unknown;
        }
        let changed = state.latest.get(entity).is_some_and(|latest| *latest > since);
        CacheAnswer::Known(changed)
    }

    /// Every entity that changed after `since`.
    pub fn get_changed_since(&self, since: StreamToken) -> CacheAnswer<HashSet<K>> {
        let state = self.read();
        if since < state.floor {
            return CacheAnswer::Unknown;
        }
        let changed = state
            .history
            .range((Bound::Excluded(since), Bound::Unbounded))
            .flat_map(|(_, entities)| entities.iter().cloned())
            .collect();
        CacheAnswer::Known(changed)
    }

    /// The subset of `entities` that changed after `since`.
    pub fn get_entities_changed<'a, I>(&self, entities: I, since: StreamToken) -> CacheAnswer<HashSet<K>>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let state = self.read();
        if since < state.floor {
            return CacheAnswer::Unknown;
        }
        let changed = entities
            .into_iter()
            .filter(|entity| state.latest.get(*entity).is_some_and(|latest| *latest > since))
            .cloned()
            .collect();
        CacheAnswer::Known(changed)
    }

    /// Whether anything at all changed after `since`.
    pub fn has_any_entity_changed(&self, since: StreamToken) -> CacheAnswer<bool> {
        let state = self.read();
        if since < state.floor {
            return CacheAnswer::Unknown;
        }
        let changed = state
            .history
            .last_key_value()
            .is_some_and(|(token, _)| *token > since);
        CacheAnswer::Known(changed)
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether a new pair was added to the history.
    fn record(state: &mut CacheState<K>, entity: K, token: StreamToken) -> bool {
        if token < state.floor {
            return false;
        }
        if let Some(current) = state.latest.get(&entity) {
            if *current >= token {
                return false;
            }
        }

        state.latest.insert(entity.clone(), token);
        if state.history.entry(token).or_default().insert(entity) {
            state.pairs += 1;
        }
        true
    }

    fn drop_below_floor(state: &mut CacheState<K>) {
        let keep = state.history.split_off(&state.floor);
        let dropped = std::mem::replace(&mut state.history, keep);
        for (token, entities) in dropped {
            state.pairs -= entities.len();
            for entity in entities {
                if state.latest.get(&entity) == Some(&token) {
                    state.latest.remove(&entity);
                }
            }
        }
    }

    /// Pops whole token groups. The floor moves to one past the evicted
    /// token, not to the oldest retained one. Evicted pairs then all sit below the
    /// floor, which keeps answers for `since >= floor` exact.
    fn evict(&self, state: &mut CacheState<K>) {
        while state.pairs > self.capacity {
            let Some((token, entities)) = state.history.pop_first() else {
                break;
            };
            state.pairs -= entities.len();
            state.floor = state.floor.max(token.next());
            for entity in entities {
                if state.latest.get(&entity) == Some(&token) {
                    state.latest.remove(&entity);
                }
            }
            trace!(cache = %self.name, evicted = %token, floor = %state.floor, "change cache evicted");
        }
    }
}
