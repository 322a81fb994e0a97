//! Per-contact conversation store with dedup-on-write and opportunistic
//! eviction of stale entries.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{debug, trace};

use crate::{
    reconcile::{dedupe_by_id, sort_timeline},
    types::{ContactId, HistoryState, Message, SyncConfig},
};

/// Cache handle shared by the pagination controller and the engine.
pub type SharedCache = Arc<Mutex<ConversationCache>>;

/// Lock a shared cache, recovering the data from a poisoned lock.
///
/// Every mutation is a single `put`/`invalidate` call, so a panic elsewhere
/// cannot leave a half-written entry behind.
pub fn lock_cache(cache: &SharedCache) -> MutexGuard<'_, ConversationCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Current wall-clock time in milliseconds since Unix epoch.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Cached state of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    messages: Vec<Message>,
    history: HistoryState,
    last_refreshed_ms: u64,
    capacity: usize,
}

impl CacheEntry {
    /// Deduplicated, time-ordered messages.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn history(&self) -> &HistoryState {
        &self.history
    }

    pub fn has_older(&self) -> bool {
        self.history.has_older()
    }

    pub fn last_refreshed_ms(&self) -> u64 {
        self.last_refreshed_ms
    }

    /// Messages this entry may hold before refresh writes trim the oldest.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pagination cursor: timestamp of the oldest held message.
    pub fn oldest_timestamp_ms(&self) -> Option<u64> {
        self.messages.first().map(|message| message.timestamp_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ConversationCache {
    entries: HashMap<ContactId, CacheEntry>,
    retention_ms: u64,
    max_items: usize,
}

impl ConversationCache {
    /// Create a cache with a retention window and a per-entry cap (`>= 1`).
    pub fn new(retention: Duration, max_items: usize) -> Self {
        Self {
            entries: HashMap::new(),
            retention_ms: retention.as_millis() as u64,
            max_items: max_items.max(1),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.cache_retention(), config.cache_max_items)
    }

    pub fn shared(self) -> SharedCache {
        Arc::new(Mutex::new(self))
    }

    pub fn get(&self, contact_id: &str) -> Option<&CacheEntry> {
        self.entries.get(contact_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a deduplicated copy of `messages` for `contact_id`.
    pub fn put(&mut self, contact_id: &str, messages: Vec<Message>, has_older: bool) -> &CacheEntry {
        self.put_at(
            contact_id,
            messages,
            HistoryState::from_has_older(has_older),
            unix_now_ms(),
        )
    }

    /// Store an entry with an explicit history state and write time.
    ///
    /// Stale entries are pruned before the write. The stored list is
    /// deduplicated by ID (first occurrence wins), sorted, and capped at the
    /// newest [`CacheEntry::capacity`] messages; capping marks older history
    /// as available.
    pub fn put_at(
        &mut self,
        contact_id: &str,
        messages: Vec<Message>,
        history: HistoryState,
        now_ms: u64,
    ) -> &CacheEntry {
        self.write(contact_id, messages, history, now_ms, false)
    }

    /// Store a list extended with an older page the user asked for.
    ///
    /// Nothing is trimmed: the entry's capacity grows to the merged length
    /// so the page stays cached until the entry is evicted or invalidated.
    pub fn put_older_at(
        &mut self,
        contact_id: &str,
        messages: Vec<Message>,
        history: HistoryState,
        now_ms: u64,
    ) -> &CacheEntry {
        self.write(contact_id, messages, history, now_ms, true)
    }

    fn write(
        &mut self,
        contact_id: &str,
        messages: Vec<Message>,
        history: HistoryState,
        now_ms: u64,
        grow: bool,
    ) -> &CacheEntry {
        self.prune_stale(now_ms);

        let mut messages = dedupe_by_id(messages);
        sort_timeline(&mut messages);

        let mut capacity = self
            .entries
            .get(contact_id)
            .map_or(self.max_items, |entry| entry.capacity);
        if grow {
            capacity = capacity.max(messages.len());
        }

        let mut history = history;
        if messages.len() > capacity {
            let excess = messages.len() - capacity;
            messages.drain(0..excess);
            history = HistoryState::Available;
            trace!(%contact_id, excess, "trimmed oldest cached messages");
        }

        let entry = CacheEntry {
            messages,
            history,
            last_refreshed_ms: now_ms,
            capacity,
        };
        self.entries.insert(contact_id.to_owned(), entry);
        &self.entries[contact_id]
    }

    /// Replace only the history state of an existing entry.
    pub fn set_history(&mut self, contact_id: &str, history: HistoryState) -> bool {
        match self.entries.get_mut(contact_id) {
            Some(entry) => {
                entry.history = history;
                true
            }
            None => false,
        }
    }

    /// Mutate an existing entry's messages in place.
    ///
    /// Stale entries are pruned first, this one included. `apply` reports
    /// whether it changed anything; changed lists are re-deduplicated and
    /// re-sorted before the write completes.
    pub fn update_messages(
        &mut self,
        contact_id: &str,
        now_ms: u64,
        apply: impl FnOnce(&mut Vec<Message>) -> bool,
    ) -> bool {
        self.prune_stale(now_ms);
        let Some(entry) = self.entries.get_mut(contact_id) else {
            return false;
        };
        if !apply(&mut entry.messages) {
            return false;
        }
        let mut messages = dedupe_by_id(std::mem::take(&mut entry.messages));
        sort_timeline(&mut messages);
        entry.messages = messages;
        entry.last_refreshed_ms = now_ms;
        true
    }

    /// Drop one entry, or the whole cache when `contact_id` is `None`.
    pub fn invalidate(&mut self, contact_id: Option<&str>) {
        match contact_id {
            Some(contact_id) => {
                self.entries.remove(contact_id);
            }
            None => self.entries.clear(),
        }
    }

    fn prune_stale(&mut self, now_ms: u64) {
        let retention_ms = self.retention_ms;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now_ms.saturating_sub(entry.last_refreshed_ms) <= retention_ms);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, "evicted stale conversation cache entries");
        }
    }
}

impl Default for ConversationCache {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}
