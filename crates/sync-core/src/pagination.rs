//! Bidirectional history loader: newest window on open, older windows on
//! demand, merged into the conversation cache.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{debug, warn};

use crate::{
    api::MessageApi,
    cache::{SharedCache, lock_cache, unix_now_ms},
    error::{SyncError, SyncErrorCategory},
    reconcile::{Incoming, Reconciler, ingest_batch, prepend_older, sort_timeline},
    types::{ContactId, HistoryState, LoadedWindow},
};

/// Hard upper bound on any window, whatever the server advertises.
const MAX_WINDOW: u16 = 100;

/// Clamp a requested window size against safety and server caps.
///
/// The result is always in `1..=100`.
pub fn bounded_window(requested: u16, server_cap: u16) -> u16 {
    let safe_requested = requested.max(1);
    let safe_cap = server_cap.max(1);
    safe_requested.min(safe_cap).min(MAX_WINDOW)
}

/// Marks one older-window load as in flight until dropped.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<ContactId>>,
    contact_id: ContactId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.contact_id);
    }
}

pub struct PaginationController<A> {
    api: Arc<A>,
    cache: SharedCache,
    reconciler: Reconciler,
    initial_page_cap: u16,
    server_page_cap: u16,
    in_flight: Mutex<HashSet<ContactId>>,
    cursors: Mutex<HashMap<ContactId, u64>>,
}

impl<A: MessageApi> PaginationController<A> {
    /// `initial_page_cap` bounds newest-window requests and
    /// `server_page_cap` bounds older-window requests.
    pub fn new(
        api: Arc<A>,
        cache: SharedCache,
        reconciler: Reconciler,
        initial_page_cap: u16,
        server_page_cap: u16,
    ) -> Self {
        Self {
            api,
            cache,
            reconciler,
            initial_page_cap,
            server_page_cap,
            in_flight: Mutex::new(HashSet::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an older-window load is pending for `contact_id`.
    pub fn is_loading_older(&self, contact_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(contact_id)
    }

    /// Fetch the newest `window_size` messages and merge them into the cache.
    ///
    /// The window is clamped to the newest-window page cap and `has_older` is
    /// inferred from a full clamped window. A failed fetch leaves the cache
    /// untouched so the open can simply be retried.
    pub async fn load_initial(&self, contact_id: &str, window_size: u16) -> Result<LoadedWindow, SyncError> {
        let window = bounded_window(window_size, self.initial_page_cap);
        let wire = self
            .api
            .fetch_recent(contact_id, window)
            .await
            .inspect_err(|err| warn!(%contact_id, error = %err, "initial window load failed"))?;

        let has_older = wire.len() >= usize::from(window);
        let mut fetched = ingest_batch(contact_id, &wire);
        sort_timeline(&mut fetched);

        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(contact_id);

        let mut cache = lock_cache(&self.cache);
        let (cached, cached_history) = match cache.get(contact_id) {
            Some(entry) => (entry.messages().to_vec(), Some(entry.history().clone())),
            None => (Vec::new(), None),
        };
        let merged = self.reconciler.reconcile(&cached, Incoming::Local(&fetched));

        // Cached history older than the fresh window keeps its own state.
        let holds_older_than_window = match (merged.first(), fetched.first()) {
            (Some(oldest), Some(window_oldest)) => oldest.timestamp_ms < window_oldest.timestamp_ms,
            _ => false,
        };
        let history = match cached_history {
            Some(history) if holds_older_than_window => history,
            _ => HistoryState::from_has_older(has_older),
        };

        cache.put_at(contact_id, merged, history, unix_now_ms());
        debug!(%contact_id, count = fetched.len(), has_older, "initial window loaded");

        Ok(LoadedWindow {
            messages: fetched,
            has_older,
        })
    }

    /// Fetch up to `window_size` messages older than `before_cursor` and
    /// prepend the ones the cache does not hold yet.
    ///
    /// Rejected immediately, without touching the cache, while another older
    /// load for the same conversation is pending. A failed fetch records
    /// [`HistoryState::LoadFailed`], which suppresses automatic retries.
    pub async fn load_older(
        &self,
        contact_id: &str,
        before_cursor: u64,
        window_size: u16,
    ) -> Result<LoadedWindow, SyncError> {
        self.load_older_with(contact_id, before_cursor, window_size, |_| {})
            .await
    }

    /// [`Self::load_older`] with a hook that runs under the cache lock right
    /// before the merged list is written, receiving the number of messages
    /// about to be prepended.
    pub async fn load_older_with<F>(
        &self,
        contact_id: &str,
        before_cursor: u64,
        window_size: u16,
        before_merge: F,
    ) -> Result<LoadedWindow, SyncError>
    where
        F: FnOnce(usize) + Send,
    {
        let _guard = self.begin_older(contact_id)?;
        let window = bounded_window(window_size, self.server_page_cap);
        let cursor = self.advance_cursor(contact_id, before_cursor);

        let page = match self.api.fetch_older(contact_id, cursor, window).await {
            Ok(page) => page,
            Err(err) => {
                warn!(%contact_id, cursor, error = %err, "older window load failed");
                lock_cache(&self.cache).set_history(
                    contact_id,
                    HistoryState::LoadFailed {
                        code: err.code.clone(),
                    },
                );
                return Err(err);
            }
        };

        let mut older = ingest_batch(contact_id, &page.messages);
        sort_timeline(&mut older);

        let mut cache = lock_cache(&self.cache);
        match cache.get(contact_id) {
            Some(entry) => {
                let before = entry.messages().len();
                let merged = prepend_older(entry.messages(), older.clone());
                let added = merged.len() - before;
                before_merge(added);
                cache.put_older_at(
                    contact_id,
                    merged,
                    HistoryState::from_has_older(page.has_more),
                    unix_now_ms(),
                );
                debug!(%contact_id, cursor, added, has_more = page.has_more, "older window merged");
            }
            None => {
                debug!(%contact_id, "conversation evicted while loading older window; result not cached");
            }
        }

        Ok(LoadedWindow {
            messages: older,
            has_older: page.has_more,
        })
    }

    fn begin_older(&self, contact_id: &str) -> Result<InFlightGuard<'_>, SyncError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(contact_id.to_owned()) {
            debug!(%contact_id, "rejecting concurrent older window load");
            return Err(SyncError::new(
                SyncErrorCategory::Busy,
                "older_load_in_flight",
                format!("an older window load is already pending for {contact_id}"),
            ));
        }
        Ok(InFlightGuard {
            in_flight: &self.in_flight,
            contact_id: contact_id.to_owned(),
        })
    }

    /// Cursor for the next older load; never increases within one session.
    fn advance_cursor(&self, contact_id: &str, requested: u64) -> u64 {
        let cached_oldest = lock_cache(&self.cache)
            .get(contact_id)
            .and_then(|entry| entry.oldest_timestamp_ms());

        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = cursors.get(contact_id).copied();
        let cursor = [Some(requested), cached_oldest, previous]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(requested);
        cursors.insert(contact_id.to_owned(), cursor);
        cursor
    }
}
