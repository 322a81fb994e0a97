//! Conversation view engine: composes cache, pagination, reconciliation,
//! optimistic sends and scroll anchoring behind one surface for the view.
//!
//! Lock order is cache first, then view state. The pagination controller
//! only ever takes the cache lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::{
    api::MessageApi,
    cache::{ConversationCache, SharedCache, lock_cache, unix_now_ms},
    channel::{ChannelManager, ChannelPhase, ChannelStatus, Subscription},
    error::{SyncError, SyncErrorCategory},
    normalization::{SendNotice, normalize_send_outcome},
    optimistic::OptimisticSendMachine,
    pagination::PaginationController,
    reconcile::{Incoming, Reconciler, apply_status},
    scroll::{ScrollAction, ScrollAnchorController, ScrollTrigger, Viewport},
    types::{
        ContactId, DeliveryState, HistoryState, LoadedWindow, Message, PushEvent, SyncConfig,
        WireMessage,
    },
};

/// Distance from the top of the list at which older history is requested.
const LOAD_OLDER_TOP_PX: f32 = 100.0;

/// Read-only view of the active conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSnapshot {
    pub contact_id: Option<ContactId>,
    pub messages: Vec<Message>,
    pub loading_older: bool,
    pub has_older: bool,
    pub history: Option<HistoryState>,
    pub status_text: String,
    pub error_text: Option<String>,
    pub notice: Option<SendNotice>,
    pub revision: u64,
}

struct ViewState {
    active: Option<ContactId>,
    scroll: ScrollAnchorController,
    optimistic: OptimisticSendMachine,
    status_text: String,
    error_text: Option<String>,
    notice: Option<SendNotice>,
}

impl ViewState {
    fn is_active(&self, contact_id: &str) -> bool {
        self.active.as_deref() == Some(contact_id)
    }
}

/// State shared with push-channel handlers.
struct Inner {
    cache: SharedCache,
    reconciler: Reconciler,
    view: Mutex<ViewState>,
    revision: watch::Sender<u64>,
}

impl Inner {
    fn lock_view(&self) -> MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    fn apply_push(&self, event: &PushEvent) {
        let changed = match event {
            PushEvent::NewMessage(wire) => {
                let contact_id = match wire.phone_number.as_deref() {
                    Some(contact_id) => contact_id.to_owned(),
                    None => {
                        let Some(active) = self.lock_view().active.clone() else {
                            debug!(message_id = %wire.id, "push message without contact and no active conversation");
                            return;
                        };
                        active
                    }
                };
                self.merge_pushed(&contact_id, std::slice::from_ref(wire))
            }
            PushEvent::StatusUpdate(update) => {
                let Some(reported) = DeliveryState::from_wire_status(&update.status) else {
                    trace!(status = %update.status, "ignoring unknown delivery status");
                    return;
                };
                let contact_id = update
                    .phone_number
                    .clone()
                    .or_else(|| self.lock_view().active.clone());
                let Some(contact_id) = contact_id else {
                    return;
                };
                lock_cache(&self.cache).update_messages(&contact_id, unix_now_ms(), |messages| {
                    apply_status(messages, &update.message_id, reported)
                })
            }
            PushEvent::ServerError {
                message,
                contact_id,
            } => {
                let mut view = self.lock_view();
                let relevant = match contact_id.as_deref() {
                    Some(contact_id) => view.is_active(contact_id),
                    None => true,
                };
                if relevant {
                    warn!(%message, "backend reported an error");
                    view.error_text = Some(message.clone());
                }
                relevant
            }
            PushEvent::ContactUpdated(_) | PushEvent::TemplateUpdated(_) | PushEvent::StatsUpdated(_) => {
                trace!(kind = event.kind(), "push event not relevant to conversations");
                false
            }
        };

        if changed {
            self.bump();
        }
    }

    /// Merge pushed records into a cached conversation. Contacts without a
    /// cache entry are skipped; entries are created when a conversation
    /// starts opening.
    fn merge_pushed(&self, contact_id: &str, wire: &[WireMessage]) -> bool {
        let mut cache = lock_cache(&self.cache);
        let Some(entry) = cache.get(contact_id) else {
            trace!(%contact_id, "push for uncached conversation skipped");
            return false;
        };
        let merged = self.reconciler.reconcile(
            entry.messages(),
            Incoming::Wire {
                contact_id,
                messages: wire,
            },
        );
        if merged.as_slice() == entry.messages() {
            return false;
        }
        let grew = merged.len() > entry.messages().len();
        let history = entry.history().clone();

        let mut view = self.lock_view();
        if grew && view.is_active(contact_id) {
            view.scroll.begin(ScrollTrigger::AppendNew);
        }
        view.optimistic.release_confirmed(contact_id, &merged);
        cache.put_at(contact_id, merged, history, unix_now_ms());
        debug!(%contact_id, grew, "push merged into conversation");
        true
    }
}

/// Synchronization engine for one dashboard view.
pub struct ConversationSync<A> {
    config: SyncConfig,
    api: Arc<A>,
    pagination: PaginationController<A>,
    inner: Arc<Inner>,
}

impl<A: MessageApi> ConversationSync<A> {
    pub fn new(api: Arc<A>, config: SyncConfig) -> Self {
        let cache = ConversationCache::from_config(&config).shared();
        let reconciler = Reconciler::new(config.dedup_tolerance_ms);
        let pagination = PaginationController::new(
            Arc::clone(&api),
            cache.clone(),
            reconciler,
            config.initial_page_cap,
            config.server_page_cap,
        );
        let (revision, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            cache,
            reconciler,
            view: Mutex::new(ViewState {
                active: None,
                scroll: ScrollAnchorController::new(config.follow_threshold_px as f32),
                optimistic: OptimisticSendMachine::default(),
                status_text: channel_label(&ChannelStatus {
                    phase: ChannelPhase::Idle,
                    attempt: 0,
                    retry_in_ms: None,
                }),
                error_text: None,
                notice: None,
            }),
            revision,
        });
        Self {
            config,
            api,
            pagination,
            inner,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Shared cache handle, for inspection and explicit invalidation.
    pub fn cache(&self) -> SharedCache {
        self.inner.cache.clone()
    }

    /// Revision counter bumped after every visible change.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Route every push event of `channel` into this engine.
    pub fn attach(&self, channel: &ChannelManager) -> Subscription {
        let inner = Arc::clone(&self.inner);
        channel.subscribe(move |event| inner.apply_push(event))
    }

    pub fn handle_push_event(&self, event: &PushEvent) {
        self.inner.apply_push(event);
    }

    /// Reflect the push channel state in the status line.
    pub fn handle_channel_status(&self, status: &ChannelStatus) {
        let label = channel_label(status);
        let mut view = self.inner.lock_view();
        if view.status_text == label {
            return;
        }
        view.status_text = label;
        drop(view);
        self.inner.bump();
    }

    /// Make `contact_id` the active conversation and load its newest window.
    ///
    /// Cached messages stay visible while the window loads. On failure the
    /// error is surfaced and the conversation stays open for a retry.
    pub async fn open_conversation(&self, contact_id: &str) -> Result<LoadedWindow, SyncError> {
        if contact_id.trim().is_empty() {
            return Err(SyncError::validation("empty_contact", "contact identifier is empty"));
        }

        let created = {
            let mut cache = lock_cache(&self.inner.cache);
            // Pushes arriving while the first window loads merge into this
            // entry; the window is reconciled on top of them.
            let created = cache.get(contact_id).is_none();
            if created {
                cache.put_at(contact_id, Vec::new(), HistoryState::Available, unix_now_ms());
            }

            let mut view = self.inner.lock_view();
            if !view.is_active(contact_id) {
                view.scroll.reset();
            }
            view.active = Some(contact_id.to_owned());
            view.error_text = None;
            view.scroll.begin(ScrollTrigger::InitialLoad);
            created
        };
        info!(%contact_id, "opening conversation");
        self.inner.bump();

        let loaded = self
            .pagination
            .load_initial(contact_id, self.config.initial_window)
            .await;
        if let Err(err) = &loaded {
            let mut cache = lock_cache(&self.inner.cache);
            let untouched = cache
                .get(contact_id)
                .is_some_and(|entry| entry.messages().is_empty());
            if created && untouched {
                cache.invalidate(Some(contact_id));
            }
            let mut view = self.inner.lock_view();
            if view.is_active(contact_id) {
                view.error_text = Some(format!("Could not load messages ({})", err.code));
            }
        }
        self.inner.bump();
        loaded
    }

    /// Load the next older window of the active conversation.
    ///
    /// Returns the size of the loaded window. Exhausted or failed history
    /// performs no request; use [`Self::retry_older`] after a failure.
    pub async fn load_older(&self) -> Result<usize, SyncError> {
        let contact_id = self.active_contact()?;
        let cursor = {
            let cache = lock_cache(&self.inner.cache);
            let Some(entry) = cache.get(&contact_id) else {
                return Ok(0);
            };
            if !entry.has_older() {
                trace!(%contact_id, history = ?entry.history(), "no older history to request");
                return Ok(0);
            }
            // Empty until the first window lands.
            let Some(cursor) = entry.oldest_timestamp_ms() else {
                return Ok(0);
            };
            cursor
        };

        let inner = Arc::clone(&self.inner);
        let hook_contact = contact_id.clone();
        let result = self
            .pagination
            .load_older_with(&contact_id, cursor, self.config.older_window, move |added| {
                let mut view = inner.lock_view();
                if added > 0 && view.is_active(&hook_contact) {
                    view.scroll.begin(ScrollTrigger::PrependOlder);
                }
            })
            .await;

        match result {
            Ok(window) => {
                self.inner.bump();
                Ok(window.messages.len())
            }
            Err(err) if err.category == SyncErrorCategory::Busy => Err(err),
            Err(err) => {
                let mut view = self.inner.lock_view();
                if view.is_active(&contact_id) {
                    view.error_text = Some(format!("Could not load older messages ({})", err.code));
                }
                drop(view);
                self.inner.bump();
                Err(err)
            }
        }
    }

    /// Clear a failed older-history state and request the window again.
    pub async fn retry_older(&self) -> Result<usize, SyncError> {
        let contact_id = self.active_contact()?;
        {
            let mut cache = lock_cache(&self.inner.cache);
            let failed = matches!(
                cache.get(&contact_id).map(|entry| entry.history()),
                Some(HistoryState::LoadFailed { .. })
            );
            if failed {
                cache.set_history(&contact_id, HistoryState::Available);
                self.inner.lock_view().error_text = None;
            }
        }
        self.load_older().await
    }

    /// Send `text` to the active conversation with an optimistic placeholder.
    ///
    /// Validation errors are returned before any I/O. A failed send is not an
    /// error here: the placeholder turns `Failed` and one notice is raised.
    pub async fn send_message(&self, text: &str) -> Result<Message, SyncError> {
        let placeholder = {
            let mut cache = lock_cache(&self.inner.cache);
            let mut view = self.inner.lock_view();
            let contact_id = view.active.clone().unwrap_or_default();
            let placeholder = view.optimistic.submit(&contact_id, text, unix_now_ms())?;

            if let Some(entry) = cache.get(&contact_id) {
                let merged = self
                    .inner
                    .reconciler
                    .reconcile(entry.messages(), Incoming::Local(std::slice::from_ref(&placeholder)));
                let history = entry.history().clone();
                view.scroll.begin(ScrollTrigger::AppendNew);
                cache.put_at(&contact_id, merged, history, unix_now_ms());
            }
            placeholder
        };
        self.inner.bump();

        let contact_id = placeholder.contact_id.clone();
        let outcome = normalize_send_outcome(self.api.send_message(&contact_id, &placeholder.body).await);

        let resolution = {
            let mut cache = lock_cache(&self.inner.cache);
            let mut view = self.inner.lock_view();
            let resolution = view.optimistic.on_send_result(&placeholder.id, outcome)?;
            let delivery = resolution.message.delivery;
            cache.update_messages(&contact_id, unix_now_ms(), |messages| {
                match messages.iter_mut().find(|message| message.id == placeholder.id) {
                    Some(message) => {
                        message.delivery = delivery;
                        true
                    }
                    None => false,
                }
            });
            if let Some(entry) = cache.get(&contact_id) {
                view.optimistic.release_confirmed(&contact_id, entry.messages());
            }
            if let Some(notice) = &resolution.notice {
                warn!(%contact_id, code = %notice.code, "message send failed");
                view.notice = Some(notice.clone());
            }
            resolution
        };
        self.inner.bump();

        Ok(resolution.message)
    }

    /// Leave the active conversation; its cache entry is kept.
    pub fn close_conversation(&self) {
        let mut view = self.inner.lock_view();
        if let Some(contact_id) = view.active.take() {
            debug!(%contact_id, "conversation closed");
        }
        view.scroll.reset();
        view.error_text = None;
        drop(view);
        self.inner.bump();
    }

    /// Record the viewport. Returns `true` when the view sits near the top
    /// and older history should be requested.
    pub fn observe_viewport(&self, viewport: Viewport) -> bool {
        let contact_id = {
            let mut view = self.inner.lock_view();
            view.scroll.observe(viewport);
            view.active.clone()
        };
        let Some(contact_id) = contact_id else {
            return false;
        };
        if viewport.scroll_top > LOAD_OLDER_TOP_PX || self.pagination.is_loading_older(&contact_id) {
            return false;
        }
        lock_cache(&self.inner.cache)
            .get(&contact_id)
            .is_some_and(|entry| entry.has_older())
    }

    /// Report the list height after the next queued mutation rendered;
    /// returns the scroll position to apply.
    pub fn complete_render(&self, new_scroll_height: f32) -> Option<ScrollAction> {
        let mut view = self.inner.lock_view();
        view.active.as_ref()?;
        Some(view.scroll.complete(new_scroll_height))
    }

    /// Report one rendered height per queued mutation, in queue order.
    pub fn complete_renders(&self, heights: &[f32]) -> Option<ScrollAction> {
        let mut view = self.inner.lock_view();
        view.active.as_ref()?;
        Some(view.scroll.complete_each(heights.iter().copied()))
    }

    /// Whether mutations are waiting for their rendered height.
    pub fn has_pending_render(&self) -> bool {
        self.inner.lock_view().scroll.has_pending()
    }

    /// Take the pending send-failure notice, if any.
    pub fn take_notice(&self) -> Option<SendNotice> {
        let notice = self.inner.lock_view().notice.take();
        if notice.is_some() {
            self.inner.bump();
        }
        notice
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        let cache = lock_cache(&self.inner.cache);
        let view = self.inner.lock_view();
        let entry = view.active.as_deref().and_then(|contact_id| cache.get(contact_id));
        ConversationSnapshot {
            contact_id: view.active.clone(),
            messages: entry.map(|entry| entry.messages().to_vec()).unwrap_or_default(),
            loading_older: view
                .active
                .as_deref()
                .is_some_and(|contact_id| self.pagination.is_loading_older(contact_id)),
            has_older: entry.is_some_and(|entry| entry.has_older()),
            history: entry.map(|entry| entry.history().clone()),
            status_text: view.status_text.clone(),
            error_text: view.error_text.clone(),
            notice: view.notice.clone(),
            revision: *self.inner.revision.borrow(),
        }
    }

    fn active_contact(&self) -> Result<ContactId, SyncError> {
        self.inner.lock_view().active.clone().ok_or_else(|| {
            SyncError::validation("no_active_conversation", "no conversation is open")
        })
    }
}

fn channel_label(status: &ChannelStatus) -> String {
    match status.phase {
        ChannelPhase::Idle => "Disconnected".to_owned(),
        ChannelPhase::Connecting => "Connecting".to_owned(),
        ChannelPhase::Open => "Connected".to_owned(),
        ChannelPhase::Reconnecting => match status.retry_in_ms {
            Some(delay_ms) => format!("Reconnecting (retry in {delay_ms} ms)"),
            None => format!("Reconnecting (attempt {})", status.attempt),
        },
        ChannelPhase::GaveUp => "Offline".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{sync::Notify, time::timeout};

    use super::*;
    use crate::{
        channel::{
            PushTransport,
            tests::{FakeTransport, new_message_frame},
        },
        pagination::tests::{FakeApi, wire},
        types::{Direction, MessageId, OlderPage, StatusUpdate, WireMessage},
    };

    const CONTACT: &str = "5215550001";

    fn sync_engine(api: FakeApi) -> (ConversationSync<FakeApi>, Arc<FakeApi>) {
        let api = Arc::new(api);
        (ConversationSync::new(Arc::clone(&api), SyncConfig::default()), api)
    }

    fn pushed(id: &str, sender: &str, text: &str, timestamp_ms: u64) -> PushEvent {
        PushEvent::NewMessage(wire(id, sender, text, timestamp_ms))
    }

    #[tokio::test]
    async fn opening_loads_newest_window_and_scrolls_to_bottom() {
        let (engine, _) = sync_engine(FakeApi::with_history(50));
        let window = engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");
        assert_eq!(window.messages.len(), 50);
        assert!(window.has_older);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.contact_id.as_deref(), Some(CONTACT));
        assert_eq!(snapshot.messages.len(), 50);
        assert!(snapshot.has_older);
        assert!(snapshot.messages.iter().all(|m| m.direction == Direction::Inbound));

        engine.observe_viewport(Viewport {
            scroll_top: 0.0,
            scroll_height: 0.0,
            client_height: 600.0,
        });
        assert_eq!(
            engine.complete_render(4_000.0),
            Some(ScrollAction::ScrollTo(3_400.0))
        );

        let (engine, _) = sync_engine(FakeApi::with_history(10));
        let window = engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");
        assert_eq!(window.messages.len(), 10);
        assert!(!engine.snapshot().has_older);
    }

    #[tokio::test]
    async fn failed_open_keeps_conversation_retryable() {
        let api = FakeApi::with_history(5);
        *api.fail_recent.lock().expect("fail flag") = true;
        let (engine, api) = sync_engine(api);

        engine
            .open_conversation(CONTACT)
            .await
            .expect_err("open should fail");
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.contact_id.as_deref(), Some(CONTACT));
        assert!(snapshot.messages.is_empty());
        assert_eq!(
            snapshot.error_text.as_deref(),
            Some("Could not load messages (network_error)")
        );

        *api.fail_recent.lock().expect("fail flag") = false;
        engine
            .open_conversation(CONTACT)
            .await
            .expect("retry should work");
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.messages.len(), 5);
        assert_eq!(snapshot.error_text, None);
    }

    #[tokio::test]
    async fn optimistic_send_collapses_with_pushed_confirmation() {
        let (engine, api) = sync_engine(FakeApi::default());
        engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");

        let sent = engine.send_message("hello").await.expect("send should work");
        assert!(sent.id.is_provisional());
        assert_eq!(sent.delivery, DeliveryState::Acknowledged);
        assert_eq!(
            *api.sent.lock().expect("sent log"),
            vec![(CONTACT.to_owned(), "hello".to_owned())]
        );

        engine.handle_push_event(&pushed("wamid.77", "bot", "hello", sent.timestamp_ms + 2_000));

        let snapshot = engine.snapshot();
        let hellos: Vec<&Message> = snapshot.messages.iter().filter(|m| m.body == "hello").collect();
        assert_eq!(hellos.len(), 1);
        assert_eq!(hellos[0].id, MessageId::server("wamid.77"));
        assert_eq!(hellos[0].direction, Direction::Outbound);
    }

    #[tokio::test]
    async fn failed_send_marks_placeholder_and_raises_one_notice() {
        let api = FakeApi::default();
        api.send_results.lock().expect("send results").push_back(Ok(false));
        let (engine, _) = sync_engine(api);
        engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");

        let sent = engine.send_message("hola").await.expect("send resolves");
        assert_eq!(sent.delivery, DeliveryState::Failed);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].delivery, DeliveryState::Failed);
        let notice = engine.take_notice().expect("one notice");
        assert_eq!(notice.code, "send_rejected");
        assert_eq!(notice.message_id, sent.id);
        assert_eq!(engine.take_notice(), None);
    }

    #[tokio::test]
    async fn send_validation_happens_before_io() {
        let (engine, api) = sync_engine(FakeApi::default());

        let err = engine
            .send_message("hello")
            .await
            .expect_err("no conversation is open");
        assert_eq!(err.code, "no_active_conversation");

        engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");
        let err = engine.send_message("  ").await.expect_err("blank body");
        assert_eq!(err.code, "empty_body");
        assert!(api.sent.lock().expect("sent log").is_empty());
        assert!(engine.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn older_load_preserves_anchor() {
        let api = FakeApi::with_history(50);
        api.older_pages.lock().expect("pages").push_back(Ok(OlderPage {
            messages: (1..=5).map(|t| wire(&format!("old{t}"), "bot", "earlier", t)).collect(),
            has_more: false,
        }));
        let (engine, api) = sync_engine(api);
        engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");
        engine.complete_render(2_000.0);

        assert!(!engine.observe_viewport(Viewport {
            scroll_top: 500.0,
            scroll_height: 2_000.0,
            client_height: 400.0,
        }));
        let added = engine.load_older().await.expect("older load should work");
        assert_eq!(added, 5);
        assert_eq!(
            engine.complete_render(2_300.0),
            Some(ScrollAction::ScrollTo(800.0))
        );

        let calls = api.older_calls.lock().expect("calls").clone();
        assert_eq!(calls, vec![(CONTACT.to_owned(), 1_000, 50)]);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.messages.len(), 55);
        assert!(!snapshot.has_older);
        assert_eq!(engine.load_older().await.expect("no-op load"), 0);
        assert_eq!(api.older_calls.lock().expect("calls").len(), 1);
    }

    #[tokio::test]
    async fn older_failure_requires_explicit_retry() {
        let api = FakeApi::with_history(50);
        api.older_pages
            .lock()
            .expect("pages")
            .push_back(Err(SyncError::network("timeout")));
        let (engine, api) = sync_engine(api);
        engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");

        engine.load_older().await.expect_err("older load fails");
        let snapshot = engine.snapshot();
        assert!(!snapshot.has_older);
        assert_eq!(
            snapshot.history,
            Some(HistoryState::LoadFailed {
                code: "network_error".into()
            })
        );
        assert!(snapshot.error_text.is_some());
        assert!(!engine.observe_viewport(Viewport::default()));

        assert_eq!(engine.load_older().await.expect("no automatic retry"), 0);
        assert_eq!(api.older_calls.lock().expect("calls").len(), 1);

        engine.retry_older().await.expect("explicit retry works");
        assert_eq!(api.older_calls.lock().expect("calls").len(), 2);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.history, Some(HistoryState::Exhausted));
        assert_eq!(snapshot.error_text, None);
    }

    #[tokio::test]
    async fn push_follows_bottom_only_for_active_conversation() {
        let (engine, _) = sync_engine(FakeApi::with_history(3));
        engine
            .open_conversation("other")
            .await
            .expect("open should work");
        engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");
        engine.complete_render(1_000.0);
        engine.observe_viewport(Viewport {
            scroll_top: 600.0,
            scroll_height: 1_000.0,
            client_height: 400.0,
        });

        engine.handle_push_event(&PushEvent::NewMessage(
            wire("o1", "user", "to other", 9_000).for_contact("other"),
        ));
        assert_eq!(engine.complete_render(1_000.0), Some(ScrollAction::Unchanged));

        engine.handle_push_event(&pushed("n1", "user", "nuevo", 9_000));
        assert_eq!(
            engine.complete_render(1_080.0),
            Some(ScrollAction::ScrollTo(680.0))
        );

        let cache = engine.cache();
        let cache = lock_cache(&cache);
        assert_eq!(cache.get("other").expect("other entry").messages().len(), 4);
        assert_eq!(cache.get(CONTACT).expect("active entry").messages().len(), 4);
    }

    #[tokio::test]
    async fn pushes_during_initial_load_are_kept() {
        let hold = Arc::new(Notify::new());
        let api = FakeApi {
            hold_recent: Some(Arc::clone(&hold)),
            ..FakeApi::with_history(1)
        };
        let (engine, _) = sync_engine(api);

        let open = engine.open_conversation(CONTACT);
        tokio::pin!(open);
        // Drive the open until it parks inside the fake backend.
        tokio::select! {
            _ = &mut open => panic!("open must wait for the backend"),
            _ = tokio::task::yield_now() => {}
        }
        engine.handle_push_event(&pushed("live", "user", "en vivo", 9_000));

        hold.notify_one();
        let window = open.await.expect("open should work");
        assert_eq!(window.messages.len(), 1);

        let ids: Vec<String> = engine
            .snapshot()
            .messages
            .iter()
            .map(|m| m.id.as_str().to_owned())
            .collect();
        assert_eq!(ids, vec!["m1", "live"]);
    }

    #[tokio::test]
    async fn failed_first_open_leaves_no_cache_entry() {
        let api = FakeApi::default();
        *api.fail_recent.lock().expect("fail flag") = true;
        let (engine, _) = sync_engine(api);

        engine
            .open_conversation(CONTACT)
            .await
            .expect_err("open should fail");
        assert!(lock_cache(&engine.cache()).get(CONTACT).is_none());
        assert!(!engine.observe_viewport(Viewport::default()));
    }

    #[tokio::test]
    async fn push_during_older_load_keeps_the_anchor() {
        let api = FakeApi::with_history(50);
        api.older_pages.lock().expect("pages").push_back(Ok(OlderPage {
            messages: (1..=5).map(|t| wire(&format!("old{t}"), "bot", "earlier", t)).collect(),
            has_more: true,
        }));
        let (engine, _) = sync_engine(api);
        engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");
        engine.complete_render(2_000.0);
        engine.observe_viewport(Viewport {
            scroll_top: 500.0,
            scroll_height: 2_000.0,
            client_height: 400.0,
        });

        engine.load_older().await.expect("older load should work");
        engine.handle_push_event(&pushed("n1", "user", "nuevo", 90_000));
        assert!(engine.has_pending_render());

        assert_eq!(
            engine.complete_renders(&[2_300.0, 2_380.0]),
            Some(ScrollAction::ScrollTo(800.0))
        );
        assert!(!engine.has_pending_render());
    }

    #[tokio::test]
    async fn pushes_for_unopened_contacts_are_not_cached() {
        let (engine, _) = sync_engine(FakeApi::default());
        engine.handle_push_event(&PushEvent::NewMessage(
            wire("x", "user", "hi", 1).for_contact("5215559999"),
        ));
        assert!(lock_cache(&engine.cache()).get("5215559999").is_none());
    }

    #[tokio::test]
    async fn status_updates_advance_delivery() {
        let (engine, _) = sync_engine(FakeApi::default());
        engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");
        engine.handle_push_event(&pushed("wamid.5", "bot", "ok", 5_000));

        engine.handle_push_event(&PushEvent::StatusUpdate(StatusUpdate {
            message_id: "wamid.5".into(),
            phone_number: Some(CONTACT.into()),
            status: "read".into(),
        }));
        engine.handle_push_event(&PushEvent::StatusUpdate(StatusUpdate {
            message_id: "wamid.5".into(),
            phone_number: Some(CONTACT.into()),
            status: "sent".into(),
        }));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.messages[0].delivery, DeliveryState::Delivered);
    }

    #[tokio::test]
    async fn server_errors_surface_for_active_conversation() {
        let (engine, _) = sync_engine(FakeApi::default());
        engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");
        engine.handle_push_event(&PushEvent::ServerError {
            message: "WhatsApp API unavailable".into(),
            contact_id: Some(CONTACT.into()),
        });
        assert_eq!(
            engine.snapshot().error_text.as_deref(),
            Some("WhatsApp API unavailable")
        );
    }

    #[tokio::test]
    async fn closing_keeps_cache_but_clears_view() {
        let (engine, _) = sync_engine(FakeApi::with_history(3));
        engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");
        engine.close_conversation();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.contact_id, None);
        assert!(snapshot.messages.is_empty());
        assert_eq!(engine.complete_render(100.0), None);
        assert!(lock_cache(&engine.cache()).get(CONTACT).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn attached_channel_feeds_the_engine() {
        let transport = Arc::new(FakeTransport::default());
        let frames = transport.push_connection();
        let channel = ChannelManager::new(
            Arc::clone(&transport) as Arc<dyn PushTransport>,
            crate::retry::RetryPolicy::default(),
            Duration::from_millis(150),
        );

        let (engine, _) = sync_engine(FakeApi::with_history(2));
        engine
            .open_conversation(CONTACT)
            .await
            .expect("open should work");
        let _subscription = engine.attach(&channel);
        let mut updates = engine.updates();

        channel.connect().await;
        frames
            .send(new_message_frame("wamid.live", "en vivo"))
            .expect("frame send");

        timeout(Duration::from_secs(5), updates.changed())
            .await
            .expect("engine should update")
            .expect("revision sender alive");
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.messages.len(), 3);
        assert!(snapshot.messages.iter().any(|m| m.id.as_str() == "wamid.live"));

        engine.handle_channel_status(&channel.current_status());
        assert_eq!(engine.snapshot().status_text, "Connected");
        channel.disconnect().await;
    }

    #[test]
    fn labels_channel_states() {
        let status = |phase, retry_in_ms| ChannelStatus {
            phase,
            attempt: 2,
            retry_in_ms,
        };
        assert_eq!(channel_label(&status(ChannelPhase::Open, None)), "Connected");
        assert_eq!(
            channel_label(&status(ChannelPhase::Reconnecting, Some(2_000))),
            "Reconnecting (retry in 2000 ms)"
        );
        assert_eq!(
            channel_label(&status(ChannelPhase::Reconnecting, None)),
            "Reconnecting (attempt 2)"
        );
        assert_eq!(channel_label(&status(ChannelPhase::GaveUp, None)), "Offline");
    }

    trait WireMessageExt {
        fn for_contact(self, contact_id: &str) -> Self;
    }

    impl WireMessageExt for WireMessage {
        fn for_contact(mut self, contact_id: &str) -> Self {
            self.phone_number = Some(contact_id.to_owned());
            self
        }
    }
}
