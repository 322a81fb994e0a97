//! Client-side conversation synchronization engine.
//!
//! Keeps one ordered, duplicate-free message timeline per contact across a
//! local cache, paginated history loads, a live push channel and optimistic
//! sends, and keeps the viewport stable while the timeline changes.

/// Backend message endpoints consumed by the engine.
pub mod api;
/// Per-contact conversation cache.
pub mod cache;
/// Shared push-channel connection manager.
pub mod channel;
/// Push frame decoding and wire timestamps.
pub mod codec;
/// Conversation engine composing every component.
pub mod engine;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Send-result normalization.
pub mod normalization;
/// Optimistic send state machine.
pub mod optimistic;
/// Newest/older window loading.
pub mod pagination;
/// Timeline merge and perspective correction.
pub mod reconcile;
/// Backoff policy used by reconnect loops.
pub mod retry;
/// Viewport anchoring.
pub mod scroll;
/// Messages, push events and configuration.
pub mod types;

pub use api::MessageApi;
pub use cache::{CacheEntry, ConversationCache, SharedCache, lock_cache};
pub use channel::{
    ChannelError, ChannelFrame, ChannelManager, ChannelPhase, ChannelStatus, NORMAL_CLOSURE,
    PushConnection, PushTransport, Subscription,
};
pub use codec::{decode_push_bytes, decode_push_frame, format_timestamp_rfc3339, parse_timestamp_ms};
pub use engine::{ConversationSnapshot, ConversationSync};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use normalization::{SendNotice, SendOutcome, normalize_send_outcome};
pub use optimistic::{OptimisticSendMachine, OptimisticState};
pub use pagination::{PaginationController, bounded_window};
pub use reconcile::{Incoming, Reconciler, ingest};
pub use retry::RetryPolicy;
pub use scroll::{ScrollAction, ScrollAnchorController, ScrollTrigger, Viewport};
pub use types::{
    ContactId, DeliveryState, Direction, HistoryState, LoadedWindow, MediaRef, Message, MessageId,
    OlderPage, PushEvent, SenderRole, StatusUpdate, SyncConfig, WireMessage,
};
