use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable contact identifier (the contact's phone number on the backend).
pub type ContactId = String;

/// Message identity: server-assigned, or client-generated before confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// ID assigned by the backend.
    Server(String),
    /// Local placeholder ID of an optimistic entry.
    Provisional(String),
}

impl MessageId {
    /// Generate a fresh provisional ID (`local-<uuid>`).
    pub fn provisional() -> Self {
        Self::Provisional(format!("local-{}", Uuid::new_v4()))
    }

    pub fn server(id: impl Into<String>) -> Self {
        Self::Server(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Server(id) | Self::Provisional(id) => id,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message direction from the operator's point of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent by the business side (operator or bot).
    Outbound,
    /// Sent by the remote contact.
    Inbound,
}

/// Delivery lifecycle of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Optimistic entry waiting for the send response.
    Pending,
    /// Backend accepted the send.
    Acknowledged,
    /// Backend reported delivery (or read) on the contact's device.
    Delivered,
    /// Send attempt failed.
    Failed,
    /// Inbound messages carry no delivery state.
    None,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Pending | Self::Failed => 1,
            Self::Acknowledged => 2,
            Self::Delivered => 3,
        }
    }

    /// Combine the current state with a reported one.
    ///
    /// States only move forward, except `Failed`, which always applies.
    pub fn advanced_to(self, reported: Self) -> Self {
        if reported == Self::Failed || reported.rank() > self.rank() {
            reported
        } else {
            self
        }
    }

    /// Map a backend status label (`sent`, `delivered`, ...) to a state.
    pub fn from_wire_status(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" => Some(Self::Pending),
            "sent" | "accepted" => Some(Self::Acknowledged),
            "delivered" | "read" => Some(Self::Delivered),
            "failed" | "error" => Some(Self::Failed),
            "received" => Some(Self::None),
            _ => None,
        }
    }
}

/// Optional media attachment reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    /// Location of the media on the backend.
    pub url: String,
}

/// Canonical, operator-perspective message held by the conversation cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub contact_id: ContactId,
    pub body: String,
    pub direction: Direction,
    /// Logical ordering key, milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    pub delivery: DeliveryState,
    pub media: Option<MediaRef>,
}

/// Role label attached by the backend, in the remote party's frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderRole {
    /// `user`: the WhatsApp contact.
    Contact,
    /// `bot`, `agent`, `operator`: the business side.
    Business,
    /// Any label the client does not know.
    Unknown(String),
}

impl SenderRole {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "user" | "contact" | "customer" => Self::Contact,
            "bot" | "agent" | "operator" | "admin" => Self::Business,
            _ => Self::Unknown(label.to_owned()),
        }
    }
}

/// Source-labelled message as delivered by the history API and push channel.
///
/// Never rendered directly; `reconcile::ingest` turns it into a [`Message`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WireMessage {
    #[serde(deserialize_with = "crate::codec::string_or_number")]
    pub id: String,
    #[serde(default, alias = "message", alias = "body")]
    pub text: String,
    #[serde(default)]
    pub sender: String,
    #[serde(
        rename = "timestamp",
        default,
        deserialize_with = "crate::codec::timestamp_ms"
    )]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default, alias = "media")]
    pub media_url: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
}

impl WireMessage {
    pub fn role(&self) -> SenderRole {
        SenderRole::from_label(&self.sender)
    }
}

/// Delivery-status change pushed by the backend.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StatusUpdate {
    #[serde(deserialize_with = "crate::codec::string_or_number")]
    pub message_id: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    pub status: String,
}

/// Discrete event decoded from the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// A message was stored (inbound, bot reply, or operator send).
    NewMessage(WireMessage),
    /// Delivery state of a stored message changed.
    StatusUpdate(StatusUpdate),
    /// A contact was created or edited.
    ContactUpdated(serde_json::Value),
    /// A template was created, edited or reviewed.
    TemplateUpdated(serde_json::Value),
    /// Usage statistics changed.
    StatsUpdated(serde_json::Value),
    /// Backend-side error report.
    ServerError {
        message: String,
        contact_id: Option<ContactId>,
    },
}

impl PushEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new_message",
            Self::StatusUpdate(_) => "status",
            Self::ContactUpdated(_) => "contact_updated",
            Self::TemplateUpdated(_) => "template_updated",
            Self::StatsUpdated(_) => "stats_updated",
            Self::ServerError { .. } => "error",
        }
    }
}

/// Result of an initial or older-window load, already in operator perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedWindow {
    pub messages: Vec<Message>,
    pub has_older: bool,
}

/// Raw older-window response from the history API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OlderPage {
    pub messages: Vec<WireMessage>,
    pub has_more: bool,
}

/// Whether older history can still be requested for a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HistoryState {
    /// More history may exist.
    Available,
    /// The backend reported no older messages.
    Exhausted,
    /// The last older-window request failed; only an explicit retry resumes.
    LoadFailed { code: String },
}

impl HistoryState {
    pub fn from_has_older(has_older: bool) -> Self {
        if has_older {
            Self::Available
        } else {
            Self::Exhausted
        }
    }

    pub fn has_older(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// Tunables shared by the sync components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Newest-window size requested when a conversation opens.
    pub initial_window: u16,
    /// Window size of each older-history request.
    pub older_window: u16,
    /// Largest newest-window page the backend returns.
    pub initial_page_cap: u16,
    /// Largest older-history page the backend accepts.
    pub server_page_cap: u16,
    /// Cache entries not refreshed within this window are evicted on write.
    pub cache_retention_ms: u64,
    /// Per-conversation cap on cached messages. Refresh writes drop the
    /// oldest beyond it; older pages loaded on request raise it.
    pub cache_max_items: usize,
    /// Timestamp tolerance for matching optimistic entries to confirmed copies.
    pub dedup_tolerance_ms: u64,
    /// Distance from the bottom within which new content is auto-followed.
    pub follow_threshold_px: u32,
    /// Coalescing window for repeated `connect()` calls.
    pub connect_debounce_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Abnormal closures tolerated before automatic reconnection stops.
    pub reconnect_max_attempts: u32,
}

impl SyncConfig {
    pub fn cache_retention(&self) -> Duration {
        Duration::from_millis(self.cache_retention_ms)
    }

    pub fn connect_debounce(&self) -> Duration {
        Duration::from_millis(self.connect_debounce_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_window: 50,
            older_window: 50,
            initial_page_cap: 50,
            server_page_cap: 100,
            cache_retention_ms: 60 * 60 * 1_000,
            cache_max_items: 1_000,
            dedup_tolerance_ms: 5_000,
            follow_threshold_px: 100,
            connect_debounce_ms: 150,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 5,
        }
    }
}
