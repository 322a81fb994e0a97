use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Fetch rejected by the transport or answered with a non-success status.
    Network,
    /// Push channel closed abnormally or could not be opened.
    Channel,
    /// Input rejected before any I/O was attempted.
    Validation,
    /// Backend answered a send request with an unsuccessful result.
    SendFailed,
    /// Operation rejected because an equivalent one is already in flight.
    Busy,
    /// Authentication/authorization failure.
    Auth,
    /// Rate-limited by the backend.
    RateLimited,
    /// Serialization/deserialization failure.
    Serialization,
    /// Credential storage failure.
    Storage,
    /// Invalid configuration or unsupported request.
    Config,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload shared by every sync component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    /// Construct a new sync error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Validation, code, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Network, "network_error", message)
    }

    pub fn channel(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Channel, code, message)
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: impl std::fmt::Debug, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while in state {current:?}"),
        )
    }

    /// Whether a later retry of the same operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            SyncErrorCategory::Network
                | SyncErrorCategory::Channel
                | SyncErrorCategory::RateLimited
                | SyncErrorCategory::Busy
        )
    }
}

/// Map HTTP status codes to sync error categories.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        401 | 403 => SyncErrorCategory::Auth,
        408 | 429 => SyncErrorCategory::RateLimited,
        400..=499 => SyncErrorCategory::Config,
        500..=599 => SyncErrorCategory::Network,
        _ => SyncErrorCategory::Internal,
    }
}
