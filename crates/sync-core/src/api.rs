use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::SyncError,
    types::{OlderPage, WireMessage},
};

/// Backend message endpoints consumed by the sync engine.
///
/// Responses are source-labelled; callers ingest them before display.
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// Newest `limit` messages of a conversation, oldest first.
    async fn fetch_recent(&self, contact_id: &str, limit: u16) -> Result<Vec<WireMessage>, SyncError>;

    /// Up to `limit` messages strictly older than `before_ms`.
    async fn fetch_older(
        &self,
        contact_id: &str,
        before_ms: u64,
        limit: u16,
    ) -> Result<OlderPage, SyncError>;

    /// Send a text message; `Ok(false)` means the backend declined it.
    async fn send_message(&self, contact_id: &str, body: &str) -> Result<bool, SyncError>;
}

#[async_trait]
impl<T: MessageApi + ?Sized> MessageApi for Arc<T> {
    async fn fetch_recent(&self, contact_id: &str, limit: u16) -> Result<Vec<WireMessage>, SyncError> {
        (**self).fetch_recent(contact_id, limit).await
    }

    async fn fetch_older(
        &self,
        contact_id: &str,
        before_ms: u64,
        limit: u16,
    ) -> Result<OlderPage, SyncError> {
        (**self).fetch_older(contact_id, before_ms, limit).await
    }

    async fn send_message(&self, contact_id: &str, body: &str) -> Result<bool, SyncError> {
        (**self).send_message(contact_id, body).await
    }
}
