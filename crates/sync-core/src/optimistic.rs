use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{SyncError, SyncErrorCategory},
    normalization::{SendNotice, SendOutcome, send_failure_notice},
    types::{DeliveryState, Direction, Message, MessageId},
};

/// Lifecycle of one optimistic send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OptimisticState {
    Pending,
    Acknowledged,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OptimisticEntry {
    message: Message,
    state: OptimisticState,
}

/// Result of applying a send response to an optimistic entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResolution {
    /// The placeholder with its updated delivery state.
    pub message: Message,
    /// Set exactly once, on the transition to `Failed`.
    pub notice: Option<SendNotice>,
}

/// Owns optimistic entries from submission until the send resolves and the
/// placeholder leaves the conversation list.
///
/// Transitions: `Pending -> Acknowledged | Failed`. Anything else is an
/// invalid transition.
#[derive(Debug, Clone, Default)]
pub struct OptimisticSendMachine {
    entries: Vec<OptimisticEntry>,
}

impl OptimisticSendMachine {
    /// Validate `body` and create a pending placeholder for it.
    ///
    /// Validation happens before any I/O; rejected input creates no entry.
    pub fn submit(&mut self, contact_id: &str, body: &str, now_ms: u64) -> Result<Message, SyncError> {
        if contact_id.trim().is_empty() {
            return Err(SyncError::validation(
                "no_active_conversation",
                "open a conversation before sending",
            ));
        }
        if body.trim().is_empty() {
            return Err(SyncError::validation("empty_body", "message body is empty"));
        }

        let message = Message {
            id: MessageId::provisional(),
            contact_id: contact_id.to_owned(),
            body: body.to_owned(),
            direction: Direction::Outbound,
            timestamp_ms: now_ms,
            delivery: DeliveryState::Pending,
            media: None,
        };
        debug!(%contact_id, id = %message.id, "optimistic entry submitted");
        self.entries.push(OptimisticEntry {
            message: message.clone(),
            state: OptimisticState::Pending,
        });
        Ok(message)
    }

    /// Apply the send response for `message_id`.
    pub fn on_send_result(
        &mut self,
        message_id: &MessageId,
        outcome: SendOutcome,
    ) -> Result<SendResolution, SyncError> {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| &entry.message.id == message_id)
        else {
            return Err(SyncError::new(
                SyncErrorCategory::Internal,
                "unknown_optimistic_entry",
                format!("no optimistic entry with id {message_id}"),
            ));
        };

        if entry.state != OptimisticState::Pending {
            return Err(SyncError::invalid_state(entry.state, "on_send_result"));
        }

        let notice = match outcome {
            SendOutcome::Acknowledged => {
                entry.state = OptimisticState::Acknowledged;
                entry.message.delivery = DeliveryState::Acknowledged;
                None
            }
            SendOutcome::Failed { error } => {
                entry.state = OptimisticState::Failed;
                entry.message.delivery = DeliveryState::Failed;
                Some(send_failure_notice(&entry.message.id, &entry.message.contact_id, &error))
            }
        };
        debug!(id = %message_id, state = ?entry.state, "optimistic entry resolved");

        Ok(SendResolution {
            message: entry.message.clone(),
            notice,
        })
    }

    pub fn state(&self, message_id: &MessageId) -> Option<OptimisticState> {
        self.entries
            .iter()
            .find(|entry| &entry.message.id == message_id)
            .map(|entry| entry.state)
    }

    /// Drop resolved entries whose placeholder is no longer in `messages`
    /// (replaced by the confirmed copy). Pending entries stay until their
    /// send response arrives.
    pub fn release_confirmed(&mut self, contact_id: &str, messages: &[Message]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            entry.message.contact_id != contact_id
                || entry.state == OptimisticState::Pending
                || messages.iter().any(|message| message.id == entry.message.id)
        });
        let released = before - self.entries.len();
        if released > 0 {
            debug!(%contact_id, released, "released confirmed optimistic entries");
        }
        released
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
