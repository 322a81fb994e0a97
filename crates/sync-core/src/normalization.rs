use serde::{Deserialize, Serialize};

use crate::{
    error::{SyncError, SyncErrorCategory},
    types::{ContactId, MessageId},
};

/// Normalized result of one send request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Backend accepted the message for delivery.
    Acknowledged,
    /// Backend declined the message or the request failed.
    Failed { error: SyncError },
}

/// User-visible notification raised once per failed send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendNotice {
    pub message_id: MessageId,
    pub contact_id: ContactId,
    pub code: String,
    pub text: String,
}

/// Collapse the backend's success flag and transport errors into one outcome.
pub fn normalize_send_outcome(result: Result<bool, SyncError>) -> SendOutcome {
    match result {
        Ok(true) => SendOutcome::Acknowledged,
        Ok(false) => SendOutcome::Failed {
            error: SyncError::new(
                SyncErrorCategory::SendFailed,
                "send_rejected",
                "backend did not accept the message",
            ),
        },
        Err(error) => SendOutcome::Failed { error },
    }
}

/// Build the notification shown for a failed send.
pub fn send_failure_notice(message_id: &MessageId, contact_id: &str, error: &SyncError) -> SendNotice {
    SendNotice {
        message_id: message_id.clone(),
        contact_id: contact_id.to_owned(),
        code: error.code.clone(),
        text: format!("Message could not be sent: {}", error.message),
    }
}
