//! Merge of cached, paginated, pushed and optimistic messages into one
//! ordered, duplicate-free conversation timeline.

use std::collections::HashSet;

use tracing::{debug, trace};

use crate::types::{DeliveryState, Direction, MediaRef, Message, MessageId, SenderRole, WireMessage};

/// Frame in which a batch of incoming messages is labelled.
#[derive(Debug, Clone, Copy)]
pub enum Incoming<'a> {
    /// Source-labelled records (history API, push channel) for one contact.
    Wire {
        contact_id: &'a str,
        messages: &'a [WireMessage],
    },
    /// Messages already in operator perspective (optimistic entries).
    Local(&'a [Message]),
}

/// Convert a source-labelled record into an operator-perspective message.
///
/// This is the only place the remote party's role label is inverted.
pub fn ingest(contact_id: &str, wire: &WireMessage) -> Message {
    let reported = wire
        .status
        .as_deref()
        .and_then(DeliveryState::from_wire_status);

    let (direction, delivery) = match wire.role() {
        SenderRole::Business => (
            Direction::Outbound,
            reported
                .filter(|state| *state != DeliveryState::None)
                .unwrap_or(DeliveryState::Acknowledged),
        ),
        SenderRole::Contact => (Direction::Inbound, DeliveryState::None),
        SenderRole::Unknown(label) => {
            debug!(message_id = %wire.id, %label, "unknown sender label; treating as inbound");
            (Direction::Inbound, DeliveryState::None)
        }
    };

    Message {
        id: MessageId::server(wire.id.clone()),
        contact_id: contact_id.to_owned(),
        body: wire.text.clone(),
        direction,
        timestamp_ms: wire.timestamp_ms,
        delivery,
        media: wire.media_url.clone().map(|url| MediaRef { url }),
    }
}

/// Ingest a whole batch for one contact.
pub fn ingest_batch(contact_id: &str, wire: &[WireMessage]) -> Vec<Message> {
    wire.iter().map(|message| ingest(contact_id, message)).collect()
}

/// Timeline merge function with a fixed optimistic-match tolerance.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    tolerance_ms: u64,
}

impl Reconciler {
    pub fn new(tolerance_ms: u64) -> Self {
        Self { tolerance_ms }
    }

    /// Merge `incoming` into `cached` and return the canonical timeline.
    ///
    /// The result is sorted ascending by timestamp (ties keep arrival order)
    /// and holds no two entries with the same ID. A provisional entry and a
    /// confirmed copy with the same body, direction and a timestamp within
    /// tolerance collapse into the confirmed copy.
    pub fn reconcile(&self, cached: &[Message], incoming: Incoming<'_>) -> Vec<Message> {
        let incoming = match incoming {
            Incoming::Wire {
                contact_id,
                messages,
            } => ingest_batch(contact_id, messages),
            Incoming::Local(messages) => messages.to_vec(),
        };

        let mut merged = dedupe_by_id(cached.to_vec());
        for message in incoming {
            self.merge_one(&mut merged, message);
        }

        sort_timeline(&mut merged);
        dedupe_by_id(merged)
    }

    fn merge_one(&self, merged: &mut Vec<Message>, message: Message) {
        if let Some(existing) = merged.iter_mut().find(|it| it.id == message.id) {
            existing.delivery = existing.delivery.advanced_to(message.delivery);
            if existing.media.is_none() {
                existing.media = message.media;
            }
            return;
        }

        let Some(index) = self.find_counterpart(merged, &message) else {
            merged.push(message);
            return;
        };

        let existing = &mut merged[index];
        if existing.id.is_provisional() {
            trace!(
                provisional_id = %existing.id,
                confirmed_id = %message.id,
                "confirmed copy replaces optimistic entry"
            );
            let delivery = existing.delivery.advanced_to(message.delivery);
            *existing = Message {
                delivery,
                ..message
            };
        } else {
            trace!(
                provisional_id = %message.id,
                confirmed_id = %existing.id,
                "optimistic entry already confirmed; dropping placeholder"
            );
        }
    }

    /// Closest-in-time entry that is the other half of an optimistic pair.
    fn find_counterpart(&self, merged: &[Message], message: &Message) -> Option<usize> {
        merged
            .iter()
            .enumerate()
            .filter(|(_, candidate)| self.is_optimistic_pair(candidate, message))
            .min_by_key(|(_, candidate)| candidate.timestamp_ms.abs_diff(message.timestamp_ms))
            .map(|(index, _)| index)
    }

    fn is_optimistic_pair(&self, a: &Message, b: &Message) -> bool {
        let provisional = match (a.id.is_provisional(), b.id.is_provisional()) {
            (true, false) => a,
            (false, true) => b,
            _ => return false,
        };

        provisional.delivery != DeliveryState::Failed
            && a.direction == Direction::Outbound
            && b.direction == Direction::Outbound
            && a.contact_id == b.contact_id
            && a.body == b.body
            && a.timestamp_ms.abs_diff(b.timestamp_ms) <= self.tolerance_ms
    }
}

/// Drop repeated IDs, keeping the first occurrence.
pub fn dedupe_by_id(messages: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::with_capacity(messages.len());
    messages
        .into_iter()
        .filter(|message| seen.insert(message.id.clone()))
        .collect()
}

/// Stable ascending sort by timestamp.
pub fn sort_timeline(messages: &mut [Message]) {
    messages.sort_by_key(|message| message.timestamp_ms);
}

/// Prepend an older window, skipping IDs the current list already holds.
pub fn prepend_older(current: &[Message], older: Vec<Message>) -> Vec<Message> {
    let present: HashSet<&MessageId> = current.iter().map(|message| &message.id).collect();
    let mut merged: Vec<Message> = dedupe_by_id(older)
        .into_iter()
        .filter(|message| !present.contains(&message.id))
        .collect();
    merged.extend(current.iter().cloned());
    sort_timeline(&mut merged);
    merged
}

/// Move the delivery state of a server message forward. Unknown IDs are ignored.
pub fn apply_status(messages: &mut [Message], message_id: &str, reported: DeliveryState) -> bool {
    let Some(message) = messages
        .iter_mut()
        .find(|message| !message.id.is_provisional() && message.id.as_str() == message_id)
    else {
        return false;
    };
    message.delivery = message.delivery.advanced_to(reported);
    true
}
