use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use shared::{
    domain::{DeliveryStatus, Direction, Message, MessageId, MessageRef, UserId},
    protocol::MessagePayload,
};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    History,
    PushChannel,
    ChangeFeed,
    Rest,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::History => "history",
            Self::PushChannel => "push",
            Self::ChangeFeed => "change_feed",
            Self::Rest => "rest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted(usize),
    Updated(usize),
    Unchanged,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// The visible message list.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    messages: Vec<Message>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn position(&self, id: &MessageRef) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }

    pub fn position_confirmed(&self, id: &MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.id.confirmed() == Some(id))
    }

    pub fn get(&self, id: &MessageRef) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn get_mut(&mut self, id: &MessageRef) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| &message.id == id)
    }

    pub fn at(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut Message> {
        self.messages.get_mut(index)
    }

    /// Inserts after the last entry whose timestamp is not later.
    pub fn insert_ordered(&mut self, message: Message) -> usize {
        let index = self
            .messages
            .iter()
            .rposition(|existing| existing.timestamp <= message.timestamp)
            .map_or(0, |index| index + 1);
        self.messages.insert(index, message);
        index
    }

    pub fn replace_at(&mut self, index: usize, message: Message) -> Option<Message> {
        let slot = self.messages.get_mut(index)?;
        Some(std::mem::replace(slot, message))
    }

    pub fn remove_at(&mut self, index: usize) -> Option<Message> {
        if index < self.messages.len() {
            Some(self.messages.remove(index))
        } else {
            None
        }
    }

    pub fn remove(&mut self, id: &MessageRef) -> Option<Message> {
        let index = self.position(id)?;
        self.remove_at(index)
    }

    /// Pagination cursor: the oldest server-confirmed message.
    pub fn oldest_confirmed(&self) -> Option<&MessageId> {
        self.messages.iter().find_map(|message| message.id.confirmed())
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }
}

/// Builds the visible form of a server message from the viewer's side.
pub fn message_from_payload(payload: &MessagePayload, viewer: &UserId) -> Message {
    let direction = if &payload.sender_id == viewer {
        Direction::Outbound
    } else {
        Direction::Inbound
    };
    Message {
        id: MessageRef::Confirmed(payload.message_id.clone()),
        conversation_id: payload.conversation_id.clone(),
        content: payload.content.clone(),
        kind: payload.kind,
        direction,
        status: payload.status,
        timestamp: payload.sent_at,
        read_at: payload.read_at,
        metadata: payload.metadata.clone(),
    }
}

/// Copies newer facts from `incoming` onto `existing`; returns whether
/// anything visible changed.
pub(crate) fn merge_into(existing: &mut Message, incoming: &Message) -> bool {
    let mut changed = existing.status.advance(incoming.status);
    if existing.read_at.is_none() && incoming.read_at.is_some() {
        existing.read_at = incoming.read_at;
        changed = true;
    }
    if !incoming.content.is_empty() && existing.content != incoming.content {
        existing.content = incoming.content.clone();
        changed = true;
    }
    if !incoming.metadata.is_empty() && existing.metadata != incoming.metadata {
        existing.metadata = incoming.metadata.clone();
        changed = true;
    }
    changed
}

const EARLY_STATUS_LIMIT: usize = 256;

#[derive(Debug, Default)]
pub struct EventReconciler {
    timeline: Timeline,
    /// Status acks that arrived before their message did.
    early_status: HashMap<MessageId, (DeliveryStatus, DateTime<Utc>)>,
    early_order: VecDeque<MessageId>,
}

impl EventReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn timeline_mut(&mut self) -> &mut Timeline {
        &mut self.timeline
    }

    /// Merges one server-confirmed message. Placeholder ids are resolved by
    /// the delivery pipeline before anything reaches this point.
    pub fn merge(&mut self, incoming: Message, source: EventSource) -> MergeOutcome {
        let Some(message_id) = incoming.id.confirmed().cloned() else {
            warn!(
                id = %incoming.id,
                source = source.as_str(),
                "reconciler: dropping unconfirmed inbound message"
            );
            return MergeOutcome::Unchanged;
        };

        match self.timeline.position_confirmed(&message_id) {
            Some(index) => {
                let changed = self
                    .timeline
                    .at_mut(index)
                    .is_some_and(|existing| merge_into(existing, &incoming));
                if changed {
                    MergeOutcome::Updated(index)
                } else {
                    MergeOutcome::Unchanged
                }
            }
            None => {
                let index = self.timeline.insert_ordered(incoming);
                self.settle(&message_id);
                MergeOutcome::Inserted(index)
            }
        }
    }

    /// Merges a history page; returns how many entries changed.
    pub fn merge_page(&mut self, messages: Vec<Message>) -> usize {
        messages
            .into_iter()
            .map(|message| self.merge(message, EventSource::History))
            .filter(|outcome| outcome.changed())
            .count()
    }

    /// Forward-only status update for a confirmed message. An ack for an id
    /// the timeline does not hold yet is kept until that message arrives.
    pub fn apply_status(
        &mut self,
        message_id: &MessageId,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> bool {
        let Some(index) = self.timeline.position_confirmed(message_id) else {
            self.hold_status(message_id, status, at);
            return false;
        };
        self.timeline
            .at_mut(index)
            .is_some_and(|message| advance_status(message, status, at))
    }

    /// Applies a held ack to `message_id` once it is in the timeline.
    pub fn settle(&mut self, message_id: &MessageId) -> bool {
        let Some(index) = self.timeline.position_confirmed(message_id) else {
            return false;
        };
        let Some((status, at)) = self.early_status.remove(message_id) else {
            return false;
        };
        self.early_order.retain(|id| id != message_id);
        self.timeline
            .at_mut(index)
            .is_some_and(|message| advance_status(message, status, at))
    }

    pub fn held_status_count(&self) -> usize {
        self.early_status.len()
    }

    pub fn clear_held_status(&mut self) {
        self.early_status.clear();
        self.early_order.clear();
    }

    fn hold_status(&mut self, message_id: &MessageId, status: DeliveryStatus, at: DateTime<Utc>) {
        if let Some((held, held_at)) = self.early_status.get_mut(message_id) {
            if held.advance(status) {
                *held_at = at;
            }
            return;
        }
        if self.early_order.len() >= EARLY_STATUS_LIMIT {
            if let Some(oldest) = self.early_order.pop_front() {
                self.early_status.remove(&oldest);
            }
        }
        self.early_status.insert(message_id.clone(), (status, at));
        self.early_order.push_back(message_id.clone());
    }

    pub fn remove(&mut self, message_id: &MessageId) -> Option<Message> {
        let index = self.timeline.position_confirmed(message_id)?;
        self.timeline.remove_at(index)
    }
}

fn advance_status(message: &mut Message, status: DeliveryStatus, at: DateTime<Utc>) -> bool {
    let changed = message.status.advance(status);
    if status == DeliveryStatus::Read && message.read_at.is_none() {
        message.read_at = Some(at);
        return true;
    }
    changed
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
