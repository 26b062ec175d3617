use std::collections::HashMap;

use chrono::Utc;
use shared::{
    domain::{
        ConversationId, DeliveryStatus, Direction, Message, MessageId, MessageKind, MessageRef,
        Metadata, TempId,
    },
    protocol::OutboundMessage,
};

use crate::{
    error::SyncError,
    reconciler::{merge_into, Timeline},
};

#[derive(Debug, Clone)]
struct OutboundDraft {
    content: String,
    kind: MessageKind,
    metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The placeholder was swapped for the server message at this index.
    Replaced(usize),
    /// An echo had already inserted the server message; the placeholder was
    /// dropped and the existing entry (now at this index) updated.
    MergedIntoExisting(usize),
    AlreadyRetired,
    Unknown,
}

#[derive(Debug, Default)]
pub struct DeliveryPipeline {
    drafts: HashMap<TempId, OutboundDraft>,
    retired: HashMap<TempId, MessageId>,
}

impl DeliveryPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a `Sending` placeholder and returns it with the request body
    /// for both transports.
    pub fn stage(
        &mut self,
        timeline: &mut Timeline,
        conversation_id: &ConversationId,
        content: String,
        kind: MessageKind,
        metadata: Metadata,
    ) -> (Message, OutboundMessage) {
        let temp_id = TempId::generate();
        let now = Utc::now();
        let message = Message {
            id: MessageRef::Pending(temp_id.clone()),
            conversation_id: conversation_id.clone(),
            content: content.clone(),
            kind,
            direction: Direction::Outbound,
            status: DeliveryStatus::Sending,
            timestamp: now,
            read_at: None,
            metadata: metadata.clone(),
        };
        timeline.insert_ordered(message.clone());
        self.drafts.insert(
            temp_id.clone(),
            OutboundDraft {
                content: content.clone(),
                kind,
                metadata: metadata.clone(),
            },
        );
        let outbound = OutboundMessage {
            conversation_id: conversation_id.clone(),
            client_ref: temp_id,
            content,
            kind,
            metadata,
            sent_at: now,
        };
        (message, outbound)
    }

    pub fn is_pending(&self, temp_id: &TempId) -> bool {
        self.drafts.contains_key(temp_id)
    }

    pub fn is_retired(&self, temp_id: &TempId) -> bool {
        self.retired.contains_key(temp_id)
    }

    pub fn retired_as(&self, temp_id: &TempId) -> Option<&MessageId> {
        self.retired.get(temp_id)
    }

    pub fn pending_count(&self) -> usize {
        self.drafts.len()
    }

    /// Swaps the placeholder for `temp_id` with the server-confirmed message.
    pub fn confirm(
        &mut self,
        timeline: &mut Timeline,
        temp_id: &TempId,
        mut confirmed: Message,
    ) -> ConfirmOutcome {
        if self.retired.contains_key(temp_id) {
            return ConfirmOutcome::AlreadyRetired;
        }
        let Some(server_id) = confirmed.id.confirmed().cloned() else {
            return ConfirmOutcome::Unknown;
        };
        let Some(index) = timeline.position(&MessageRef::Pending(temp_id.clone())) else {
            return ConfirmOutcome::Unknown;
        };

        self.drafts.remove(temp_id);
        self.retired.insert(temp_id.clone(), server_id.clone());

        let mut status = DeliveryStatus::Sent;
        status.advance(confirmed.status);
        confirmed.status = status;
        confirmed.direction = Direction::Outbound;

        match timeline.position_confirmed(&server_id) {
            Some(existing) => {
                if let Some(entry) = timeline.at_mut(existing) {
                    merge_into(entry, &confirmed);
                }
                timeline.remove_at(index);
                let existing = if existing > index {
                    existing - 1
                } else {
                    existing
                };
                ConfirmOutcome::MergedIntoExisting(existing)
            }
            None => {
                timeline.replace_at(index, confirmed);
                ConfirmOutcome::Replaced(index)
            }
        }
    }

    /// Marks the placeholder `Failed`; returns the updated entry.
    pub fn fail(&mut self, timeline: &mut Timeline, temp_id: &TempId) -> Option<Message> {
        if self.retired.contains_key(temp_id) {
            return None;
        }
        let message = timeline.get_mut(&MessageRef::Pending(temp_id.clone()))?;
        if message.status.advance(DeliveryStatus::Failed) {
            Some(message.clone())
        } else {
            None
        }
    }

    fn failed_draft(
        &self,
        timeline: &Timeline,
        id: &MessageRef,
    ) -> Result<TempId, SyncError> {
        let message = timeline
            .get(id)
            .ok_or_else(|| SyncError::UnknownMessage(id.to_string()))?;
        let temp_id = match id.pending() {
            Some(temp_id) if message.status == DeliveryStatus::Failed => temp_id,
            _ => {
                return Err(SyncError::InvalidMessageState {
                    id: id.to_string(),
                    status: message.status,
                })
            }
        };
        if !self.drafts.contains_key(temp_id) {
            return Err(SyncError::UnknownMessage(id.to_string()));
        }
        Ok(temp_id.clone())
    }

    /// Replaces a failed placeholder with a fresh `Sending` one carrying the
    /// original content.
    pub fn retry(
        &mut self,
        timeline: &mut Timeline,
        conversation_id: &ConversationId,
        id: &MessageRef,
    ) -> Result<(Message, OutboundMessage), SyncError> {
        let temp_id = self.failed_draft(timeline, id)?;
        let draft = self
            .drafts
            .remove(&temp_id)
            .ok_or_else(|| SyncError::UnknownMessage(id.to_string()))?;
        timeline.remove(id);
        Ok(self.stage(
            timeline,
            conversation_id,
            draft.content,
            draft.kind,
            draft.metadata,
        ))
    }

    /// Removes a failed placeholder for good.
    pub fn discard(
        &mut self,
        timeline: &mut Timeline,
        id: &MessageRef,
    ) -> Result<Message, SyncError> {
        let temp_id = self.failed_draft(timeline, id)?;
        self.drafts.remove(&temp_id);
        timeline
            .remove(id)
            .ok_or_else(|| SyncError::UnknownMessage(id.to_string()))
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
