use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Conversation, ConversationId, DeliveryStatus, MessageId, MessageKind, Metadata, TempId,
        UserId,
    },
    error::ApiError,
};

/// Frames the client emits on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        message: OutboundMessage,
    },
    MarkRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    Typing {
        conversation_id: ConversationId,
        active: bool,
    },
}

/// Outbound message body, shared by the push hint and the REST write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub conversation_id: ConversationId,
    pub client_ref: TempId,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    pub sent_at: DateTime<Utc>,
}

/// Server view of a persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub status: DeliveryStatus,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    /// Temporary id of the optimistic entry this message originated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<TempId>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub title: String,
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

impl From<ConversationSummary> for Conversation {
    fn from(summary: ConversationSummary) -> Self {
        Self {
            id: summary.conversation_id,
            title: summary.title,
            participants: summary.participants,
            last_message: summary.last_message,
            last_message_at: summary.last_message_at,
            unread_count: summary.unread_count,
        }
    }
}

/// One page of history, newest page first when `before` is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessagePayload>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadHttpRequest {
    pub message_ids: Vec<MessageId>,
}

/// Frames the server pushes to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    JoinConfirmed {
        conversation_id: ConversationId,
    },
    LeaveConfirmed {
        conversation_id: ConversationId,
    },
    MessageReceived {
        message: MessagePayload,
    },
    MessageStatusChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    },
    ConversationUpdated {
        conversation: ConversationSummary,
    },
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        active: bool,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        error: ApiError,
    },
}

impl ServerEvent {
    /// Conversation the event is scoped to, if any.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::JoinConfirmed { conversation_id }
            | Self::LeaveConfirmed { conversation_id }
            | Self::MessageStatusChanged {
                conversation_id, ..
            }
            | Self::TypingChanged {
                conversation_id, ..
            } => Some(conversation_id),
            Self::MessageReceived { message } => Some(&message.conversation_id),
            Self::ConversationUpdated { conversation } => Some(&conversation.conversation_id),
            Self::Error {
                conversation_id, ..
            } => conversation_id.as_ref(),
        }
    }
}
