use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(TempId);

impl TempId {
    /// Fresh locally generated id for an optimistic outbound message.
    pub fn generate() -> Self {
        Self(format!("tmp-{}", Uuid::new_v4()))
    }
}

/// Opaque per-message key/value data carried through untouched.
pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Document,
    Location,
    Audio,
    Video,
    Sticker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Delivery lifecycle of a message.
///
/// `Sending -> Sent -> Delivered -> Read` only ever moves forward. `Failed`
/// is reachable from `Sending` alone and, like `Read`, is terminal for
/// status updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    fn rank(self) -> Option<u8> {
        match self {
            Self::Sending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            Self::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Read | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        match (self.rank(), next.rank()) {
            (None, _) => false,
            (Some(0), None) => true,
            (Some(_), None) => false,
            (Some(current), Some(next)) => next > current,
        }
    }

    /// Applies `next` if it moves forward; returns whether the status changed.
    pub fn advance(&mut self, next: DeliveryStatus) -> bool {
        if self.can_advance_to(next) {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Identity of a visible message: a local placeholder until the server
/// confirms it, then the server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum MessageRef {
    Pending(TempId),
    Confirmed(MessageId),
}

impl MessageRef {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending(id) => id.as_str(),
            Self::Confirmed(id) => id.as_str(),
        }
    }

    pub fn confirmed(&self) -> Option<&MessageId> {
        match self {
            Self::Confirmed(id) => Some(id),
            Self::Pending(_) => None,
        }
    }

    pub fn pending(&self) -> Option<&TempId> {
        match self {
            Self::Pending(id) => Some(id),
            Self::Confirmed(_) => None,
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MessageId> for MessageRef {
    fn from(value: MessageId) -> Self {
        Self::Confirmed(value)
    }
}

impl From<TempId> for MessageRef {
    fn from(value: TempId) -> Self {
        Self::Pending(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageRef,
    pub conversation_id: ConversationId,
    pub content: String,
    pub kind: MessageKind,
    pub direction: Direction,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub participants: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

impl Conversation {
    pub fn empty(id: ConversationId) -> Self {
        Self {
            id,
            title: String::new(),
            participants: Vec::new(),
            last_message: None,
            last_message_at: None,
            unread_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MembershipState {
    #[default]
    Idle,
    Joining,
    Joined,
    Leaving,
    Left,
}

impl MembershipState {
    pub fn is_quiescent(self) -> bool {
        matches!(self, Self::Idle | Self::Left)
    }
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
            Self::Left => "left",
        };
        f.write_str(name)
    }
}
