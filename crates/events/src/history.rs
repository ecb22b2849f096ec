use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};

/// Which family of chat a history entry or index belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Direct,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Direct => "direct",
            ChatKind::Group => "group",
        }
    }
}

/// Member stored in a user's chat list: the partner for direct chats, the
/// group id for group chats.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatIdent {
    pub kind: ChatKind,
    pub id: String,
}

impl ChatIdent {
    pub fn direct(partner: impl Into<String>) -> Self {
        Self {
            kind: ChatKind::Direct,
            id: partner.into(),
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            kind: ChatKind::Group,
            id: group_id.into(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (kind, id) = value.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match kind {
            "direct" => Some(Self::direct(id)),
            "group" => Some(Self::group(id)),
            _ => None,
        }
    }
}

impl Display for ChatIdent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// One atomic unit of chat history as stored in the flat entry map.
///
/// Payload fields are kept verbatim from the producing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "che_type", rename_all = "snake_case")]
pub enum ChatHistoryEntry {
    Message {
        che_id: String,
        message_id: String,
        sender: String,
        message: Value,
    },
    Reaction {
        che_id: String,
        message_id: String,
        reactor: String,
        emoji: String,
    },
    Activity {
        che_id: String,
        info: Value,
    },
}

impl ChatHistoryEntry {
    pub fn che_id(&self) -> &str {
        match self {
            ChatHistoryEntry::Message { che_id, .. }
            | ChatHistoryEntry::Reaction { che_id, .. }
            | ChatHistoryEntry::Activity { che_id, .. } => che_id,
        }
    }

    pub fn encode(&self) -> String {
        // every variant is a plain tree of strings and json values
        serde_json::to_string(self).unwrap_or_default()
    }
}
