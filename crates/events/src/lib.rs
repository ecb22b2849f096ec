//! Typed event schema for the projection streams.
//!
//! Producers append flat string field maps; structured fields travel as JSON
//! strings. Every kind decodes through [`StreamEvent::decode`] so that a
//! malformed entry becomes a [`DecodeError`] instead of a crash.

pub mod direct;
pub mod group;
pub mod history;
pub mod id;
pub mod ordering;
pub mod user;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub use direct::{
    DirectMessageReaction, DirectMessageReactionRemoved, DirectMessagesDelivered,
    DirectMessagesRead, NewDirectMessage,
};
pub use group::{
    ActivityRecord, GroupAdminsAdded, GroupEdit, GroupMemberLeft, GroupMemberRemoved,
    GroupMembersAdded, GroupMessageDelivered, GroupMessageReaction, GroupMessageReactionRemoved,
    GroupMessageRead, NewGroup, NewGroupMessage,
};
pub use history::{ChatHistoryEntry, ChatIdent, ChatKind};
pub use id::{InvalidEntryId, StreamEntryId};
pub use ordering::{MAX_FANOUT, OrderingError, score, sub_score};
pub use user::{NewUser, UserEdit, UserPresence};

/// Raw field map as carried by a stream entry.
pub type FieldMap = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` is empty")]
    EmptyField(&'static str),
    #[error("field `{field}` is not valid json: {reason}")]
    InvalidJson { field: &'static str, reason: String },
    #[error("field `{field}` is invalid: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("unknown topic `{0}`")]
    UnknownTopic(String),
    #[error(transparent)]
    Fanout(#[from] OrderingError),
}

/// Stream topics, one per event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    NewUsers,
    UserEdits,
    UserPresenceChanges,
    NewDirectMessages,
    DirectMessageReactions,
    DirectMessageReactionRemovals,
    DirectMessagesDelivered,
    DirectMessagesRead,
    NewGroups,
    GroupEdits,
    GroupMembersAdded,
    GroupMembersRemoved,
    GroupMembersLeft,
    GroupAdminsAdded,
    NewGroupMessages,
    GroupMessageReactions,
    GroupMessageReactionRemovals,
    GroupMessagesDelivered,
    GroupMessagesRead,
}

impl Topic {
    pub const ALL: [Topic; 19] = [
        Topic::NewUsers,
        Topic::UserEdits,
        Topic::UserPresenceChanges,
        Topic::NewDirectMessages,
        Topic::DirectMessageReactions,
        Topic::DirectMessageReactionRemovals,
        Topic::DirectMessagesDelivered,
        Topic::DirectMessagesRead,
        Topic::NewGroups,
        Topic::GroupEdits,
        Topic::GroupMembersAdded,
        Topic::GroupMembersRemoved,
        Topic::GroupMembersLeft,
        Topic::GroupAdminsAdded,
        Topic::NewGroupMessages,
        Topic::GroupMessageReactions,
        Topic::GroupMessageReactionRemovals,
        Topic::GroupMessagesDelivered,
        Topic::GroupMessagesRead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::NewUsers => "new_users",
            Topic::UserEdits => "user_edits",
            Topic::UserPresenceChanges => "user_presence_changes",
            Topic::NewDirectMessages => "new_direct_messages",
            Topic::DirectMessageReactions => "direct_message_reactions",
            Topic::DirectMessageReactionRemovals => "direct_message_reaction_removals",
            Topic::DirectMessagesDelivered => "direct_messages_delivered",
            Topic::DirectMessagesRead => "direct_messages_read",
            Topic::NewGroups => "new_groups",
            Topic::GroupEdits => "group_edits",
            Topic::GroupMembersAdded => "group_members_added",
            Topic::GroupMembersRemoved => "group_members_removed",
            Topic::GroupMembersLeft => "group_members_left",
            Topic::GroupAdminsAdded => "group_admins_added",
            Topic::NewGroupMessages => "new_group_messages",
            Topic::GroupMessageReactions => "group_message_reactions",
            Topic::GroupMessageReactionRemovals => "group_message_reaction_removals",
            Topic::GroupMessagesDelivered => "group_messages_delivered",
            Topic::GroupMessagesRead => "group_messages_read",
        }
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .iter()
            .copied()
            .find(|topic| topic.as_str() == value)
            .ok_or_else(|| DecodeError::UnknownTopic(value.to_string()))
    }
}

/// An event kind that travels on its own stream.
pub trait StreamEvent: Sized + Send + Sync + 'static {
    const TOPIC: Topic;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError>;

    fn encode(&self) -> FieldMap;

    fn from_map(map: &FieldMap) -> Result<Self, DecodeError> {
        Self::decode(&Fields::new(map))
    }
}

/// Checked accessor over a raw field map.
pub struct Fields<'a> {
    map: &'a FieldMap,
}

impl<'a> Fields<'a> {
    pub fn new(map: &'a FieldMap) -> Self {
        Self { map }
    }

    /// Required, non-empty text field.
    pub fn text(&self, name: &'static str) -> Result<String, DecodeError> {
        let value = self.map.get(name).ok_or(DecodeError::MissingField(name))?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DecodeError::EmptyField(name));
        }
        Ok(trimmed.to_string())
    }

    pub fn optional_text(&self, name: &'static str) -> Option<String> {
        self.map
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
    }

    pub fn json<T: DeserializeOwned>(&self, name: &'static str) -> Result<T, DecodeError> {
        let raw = self.map.get(name).ok_or(DecodeError::MissingField(name))?;
        serde_json::from_str(raw).map_err(|err| DecodeError::InvalidJson {
            field: name,
            reason: err.to_string(),
        })
    }

    /// JSON object field cached verbatim.
    pub fn object(&self, name: &'static str) -> Result<Value, DecodeError> {
        let value: Value = self.json(name)?;
        if !value.is_object() {
            return Err(DecodeError::InvalidValue {
                field: name,
                reason: "expected a json object".to_string(),
            });
        }
        Ok(value)
    }

    /// JSON array of non-empty, distinct usernames or ids.
    pub fn names(&self, name: &'static str) -> Result<Vec<String>, DecodeError> {
        let values: Vec<String> = self.json(name)?;
        let mut seen = Vec::with_capacity(values.len());
        for value in values {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(DecodeError::InvalidValue {
                    field: name,
                    reason: "contains an empty entry".to_string(),
                });
            }
            if !seen.iter().any(|existing: &String| existing == trimmed) {
                seen.push(trimmed.to_string());
            }
        }
        Ok(seen)
    }

    /// Unix timestamp in milliseconds.
    pub fn millis(&self, name: &'static str) -> Result<i64, DecodeError> {
        let raw = self.text(name)?;
        let value = raw.parse::<i64>().map_err(|_| DecodeError::InvalidValue {
            field: name,
            reason: format!("`{}` is not an integer", raw),
        })?;
        if value < 0 {
            return Err(DecodeError::InvalidValue {
                field: name,
                reason: "negative timestamp".to_string(),
            });
        }
        Ok(value)
    }
}

pub(crate) fn put(map: &mut FieldMap, name: &str, value: impl Into<String>) {
    map.insert(name.to_string(), value.into());
}

pub(crate) fn put_json<T: Serialize>(map: &mut FieldMap, name: &str, value: &T) {
    map.insert(
        name.to_string(),
        serde_json::to_string(value).unwrap_or_default(),
    );
}

pub(crate) fn require_member(
    members: &[String],
    user: &str,
    field: &'static str,
) -> Result<(), DecodeError> {
    if members.iter().any(|member| member == user) {
        Ok(())
    } else {
        Err(DecodeError::InvalidValue {
            field,
            reason: format!("`{}` is not in the roster", user),
        })
    }
}

/// Any decoded event, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NewUser(NewUser),
    UserEdit(UserEdit),
    UserPresence(UserPresence),
    NewDirectMessage(NewDirectMessage),
    DirectMessageReaction(DirectMessageReaction),
    DirectMessageReactionRemoved(DirectMessageReactionRemoved),
    DirectMessagesDelivered(DirectMessagesDelivered),
    DirectMessagesRead(DirectMessagesRead),
    NewGroup(NewGroup),
    GroupEdit(GroupEdit),
    GroupMembersAdded(GroupMembersAdded),
    GroupMemberRemoved(GroupMemberRemoved),
    GroupMemberLeft(GroupMemberLeft),
    GroupAdminsAdded(GroupAdminsAdded),
    NewGroupMessage(NewGroupMessage),
    GroupMessageReaction(GroupMessageReaction),
    GroupMessageReactionRemoved(GroupMessageReactionRemoved),
    GroupMessageDelivered(GroupMessageDelivered),
    GroupMessageRead(GroupMessageRead),
}

impl Event {
    /// Decodes a field map read from `topic`.
    pub fn decode(topic: Topic, map: &FieldMap) -> Result<Event, DecodeError> {
        let event = match topic {
            Topic::NewUsers => Event::NewUser(NewUser::from_map(map)?),
            Topic::UserEdits => Event::UserEdit(UserEdit::from_map(map)?),
            Topic::UserPresenceChanges => Event::UserPresence(UserPresence::from_map(map)?),
            Topic::NewDirectMessages => Event::NewDirectMessage(NewDirectMessage::from_map(map)?),
            Topic::DirectMessageReactions => {
                Event::DirectMessageReaction(DirectMessageReaction::from_map(map)?)
            }
            Topic::DirectMessageReactionRemovals => {
                Event::DirectMessageReactionRemoved(DirectMessageReactionRemoved::from_map(map)?)
            }
            Topic::DirectMessagesDelivered => {
                Event::DirectMessagesDelivered(DirectMessagesDelivered::from_map(map)?)
            }
            Topic::DirectMessagesRead => {
                Event::DirectMessagesRead(DirectMessagesRead::from_map(map)?)
            }
            Topic::NewGroups => Event::NewGroup(NewGroup::from_map(map)?),
            Topic::GroupEdits => Event::GroupEdit(GroupEdit::from_map(map)?),
            Topic::GroupMembersAdded => {
                Event::GroupMembersAdded(GroupMembersAdded::from_map(map)?)
            }
            Topic::GroupMembersRemoved => {
                Event::GroupMemberRemoved(GroupMemberRemoved::from_map(map)?)
            }
            Topic::GroupMembersLeft => Event::GroupMemberLeft(GroupMemberLeft::from_map(map)?),
            Topic::GroupAdminsAdded => Event::GroupAdminsAdded(GroupAdminsAdded::from_map(map)?),
            Topic::NewGroupMessages => Event::NewGroupMessage(NewGroupMessage::from_map(map)?),
            Topic::GroupMessageReactions => {
                Event::GroupMessageReaction(GroupMessageReaction::from_map(map)?)
            }
            Topic::GroupMessageReactionRemovals => {
                Event::GroupMessageReactionRemoved(GroupMessageReactionRemoved::from_map(map)?)
            }
            Topic::GroupMessagesDelivered => {
                Event::GroupMessageDelivered(GroupMessageDelivered::from_map(map)?)
            }
            Topic::GroupMessagesRead => Event::GroupMessageRead(GroupMessageRead::from_map(map)?),
        };
        Ok(event)
    }

    pub fn topic(&self) -> Topic {
        match self {
            Event::NewUser(_) => NewUser::TOPIC,
            Event::UserEdit(_) => UserEdit::TOPIC,
            Event::UserPresence(_) => UserPresence::TOPIC,
            Event::NewDirectMessage(_) => NewDirectMessage::TOPIC,
            Event::DirectMessageReaction(_) => DirectMessageReaction::TOPIC,
            Event::DirectMessageReactionRemoved(_) => DirectMessageReactionRemoved::TOPIC,
            Event::DirectMessagesDelivered(_) => DirectMessagesDelivered::TOPIC,
            Event::DirectMessagesRead(_) => DirectMessagesRead::TOPIC,
            Event::NewGroup(_) => NewGroup::TOPIC,
            Event::GroupEdit(_) => GroupEdit::TOPIC,
            Event::GroupMembersAdded(_) => GroupMembersAdded::TOPIC,
            Event::GroupMemberRemoved(_) => GroupMemberRemoved::TOPIC,
            Event::GroupMemberLeft(_) => GroupMemberLeft::TOPIC,
            Event::GroupAdminsAdded(_) => GroupAdminsAdded::TOPIC,
            Event::NewGroupMessage(_) => NewGroupMessage::TOPIC,
            Event::GroupMessageReaction(_) => GroupMessageReaction::TOPIC,
            Event::GroupMessageReactionRemoved(_) => GroupMessageReactionRemoved::TOPIC,
            Event::GroupMessageDelivered(_) => GroupMessageDelivered::TOPIC,
            Event::GroupMessageRead(_) => GroupMessageRead::TOPIC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn topic_names_are_unique_and_parse() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
        let mut names = Topic::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Topic::ALL.len());
        assert!("chat_messages".parse::<Topic>().is_err());
    }

    #[test]
    fn fields_report_structured_errors() {
        let raw = map(&[
            ("empty", "  "),
            ("broken", "{not json"),
            ("list", "[\"a\", \"b\", \"a\"]"),
            ("bad_list", "[\"a\", \"\"]"),
            ("at", "-5"),
        ]);
        let fields = Fields::new(&raw);
        assert_eq!(fields.text("missing"), Err(DecodeError::MissingField("missing")));
        assert_eq!(fields.text("empty"), Err(DecodeError::EmptyField("empty")));
        assert!(matches!(
            fields.object("broken"),
            Err(DecodeError::InvalidJson { field: "broken", .. })
        ));
        assert_eq!(fields.names("list").unwrap(), vec!["a", "b"]);
        assert!(fields.names("bad_list").is_err());
        assert!(fields.millis("at").is_err());
        assert_eq!(fields.optional_text("empty"), None);
    }

    #[test]
    fn event_decode_dispatches_by_topic() {
        let raw = map(&[
            ("username", "alice"),
            ("user_data", "{\"username\":\"alice\",\"bio\":\"hi\"}"),
        ]);
        let event = Event::decode(Topic::UserEdits, &raw).unwrap();
        assert_eq!(event.topic(), Topic::UserEdits);
        assert!(matches!(event, Event::UserEdit(ref edit) if edit.username == "alice"));
        assert!(Event::decode(Topic::NewDirectMessages, &raw).is_err());
    }
}
