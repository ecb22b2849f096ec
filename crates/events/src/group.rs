use crate::ordering::check_fanout;
use crate::{DecodeError, FieldMap, Fields, StreamEvent, Topic, put, put_json, require_member};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Activity notice produced by a roster or group change, e.g. "alice added bob".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub che_id: String,
    pub info: Value,
}

fn activities(fields: &Fields<'_>) -> Result<Vec<ActivityRecord>, DecodeError> {
    let records: Vec<ActivityRecord> = fields.json("activities")?;
    check_fanout(records.len())?;
    if records.iter().any(|record| record.che_id.trim().is_empty()) {
        return Err(DecodeError::InvalidValue {
            field: "activities",
            reason: "activity without che_id".to_string(),
        });
    }
    Ok(records)
}

fn roster(fields: &Fields<'_>) -> Result<Vec<String>, DecodeError> {
    let members = fields.names("members")?;
    if members.is_empty() {
        return Err(DecodeError::EmptyField("members"));
    }
    Ok(members)
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewGroup {
    pub group_id: String,
    pub creator: String,
    pub group_data: Value,
    pub members: Vec<String>,
    pub admins: Vec<String>,
    pub activities: Vec<ActivityRecord>,
}

impl StreamEvent for NewGroup {
    const TOPIC: Topic = Topic::NewGroups;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let creator = fields.text("creator")?;
        let members = roster(fields)?;
        require_member(&members, &creator, "creator")?;
        let admins = fields.names("admins")?;
        for admin in admins.iter() {
            require_member(&members, admin, "admins")?;
        }
        Ok(Self {
            group_id: fields.text("group_id")?,
            creator,
            group_data: fields.object("group_data")?,
            members,
            admins,
            activities: activities(fields)?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "group_id", &self.group_id);
        put(&mut map, "creator", &self.creator);
        put_json(&mut map, "group_data", &self.group_data);
        put_json(&mut map, "members", &self.members);
        put_json(&mut map, "admins", &self.admins);
        put_json(&mut map, "activities", &self.activities);
        map
    }
}

/// Group info change; `group_data` carries the complete updated group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupEdit {
    pub group_id: String,
    pub editor: String,
    pub group_data: Value,
    pub members: Vec<String>,
    pub activities: Vec<ActivityRecord>,
}

impl StreamEvent for GroupEdit {
    const TOPIC: Topic = Topic::GroupEdits;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            group_id: fields.text("group_id")?,
            editor: fields.text("editor")?,
            group_data: fields.object("group_data")?,
            members: roster(fields)?,
            activities: activities(fields)?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "group_id", &self.group_id);
        put(&mut map, "editor", &self.editor);
        put_json(&mut map, "group_data", &self.group_data);
        put_json(&mut map, "members", &self.members);
        put_json(&mut map, "activities", &self.activities);
        map
    }
}

/// `members` is the roster after the change.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMembersAdded {
    pub group_id: String,
    pub admin: String,
    pub added: Vec<String>,
    pub members: Vec<String>,
    pub activities: Vec<ActivityRecord>,
}

impl StreamEvent for GroupMembersAdded {
    const TOPIC: Topic = Topic::GroupMembersAdded;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let members = roster(fields)?;
        let added = fields.names("added")?;
        if added.is_empty() {
            return Err(DecodeError::EmptyField("added"));
        }
        for user in added.iter() {
            require_member(&members, user, "added")?;
        }
        Ok(Self {
            group_id: fields.text("group_id")?,
            admin: fields.text("admin")?,
            added,
            members,
            activities: activities(fields)?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "group_id", &self.group_id);
        put(&mut map, "admin", &self.admin);
        put_json(&mut map, "added", &self.added);
        put_json(&mut map, "members", &self.members);
        put_json(&mut map, "activities", &self.activities);
        map
    }
}

/// `members` is the roster after `removed` left it.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMemberRemoved {
    pub group_id: String,
    pub admin: String,
    pub removed: String,
    pub members: Vec<String>,
    pub activities: Vec<ActivityRecord>,
}

impl StreamEvent for GroupMemberRemoved {
    const TOPIC: Topic = Topic::GroupMembersRemoved;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let removed = fields.text("removed")?;
        let members = fields.names("members")?;
        if members.iter().any(|member| member == &removed) {
            return Err(DecodeError::InvalidValue {
                field: "members",
                reason: format!("`{}` is still in the roster", removed),
            });
        }
        Ok(Self {
            group_id: fields.text("group_id")?,
            admin: fields.text("admin")?,
            removed,
            members,
            activities: activities(fields)?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "group_id", &self.group_id);
        put(&mut map, "admin", &self.admin);
        put(&mut map, "removed", &self.removed);
        put_json(&mut map, "members", &self.members);
        put_json(&mut map, "activities", &self.activities);
        map
    }
}

/// `members` is the roster after `user` left it.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMemberLeft {
    pub group_id: String,
    pub user: String,
    pub members: Vec<String>,
    pub activities: Vec<ActivityRecord>,
}

impl StreamEvent for GroupMemberLeft {
    const TOPIC: Topic = Topic::GroupMembersLeft;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let user = fields.text("user")?;
        let members = fields.names("members")?;
        if members.iter().any(|member| member == &user) {
            return Err(DecodeError::InvalidValue {
                field: "members",
                reason: format!("`{}` is still in the roster", user),
            });
        }
        Ok(Self {
            group_id: fields.text("group_id")?,
            user,
            members,
            activities: activities(fields)?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "group_id", &self.group_id);
        put(&mut map, "user", &self.user);
        put_json(&mut map, "members", &self.members);
        put_json(&mut map, "activities", &self.activities);
        map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupAdminsAdded {
    pub group_id: String,
    pub admin: String,
    pub added: Vec<String>,
    pub members: Vec<String>,
    pub activities: Vec<ActivityRecord>,
}

impl StreamEvent for GroupAdminsAdded {
    const TOPIC: Topic = Topic::GroupAdminsAdded;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let members = roster(fields)?;
        let added = fields.names("added")?;
        if added.is_empty() {
            return Err(DecodeError::EmptyField("added"));
        }
        for user in added.iter() {
            require_member(&members, user, "added")?;
        }
        Ok(Self {
            group_id: fields.text("group_id")?,
            admin: fields.text("admin")?,
            added,
            members,
            activities: activities(fields)?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "group_id", &self.group_id);
        put(&mut map, "admin", &self.admin);
        put_json(&mut map, "added", &self.added);
        put_json(&mut map, "members", &self.members);
        put_json(&mut map, "activities", &self.activities);
        map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewGroupMessage {
    pub group_id: String,
    pub sender: String,
    pub message_id: String,
    pub che_id: String,
    pub message: Value,
    pub members: Vec<String>,
}

impl StreamEvent for NewGroupMessage {
    const TOPIC: Topic = Topic::NewGroupMessages;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let sender = fields.text("sender")?;
        let members = roster(fields)?;
        require_member(&members, &sender, "sender")?;
        Ok(Self {
            group_id: fields.text("group_id")?,
            sender,
            message_id: fields.text("message_id")?,
            che_id: fields.text("che_id")?,
            message: fields.object("message")?,
            members,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "group_id", &self.group_id);
        put(&mut map, "sender", &self.sender);
        put(&mut map, "message_id", &self.message_id);
        put(&mut map, "che_id", &self.che_id);
        put_json(&mut map, "message", &self.message);
        put_json(&mut map, "members", &self.members);
        map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMessageReaction {
    pub group_id: String,
    pub reactor: String,
    pub message_id: String,
    pub che_id: String,
    pub emoji: String,
    pub members: Vec<String>,
}

impl StreamEvent for GroupMessageReaction {
    const TOPIC: Topic = Topic::GroupMessageReactions;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let reactor = fields.text("reactor")?;
        let members = roster(fields)?;
        require_member(&members, &reactor, "reactor")?;
        Ok(Self {
            group_id: fields.text("group_id")?,
            reactor,
            message_id: fields.text("message_id")?,
            che_id: fields.text("che_id")?,
            emoji: fields.text("emoji")?,
            members,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "group_id", &self.group_id);
        put(&mut map, "reactor", &self.reactor);
        put(&mut map, "message_id", &self.message_id);
        put(&mut map, "che_id", &self.che_id);
        put(&mut map, "emoji", &self.emoji);
        put_json(&mut map, "members", &self.members);
        map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMessageReactionRemoved {
    pub group_id: String,
    pub reactor: String,
    pub message_id: String,
    pub che_id: String,
    pub members: Vec<String>,
}

impl StreamEvent for GroupMessageReactionRemoved {
    const TOPIC: Topic = Topic::GroupMessageReactionRemovals;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            group_id: fields.text("group_id")?,
            reactor: fields.text("reactor")?,
            message_id: fields.text("message_id")?,
            che_id: fields.text("che_id")?,
            members: roster(fields)?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "group_id", &self.group_id);
        put(&mut map, "reactor", &self.reactor);
        put(&mut map, "message_id", &self.message_id);
        put(&mut map, "che_id", &self.che_id);
        put_json(&mut map, "members", &self.members);
        map
    }
}

/// `user` acknowledges delivery of `message_id`, sent by `sender`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMessageDelivered {
    pub group_id: String,
    pub user: String,
    pub message_id: String,
    pub sender: String,
    pub delivered_at: i64,
}

impl StreamEvent for GroupMessageDelivered {
    const TOPIC: Topic = Topic::GroupMessagesDelivered;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            group_id: fields.text("group_id")?,
            user: fields.text("user")?,
            message_id: fields.text("message_id")?,
            sender: fields.text("sender")?,
            delivered_at: fields.millis("delivered_at")?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "group_id", &self.group_id);
        put(&mut map, "user", &self.user);
        put(&mut map, "message_id", &self.message_id);
        put(&mut map, "sender", &self.sender);
        put(&mut map, "delivered_at", self.delivered_at.to_string());
        map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMessageRead {
    pub group_id: String,
    pub user: String,
    pub message_id: String,
    pub sender: String,
    pub che_id: String,
    pub read_at: i64,
}

impl StreamEvent for GroupMessageRead {
    const TOPIC: Topic = Topic::GroupMessagesRead;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            group_id: fields.text("group_id")?,
            user: fields.text("user")?,
            message_id: fields.text("message_id")?,
            sender: fields.text("sender")?,
            che_id: fields.text("che_id")?,
            read_at: fields.millis("read_at")?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "group_id", &self.group_id);
        put(&mut map, "user", &self.user);
        put(&mut map, "message_id", &self.message_id);
        put(&mut map, "sender", &self.sender);
        put(&mut map, "che_id", &self.che_id);
        put(&mut map, "read_at", self.read_at.to_string());
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_FANOUT;
    use serde_json::json;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn new_group(activity_count: usize) -> NewGroup {
        NewGroup {
            group_id: "g-1".to_string(),
            creator: "alice".to_string(),
            group_data: json!({"id": "g-1", "name": "climbers"}),
            members: names(&["alice", "bob", "carol"]),
            admins: names(&["alice"]),
            activities: (0..activity_count)
                .map(|index| ActivityRecord {
                    che_id: format!("che-{}", index),
                    info: json!({"type": "group_created"}),
                })
                .collect(),
        }
    }

    #[test]
    fn new_group_roundtrip() {
        let group = new_group(2);
        assert_eq!(NewGroup::from_map(&group.encode()).unwrap(), group);
    }

    #[test]
    fn activity_fanout_is_bounded() {
        let group = new_group(MAX_FANOUT + 1);
        assert!(matches!(
            NewGroup::from_map(&group.encode()),
            Err(DecodeError::Fanout(_))
        ));
    }

    #[test]
    fn admins_must_be_members() {
        let mut group = new_group(1);
        group.admins.push("mallory".to_string());
        assert!(matches!(
            NewGroup::from_map(&group.encode()),
            Err(DecodeError::InvalidValue { field: "admins", .. })
        ));
    }

    #[test]
    fn removed_member_must_leave_roster() {
        let event = GroupMemberRemoved {
            group_id: "g-1".to_string(),
            admin: "alice".to_string(),
            removed: "bob".to_string(),
            members: names(&["alice", "bob"]),
            activities: vec![],
        };
        assert!(GroupMemberRemoved::from_map(&event.encode()).is_err());
    }

    #[test]
    fn message_sender_must_be_member() {
        let event = NewGroupMessage {
            group_id: "g-1".to_string(),
            sender: "mallory".to_string(),
            message_id: "m-1".to_string(),
            che_id: "che-1".to_string(),
            message: json!({"id": "m-1"}),
            members: names(&["alice", "bob"]),
        };
        assert!(matches!(
            NewGroupMessage::from_map(&event.encode()),
            Err(DecodeError::InvalidValue { field: "sender", .. })
        ));
    }
}
