use crate::{DecodeError, FieldMap, Fields, StreamEvent, Topic, put, put_json};
use serde_json::Value;

fn distinct_users(a: &str, b: &str, field: &'static str) -> Result<(), DecodeError> {
    if a == b {
        return Err(DecodeError::InvalidValue {
            field,
            reason: "a direct chat needs two distinct users".to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDirectMessage {
    pub from_user: String,
    pub to_user: String,
    pub message_id: String,
    pub che_id: String,
    pub message: Value,
}

impl StreamEvent for NewDirectMessage {
    const TOPIC: Topic = Topic::NewDirectMessages;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let from_user = fields.text("from_user")?;
        let to_user = fields.text("to_user")?;
        distinct_users(&from_user, &to_user, "to_user")?;
        Ok(Self {
            from_user,
            to_user,
            message_id: fields.text("message_id")?,
            che_id: fields.text("che_id")?,
            message: fields.object("message")?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "from_user", &self.from_user);
        put(&mut map, "to_user", &self.to_user);
        put(&mut map, "message_id", &self.message_id);
        put(&mut map, "che_id", &self.che_id);
        put_json(&mut map, "message", &self.message);
        map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectMessageReaction {
    pub reactor: String,
    pub partner: String,
    pub message_id: String,
    pub che_id: String,
    pub emoji: String,
}

impl StreamEvent for DirectMessageReaction {
    const TOPIC: Topic = Topic::DirectMessageReactions;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let reactor = fields.text("reactor")?;
        let partner = fields.text("partner")?;
        distinct_users(&reactor, &partner, "partner")?;
        Ok(Self {
            reactor,
            partner,
            message_id: fields.text("message_id")?,
            che_id: fields.text("che_id")?,
            emoji: fields.text("emoji")?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "reactor", &self.reactor);
        put(&mut map, "partner", &self.partner);
        put(&mut map, "message_id", &self.message_id);
        put(&mut map, "che_id", &self.che_id);
        put(&mut map, "emoji", &self.emoji);
        map
    }
}

/// Retraction of a reaction; `che_id` names the reaction entry to drop.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectMessageReactionRemoved {
    pub reactor: String,
    pub partner: String,
    pub message_id: String,
    pub che_id: String,
}

impl StreamEvent for DirectMessageReactionRemoved {
    const TOPIC: Topic = Topic::DirectMessageReactionRemovals;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let reactor = fields.text("reactor")?;
        let partner = fields.text("partner")?;
        distinct_users(&reactor, &partner, "partner")?;
        Ok(Self {
            reactor,
            partner,
            message_id: fields.text("message_id")?,
            che_id: fields.text("che_id")?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "reactor", &self.reactor);
        put(&mut map, "partner", &self.partner);
        put(&mut map, "message_id", &self.message_id);
        put(&mut map, "che_id", &self.che_id);
        map
    }
}

/// `user` acknowledges delivery of messages sent by `partner`.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectMessagesDelivered {
    pub user: String,
    pub partner: String,
    pub message_ids: Vec<String>,
    pub delivered_at: i64,
}

impl StreamEvent for DirectMessagesDelivered {
    const TOPIC: Topic = Topic::DirectMessagesDelivered;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let user = fields.text("user")?;
        let partner = fields.text("partner")?;
        distinct_users(&user, &partner, "partner")?;
        let message_ids = fields.names("message_ids")?;
        if message_ids.is_empty() {
            return Err(DecodeError::EmptyField("message_ids"));
        }
        Ok(Self {
            user,
            partner,
            message_ids,
            delivered_at: fields.millis("delivered_at")?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "user", &self.user);
        put(&mut map, "partner", &self.partner);
        put_json(&mut map, "message_ids", &self.message_ids);
        put(&mut map, "delivered_at", self.delivered_at.to_string());
        map
    }
}

/// `user` read messages sent by `partner`; `che_ids` are the matching
/// history entries to clear from the unread index.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectMessagesRead {
    pub user: String,
    pub partner: String,
    pub message_ids: Vec<String>,
    pub che_ids: Vec<String>,
    pub read_at: i64,
}

impl StreamEvent for DirectMessagesRead {
    const TOPIC: Topic = Topic::DirectMessagesRead;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let user = fields.text("user")?;
        let partner = fields.text("partner")?;
        distinct_users(&user, &partner, "partner")?;
        let message_ids = fields.names("message_ids")?;
        if message_ids.is_empty() {
            return Err(DecodeError::EmptyField("message_ids"));
        }
        Ok(Self {
            user,
            partner,
            message_ids,
            che_ids: fields.names("che_ids")?,
            read_at: fields.millis("read_at")?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "user", &self.user);
        put(&mut map, "partner", &self.partner);
        put_json(&mut map, "message_ids", &self.message_ids);
        put_json(&mut map, "che_ids", &self.che_ids);
        put(&mut map, "read_at", self.read_at.to_string());
        map
    }
}
