use crate::{DecodeError, FieldMap, Fields, StreamEvent, Topic, put, put_json};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub username: String,
    pub user_data: Value,
}

impl StreamEvent for NewUser {
    const TOPIC: Topic = Topic::NewUsers;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            username: fields.text("username")?,
            user_data: fields.object("user_data")?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "username", &self.username);
        put_json(&mut map, "user_data", &self.user_data);
        map
    }
}

/// Profile change; `user_data` carries the complete updated profile.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEdit {
    pub username: String,
    pub user_data: Value,
}

impl StreamEvent for UserEdit {
    const TOPIC: Topic = Topic::UserEdits;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            username: fields.text("username")?,
            user_data: fields.object("user_data")?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "username", &self.username);
        put_json(&mut map, "user_data", &self.user_data);
        map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserPresence {
    pub username: String,
    pub presence: String,
    pub last_seen: Option<i64>,
    /// Users with an open chat with `username`, resolved by the producer.
    pub partners: Vec<String>,
}

impl StreamEvent for UserPresence {
    const TOPIC: Topic = Topic::UserPresenceChanges;

    fn decode(fields: &Fields<'_>) -> Result<Self, DecodeError> {
        let presence = fields.text("presence")?;
        if presence != "online" && presence != "offline" {
            return Err(DecodeError::InvalidValue {
                field: "presence",
                reason: format!("unknown presence `{}`", presence),
            });
        }
        let last_seen = match fields.optional_text("last_seen") {
            Some(_) => Some(fields.millis("last_seen")?),
            None => None,
        };
        Ok(Self {
            username: fields.text("username")?,
            presence,
            last_seen,
            partners: fields.names("partners")?,
        })
    }

    fn encode(&self) -> FieldMap {
        let mut map = FieldMap::new();
        put(&mut map, "username", &self.username);
        put(&mut map, "presence", &self.presence);
        if let Some(last_seen) = self.last_seen {
            put(&mut map, "last_seen", last_seen.to_string());
        }
        put_json(&mut map, "partners", &self.partners);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn presence_requires_known_state() {
        let mut map = UserPresence {
            username: "alice".to_string(),
            presence: "online".to_string(),
            last_seen: None,
            partners: vec!["bob".to_string()],
        }
        .encode();
        assert!(UserPresence::from_map(&map).is_ok());
        map.insert("presence".to_string(), "away".to_string());
        assert!(matches!(
            UserPresence::from_map(&map),
            Err(DecodeError::InvalidValue { field: "presence", .. })
        ));
    }

    #[test]
    fn user_data_must_be_object() {
        let mut map = NewUser {
            username: "carol".to_string(),
            user_data: json!({"username": "carol"}),
        }
        .encode();
        assert_eq!(NewUser::from_map(&map).unwrap().user_data["username"], "carol");
        map.insert("user_data".to_string(), "[1,2]".to_string());
        assert!(NewUser::from_map(&map).is_err());
    }
}
