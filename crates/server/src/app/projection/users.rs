use super::{Decoded, Projection, ProjectionPlan};
use crate::app::presence::PresenceUpdate;
use parley_events::{NewUser, UserEdit, UserPresence};
use parley_storage::keys;
use serde_json::json;

pub struct NewUsers;

impl Projection for NewUsers {
    type Event = NewUser;

    fn plan(&self, batch: &[Decoded<NewUser>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let user = &entry.event;
            plan.set_field(keys::USERS, &user.username, user.user_data.to_string());
        }
    }
}

pub struct UserEdits;

impl Projection for UserEdits {
    type Event = UserEdit;

    fn plan(&self, batch: &[Decoded<UserEdit>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let user = &entry.event;
            plan.set_field(keys::USERS, &user.username, user.user_data.to_string());
        }
    }
}

pub struct PresenceChanges;

impl Projection for PresenceChanges {
    type Event = UserPresence;

    fn plan(&self, batch: &[Decoded<UserPresence>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let change = &entry.event;
            let cached = json!({
                "presence": change.presence,
                "last_seen": change.last_seen,
            });
            plan.set_field(keys::USER_PRESENCE, &change.username, cached.to_string());
            let update = PresenceUpdate {
                username: change.username.clone(),
                presence: change.presence.clone(),
                last_seen: change.last_seen,
                partners: change.partners.clone(),
            };
            if let Ok(payload) = serde_json::to_string(&update) {
                plan.publish_presence(payload);
            }
        }
    }
}
