use super::{Decoded, Projection, ProjectionPlan};
use crate::app::fanout::ClientEvent;
use parley_events::{
    ChatHistoryEntry, ChatIdent, ChatKind, DirectMessageReaction, DirectMessageReactionRemoved,
    DirectMessagesDelivered, DirectMessagesRead, NewDirectMessage, score,
};
use parley_mirror::{MirrorRecord, TerminalStatus};
use parley_storage::keys;
use serde_json::json;

/// Puts `entry` into both participants' histories and bumps the chat in
/// both chat lists.
fn share(plan: &mut ProjectionPlan, first: &str, second: &str, entry: &ChatHistoryEntry, at: f64) {
    let che_id = entry.che_id();
    plan.set_field(keys::history_entries(ChatKind::Direct), che_id, entry.encode());
    for (owner, partner) in [(first, second), (second, first)] {
        plan.ordered_add(keys::history(ChatKind::Direct, owner, partner), che_id, at);
        plan.ordered_raise(
            keys::chats_sorted(owner),
            ChatIdent::direct(partner).to_string(),
            at,
        );
    }
}

pub struct NewDirectMessages;

impl Projection for NewDirectMessages {
    type Event = NewDirectMessage;

    fn plan(&self, batch: &[Decoded<NewDirectMessage>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let message = &entry.event;
            let che = ChatHistoryEntry::Message {
                che_id: message.che_id.clone(),
                message_id: message.message_id.clone(),
                sender: message.from_user.clone(),
                message: message.message.clone(),
            };
            share(plan, &message.from_user, &message.to_user, &che, score(&entry.id));
            plan.set_add(
                keys::unread(ChatKind::Direct, &message.to_user, &message.from_user),
                vec![message.che_id.clone()],
            );
            plan.notify(
                vec![message.to_user.clone()],
                ClientEvent::new(
                    "new_direct_message",
                    json!({
                        "chat": ChatIdent::direct(&message.from_user).to_string(),
                        "che": che,
                    }),
                ),
            );
        }
    }
}

pub struct DirectReactions;

impl Projection for DirectReactions {
    type Event = DirectMessageReaction;

    fn plan(&self, batch: &[Decoded<DirectMessageReaction>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let reaction = &entry.event;
            plan.set_field(
                keys::message_reactions(&reaction.message_id),
                &reaction.reactor,
                reaction.emoji.clone(),
            );
            let che = ChatHistoryEntry::Reaction {
                che_id: reaction.che_id.clone(),
                message_id: reaction.message_id.clone(),
                reactor: reaction.reactor.clone(),
                emoji: reaction.emoji.clone(),
            };
            share(plan, &reaction.reactor, &reaction.partner, &che, score(&entry.id));
            plan.notify(
                vec![reaction.partner.clone()],
                ClientEvent::new(
                    "direct_message_reaction",
                    json!({
                        "chat": ChatIdent::direct(&reaction.reactor).to_string(),
                        "che": che,
                    }),
                ),
            );
        }
    }
}

pub struct DirectReactionRemovals;

impl Projection for DirectReactionRemovals {
    type Event = DirectMessageReactionRemoved;

    fn plan(&self, batch: &[Decoded<DirectMessageReactionRemoved>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let removal = &entry.event;
            plan.delete_field(keys::message_reactions(&removal.message_id), &removal.reactor);
            plan.delete_field(keys::history_entries(ChatKind::Direct), &removal.che_id);
            for (owner, partner) in [
                (&removal.reactor, &removal.partner),
                (&removal.partner, &removal.reactor),
            ] {
                plan.ordered_remove(
                    keys::history(ChatKind::Direct, owner, partner),
                    &removal.che_id,
                );
            }
            plan.notify(
                vec![removal.partner.clone()],
                ClientEvent::new(
                    "direct_message_reaction_removed",
                    json!({
                        "chat": ChatIdent::direct(&removal.reactor).to_string(),
                        "message_id": removal.message_id,
                        "che_id": removal.che_id,
                        "reactor": removal.reactor,
                    }),
                ),
            );
        }
    }
}

pub struct DirectDeliveries;

impl Projection for DirectDeliveries {
    type Event = DirectMessagesDelivered;

    fn plan(&self, batch: &[Decoded<DirectMessagesDelivered>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let ack = &entry.event;
            for message_id in &ack.message_ids {
                plan.set_field(
                    keys::message_status(message_id),
                    TerminalStatus::Delivered.as_str(),
                    ack.delivered_at.to_string(),
                );
                plan.mirror(MirrorRecord {
                    message_id: message_id.clone(),
                    status: TerminalStatus::Delivered,
                    status_at: ack.delivered_at,
                    entry_id: entry.id,
                });
            }
            plan.notify(
                vec![ack.partner.clone()],
                ClientEvent::new(
                    "direct_messages_delivered",
                    json!({
                        "chat": ChatIdent::direct(&ack.user).to_string(),
                        "message_ids": ack.message_ids,
                        "at": ack.delivered_at,
                    }),
                ),
            );
        }
    }
}

pub struct DirectReads;

impl Projection for DirectReads {
    type Event = DirectMessagesRead;

    fn plan(&self, batch: &[Decoded<DirectMessagesRead>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let ack = &entry.event;
            for message_id in &ack.message_ids {
                plan.set_field(
                    keys::message_status(message_id),
                    TerminalStatus::Read.as_str(),
                    ack.read_at.to_string(),
                );
                plan.mirror(MirrorRecord {
                    message_id: message_id.clone(),
                    status: TerminalStatus::Read,
                    status_at: ack.read_at,
                    entry_id: entry.id,
                });
            }
            plan.set_remove(
                keys::unread(ChatKind::Direct, &ack.user, &ack.partner),
                ack.che_ids.clone(),
            );
            plan.notify(
                vec![ack.partner.clone()],
                ClientEvent::new(
                    "direct_messages_read",
                    json!({
                        "chat": ChatIdent::direct(&ack.user).to_string(),
                        "message_ids": ack.message_ids,
                        "at": ack.read_at,
                    }),
                ),
            );
        }
    }
}
