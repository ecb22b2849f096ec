use super::{Decoded, Projection, ProjectionPlan, activity_scores, others};
use crate::app::convergence::ConvergenceCheck;
use crate::app::fanout::ClientEvent;
use parley_events::{
    ActivityRecord, ChatHistoryEntry, ChatIdent, ChatKind, GroupAdminsAdded, GroupEdit,
    GroupMemberLeft, GroupMemberRemoved, GroupMembersAdded, GroupMessageDelivered,
    GroupMessageReaction, GroupMessageReactionRemoved, GroupMessageRead, NewGroup,
    NewGroupMessage, StreamEntryId, score,
};
use parley_mirror::TerminalStatus;
use parley_storage::keys;
use serde_json::{Value, json};
use tracing::debug;

/// Stores `entry` once and indexes it for every recipient at `at`.
fn fan_out(
    plan: &mut ProjectionPlan,
    group_id: &str,
    recipients: &[String],
    entry: &ChatHistoryEntry,
    at: f64,
) {
    let che_id = entry.che_id();
    plan.set_field(keys::history_entries(ChatKind::Group), che_id, entry.encode());
    for recipient in recipients {
        plan.ordered_add(keys::history(ChatKind::Group, recipient, group_id), che_id, at);
        plan.ordered_raise(
            keys::chats_sorted(recipient),
            ChatIdent::group(group_id).to_string(),
            at,
        );
    }
}

/// Activity notices of one entry, ordered by their position in the entry.
fn record_activities(
    plan: &mut ProjectionPlan,
    id: &StreamEntryId,
    group_id: &str,
    recipients: &[String],
    activities: &[ActivityRecord],
) -> Vec<Value> {
    let scores = activity_scores(id, activities.len());
    let mut entries = Vec::with_capacity(activities.len());
    for (activity, at) in activities.iter().zip(scores) {
        let che = ChatHistoryEntry::Activity {
            che_id: activity.che_id.clone(),
            info: activity.info.clone(),
        };
        fan_out(plan, group_id, recipients, &che, at);
        entries.push(serde_json::to_value(&che).unwrap_or(Value::Null));
    }
    // roster changes surface the chat even without a notice
    if activities.is_empty() {
        for recipient in recipients {
            plan.ordered_raise(
                keys::chats_sorted(recipient),
                ChatIdent::group(group_id).to_string(),
                score(id),
            );
        }
    }
    entries
}

fn with(members: &[String], extra: &str) -> Vec<String> {
    let mut all = members.to_vec();
    if !all.iter().any(|member| member == extra) {
        all.push(extra.to_string());
    }
    all
}

pub struct NewGroups;

impl Projection for NewGroups {
    type Event = NewGroup;

    fn plan(&self, batch: &[Decoded<NewGroup>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let group = &entry.event;
            plan.set_field(keys::GROUPS, &group.group_id, group.group_data.to_string());
            plan.set_add(keys::group_members(&group.group_id), group.members.clone());
            plan.set_add(keys::group_admins(&group.group_id), group.admins.clone());
            let activities = record_activities(
                plan,
                &entry.id,
                &group.group_id,
                &group.members,
                &group.activities,
            );
            plan.notify(
                group.members.clone(),
                ClientEvent::new(
                    "new_group",
                    json!({
                        "group_id": group.group_id,
                        "creator": group.creator,
                        "group": group.group_data,
                        "members": group.members,
                        "admins": group.admins,
                        "activities": activities,
                    }),
                ),
            );
        }
    }
}

pub struct GroupEdits;

impl Projection for GroupEdits {
    type Event = GroupEdit;

    fn plan(&self, batch: &[Decoded<GroupEdit>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let edit = &entry.event;
            plan.set_field(keys::GROUPS, &edit.group_id, edit.group_data.to_string());
            let activities = record_activities(
                plan,
                &entry.id,
                &edit.group_id,
                &edit.members,
                &edit.activities,
            );
            plan.notify(
                edit.members.clone(),
                ClientEvent::new(
                    "group_edited",
                    json!({
                        "group_id": edit.group_id,
                        "editor": edit.editor,
                        "group": edit.group_data,
                        "activities": activities,
                    }),
                ),
            );
        }
    }
}

pub struct MembersAdded;

impl Projection for MembersAdded {
    type Event = GroupMembersAdded;

    fn plan(&self, batch: &[Decoded<GroupMembersAdded>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let change = &entry.event;
            plan.set_add(keys::group_members(&change.group_id), change.added.clone());
            let activities = record_activities(
                plan,
                &entry.id,
                &change.group_id,
                &change.members,
                &change.activities,
            );
            plan.notify(
                change.members.clone(),
                ClientEvent::new(
                    "group_members_added",
                    json!({
                        "group_id": change.group_id,
                        "admin": change.admin,
                        "added": change.added,
                        "activities": activities,
                    }),
                ),
            );
        }
    }
}

pub struct MemberRemovals;

impl Projection for MemberRemovals {
    type Event = GroupMemberRemoved;

    fn plan(&self, batch: &[Decoded<GroupMemberRemoved>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let change = &entry.event;
            let removed = vec![change.removed.clone()];
            plan.set_remove(keys::group_members(&change.group_id), removed.clone());
            plan.set_remove(keys::group_admins(&change.group_id), removed);
            // the removed user keeps the history up to and including the notice
            let recipients = with(&change.members, &change.removed);
            let activities = record_activities(
                plan,
                &entry.id,
                &change.group_id,
                &recipients,
                &change.activities,
            );
            plan.notify(
                recipients,
                ClientEvent::new(
                    "group_member_removed",
                    json!({
                        "group_id": change.group_id,
                        "admin": change.admin,
                        "removed": change.removed,
                        "activities": activities,
                    }),
                ),
            );
        }
    }
}

pub struct MembersLeft;

impl Projection for MembersLeft {
    type Event = GroupMemberLeft;

    fn plan(&self, batch: &[Decoded<GroupMemberLeft>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let change = &entry.event;
            let departed = vec![change.user.clone()];
            plan.set_remove(keys::group_members(&change.group_id), departed.clone());
            plan.set_remove(keys::group_admins(&change.group_id), departed);
            let activities = record_activities(
                plan,
                &entry.id,
                &change.group_id,
                &change.members,
                &change.activities,
            );
            plan.notify(
                with(&change.members, &change.user),
                ClientEvent::new(
                    "group_member_left",
                    json!({
                        "group_id": change.group_id,
                        "user": change.user,
                        "activities": activities,
                    }),
                ),
            );
        }
    }
}

pub struct AdminsAdded;

impl Projection for AdminsAdded {
    type Event = GroupAdminsAdded;

    fn plan(&self, batch: &[Decoded<GroupAdminsAdded>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let change = &entry.event;
            plan.set_add(keys::group_admins(&change.group_id), change.added.clone());
            let activities = record_activities(
                plan,
                &entry.id,
                &change.group_id,
                &change.members,
                &change.activities,
            );
            plan.notify(
                change.members.clone(),
                ClientEvent::new(
                    "group_admins_added",
                    json!({
                        "group_id": change.group_id,
                        "admin": change.admin,
                        "added": change.added,
                        "activities": activities,
                    }),
                ),
            );
        }
    }
}

pub struct NewGroupMessages;

impl Projection for NewGroupMessages {
    type Event = NewGroupMessage;

    fn plan(&self, batch: &[Decoded<NewGroupMessage>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let message = &entry.event;
            let che = ChatHistoryEntry::Message {
                che_id: message.che_id.clone(),
                message_id: message.message_id.clone(),
                sender: message.sender.clone(),
                message: message.message.clone(),
            };
            fan_out(plan, &message.group_id, &message.members, &che, score(&entry.id));
            let recipients = others(&message.members, &message.sender);
            for recipient in &recipients {
                plan.set_add(
                    keys::unread(ChatKind::Group, recipient, &message.group_id),
                    vec![message.che_id.clone()],
                );
            }
            plan.notify(
                recipients,
                ClientEvent::new(
                    "new_group_message",
                    json!({
                        "chat": ChatIdent::group(&message.group_id).to_string(),
                        "che": che,
                    }),
                ),
            );
        }
    }
}

pub struct GroupReactions;

impl Projection for GroupReactions {
    type Event = GroupMessageReaction;

    fn plan(&self, batch: &[Decoded<GroupMessageReaction>], plan: &mut ProjectionPlan) {
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
            fan_out(plan, &reaction.group_id, &reaction.members, &che, score(&entry.id));
            plan.set_add(
                keys::che_recipients(&reaction.group_id, &reaction.che_id),
                reaction.members.clone(),
            );
            plan.notify(
                others(&reaction.members, &reaction.reactor),
                ClientEvent::new(
                    "group_message_reaction",
                    json!({
                        "chat": ChatIdent::group(&reaction.group_id).to_string(),
                        "che": che,
                    }),
                ),
            );
        }
    }
}

pub struct GroupReactionRemovals;

impl Projection for GroupReactionRemovals {
    type Event = GroupMessageReactionRemoved;

    fn plan(&self, batch: &[Decoded<GroupMessageReactionRemoved>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let removal = &entry.event;
            plan.delete_field(keys::message_reactions(&removal.message_id), &removal.reactor);
            plan.delete_field(keys::history_entries(ChatKind::Group), &removal.che_id);
            for member in &removal.members {
                plan.ordered_remove(
                    keys::history(ChatKind::Group, member, &removal.group_id),
                    &removal.che_id,
                );
            }
            // members who left since the reaction are only known to the recipient set
            plan.retract(
                keys::che_recipients(&removal.group_id, &removal.che_id),
                ChatKind::Group,
                &removal.group_id,
                &removal.che_id,
            );
            plan.notify(
                others(&removal.members, &removal.reactor),
                ClientEvent::new(
                    "group_message_reaction_removed",
                    json!({
                        "chat": ChatIdent::group(&removal.group_id).to_string(),
                        "message_id": removal.message_id,
                        "che_id": removal.che_id,
                        "reactor": removal.reactor,
                    }),
                ),
            );
        }
    }
}

pub struct GroupMessagesDelivered;

impl Projection for GroupMessagesDelivered {
    type Event = GroupMessageDelivered;

    fn plan(&self, batch: &[Decoded<GroupMessageDelivered>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let ack = &entry.event;
            if ack.user == ack.sender {
                debug!(entry = %entry.id, message_id = %ack.message_id, "sender acknowledgement ignored");
                continue;
            }
            let progress = keys::delivered_to_users(&ack.group_id, &ack.message_id);
            plan.ordered_add(progress.clone(), &ack.user, ack.delivered_at as f64);
            plan.converge(
                progress,
                ConvergenceCheck {
                    group_id: ack.group_id.clone(),
                    message_id: ack.message_id.clone(),
                    status: TerminalStatus::Delivered,
                    at: ack.delivered_at,
                    entry_id: entry.id,
                    redelivered: entry.redelivered,
                },
            );
        }
    }
}

pub struct GroupMessagesRead;

impl Projection for GroupMessagesRead {
    type Event = GroupMessageRead;

    fn plan(&self, batch: &[Decoded<GroupMessageRead>], plan: &mut ProjectionPlan) {
        for entry in batch {
            let ack = &entry.event;
            if ack.user == ack.sender {
                debug!(entry = %entry.id, message_id = %ack.message_id, "sender acknowledgement ignored");
                continue;
            }
            let progress = keys::read_by_users(&ack.group_id, &ack.message_id);
            plan.ordered_add(progress.clone(), &ack.user, ack.read_at as f64);
            plan.set_remove(
                keys::unread(ChatKind::Group, &ack.user, &ack.group_id),
                vec![ack.che_id.clone()],
            );
            plan.converge(
                progress,
                ConvergenceCheck {
                    group_id: ack.group_id.clone(),
                    message_id: ack.message_id.clone(),
                    status: TerminalStatus::Read,
                    at: ack.read_at,
                    entry_id: entry.id,
                    redelivered: entry.redelivered,
                },
            );
        }
    }
}
