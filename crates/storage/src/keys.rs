//! Cache key namespaces.

use parley_events::ChatKind;

pub const USERS: &str = "users";
pub const GROUPS: &str = "groups";
pub const USER_PRESENCE: &str = "user_presence";

fn chat_prefix(kind: ChatKind) -> &'static str {
    match kind {
        ChatKind::Direct => "direct_chat",
        ChatKind::Group => "group_chat",
    }
}

pub fn group_members(group_id: &str) -> String {
    format!("group:{}:members", group_id)
}

pub fn group_admins(group_id: &str) -> String {
    format!("group:{}:admins", group_id)
}

pub fn chats_sorted(username: &str) -> String {
    format!("user:{}:chats_sorted", username)
}

/// Per-viewer history index; `chat` is the partner or the group id.
pub fn history(kind: ChatKind, owner: &str, chat: &str) -> String {
    format!("{}:owner:{}:{}:history", chat_prefix(kind), owner, chat)
}

pub fn unread(kind: ChatKind, owner: &str, chat: &str) -> String {
    format!("{}:owner:{}:{}:unread", chat_prefix(kind), owner, chat)
}

/// Flat CHE id → payload map.
pub fn history_entries(kind: ChatKind) -> &'static str {
    match kind {
        ChatKind::Direct => "direct_chat_history_entries",
        ChatKind::Group => "group_chat_history_entries",
    }
}

pub fn delivered_to_users(group_id: &str, message_id: &str) -> String {
    format!("group:{}:msg:{}:delivered_to_users", group_id, message_id)
}

pub fn read_by_users(group_id: &str, message_id: &str) -> String {
    format!("group:{}:msg:{}:read_by_users", group_id, message_id)
}

/// Everyone whose history received a group CHE, kept until it is retracted.
pub fn che_recipients(group_id: &str, che_id: &str) -> String {
    format!("group:{}:che:{}:recipients", group_id, che_id)
}

pub fn message_reactions(message_id: &str) -> String {
    format!("message:{}:reactions", message_id)
}

/// Hash with one field per terminal status reached.
pub fn message_status(message_id: &str) -> String {
    format!("message:{}:status", message_id)
}
