//! Read-side projections over mirror rows. Nothing here touches the feed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{
    Conversation, ConversationId, Message, MessageType, Notification, NotificationKind,
};

/// `mm:ss`, or `h:mm:ss` from one hour on.
pub fn format_call_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

pub fn latest_message(messages: &[Message]) -> Option<&Message> {
    messages
        .iter()
        .max_by_key(|message| (message.created_at, message.id))
}

pub fn latest_message_per_conversation(
    messages: &[Message],
) -> HashMap<ConversationId, &Message> {
    let mut latest: HashMap<ConversationId, &Message> = HashMap::new();
    for message in messages {
        latest
            .entry(message.conversation_id)
            .and_modify(|current| {
                if (message.created_at, message.id) > (current.created_at, current.id) {
                    *current = message;
                }
            })
            .or_insert(message);
    }
    latest
}

pub fn unread_count(notifications: &[Notification]) -> usize {
    notifications.iter().filter(|n| !n.read).count()
}

pub fn unread_count_for_conversation(
    notifications: &[Notification],
    conversation_id: ConversationId,
) -> usize {
    notifications
        .iter()
        .filter(|n| !n.read && n.conversation_id == Some(conversation_id))
        .count()
}

pub fn notifications_of_kind(
    notifications: &[Notification],
    kind: NotificationKind,
) -> Vec<&Notification> {
    notifications.iter().filter(|n| n.kind == kind).collect()
}

/// Case-insensitive substring match on the display name; a blank query matches everything.
pub fn search_conversations<'a>(
    conversations: &'a [Conversation],
    query: &str,
) -> Vec<&'a Conversation> {
    let needle = query.trim().to_lowercase();
    conversations
        .iter()
        .filter(|conversation| {
            needle.is_empty()
                || conversation
                    .display_name()
                    .to_lowercase()
                    .contains(&needle)
        })
        .collect()
}

pub fn format_relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - at).num_minutes();
    if minutes < 1 {
        "now".to_string()
    } else if minutes < 60 {
        format!("{minutes}m ago")
    } else if minutes < 24 * 60 {
        format!("{}h ago", minutes / 60)
    } else {
        format!("{}d ago", minutes / (24 * 60))
    }
}

pub fn attachment_type_for_mime(mime: &str) -> MessageType {
    let mime = mime.trim().to_ascii_lowercase();
    if mime.starts_with("image/") {
        MessageType::Image
    } else if mime.starts_with("audio/") {
        MessageType::Voice
    } else {
        MessageType::File
    }
}

#[cfg(test)]
#[path = "tests/views_tests.rs"]
mod tests;
