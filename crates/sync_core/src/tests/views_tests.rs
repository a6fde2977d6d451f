use super::*;

use chrono::{Duration, TimeZone};
use shared::domain::{ConversationKind, MessageId, NotificationId, UserId};

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0)
        .single()
        .expect("valid time")
}

fn message(id: i64, conversation: i64, minute: u32) -> Message {
    Message {
        id: MessageId(id),
        conversation_id: ConversationId(conversation),
        sender_id: UserId(1),
        content: format!("m{id}"),
        message_type: MessageType::Text,
        attachment_url: None,
        created_at: at(minute),
    }
}

fn notification(id: i64, kind: NotificationKind, conversation: Option<i64>, read: bool) -> Notification {
    Notification {
        id: NotificationId(id),
        user_id: UserId(1),
        conversation_id: conversation.map(ConversationId),
        kind,
        title: "t".to_string(),
        body: None,
        read,
        created_at: at(0),
    }
}

fn conversation(id: i64, name: Option<&str>) -> Conversation {
    Conversation {
        id: ConversationId(id),
        name: name.map(str::to_string),
        kind: ConversationKind::Group,
        created_at: at(0),
        updated_at: at(0),
    }
}

#[test]
fn formats_durations_below_and_above_an_hour() {
    assert_eq!(format_call_duration(0), "00:00");
    assert_eq!(format_call_duration(65), "01:05");
    assert_eq!(format_call_duration(3599), "59:59");
    assert_eq!(format_call_duration(3600), "1:00:00");
    assert_eq!(format_call_duration(3 * 3600 + 7 * 60 + 9), "3:07:09");
}

#[test]
fn latest_message_breaks_timestamp_ties_by_id() {
    let messages = vec![message(1, 1, 0), message(3, 1, 5), message(2, 1, 5)];
    assert_eq!(latest_message(&messages).map(|m| m.id), Some(MessageId(3)));
    assert!(latest_message(&[]).is_none());
}

#[test]
fn latest_message_is_tracked_per_conversation() {
    let messages = vec![message(1, 1, 0), message(2, 2, 1), message(3, 1, 2)];
    let latest = latest_message_per_conversation(&messages);
    assert_eq!(latest[&ConversationId(1)].id, MessageId(3));
    assert_eq!(latest[&ConversationId(2)].id, MessageId(2));
}

#[test]
fn counts_unread_notifications() {
    let notifications = vec![
        notification(1, NotificationKind::Message, Some(1), false),
        notification(2, NotificationKind::Call, Some(1), true),
        notification(3, NotificationKind::GroupInvite, Some(2), false),
        notification(4, NotificationKind::Message, None, false),
    ];
    assert_eq!(unread_count(&notifications), 3);
    assert_eq!(
        unread_count_for_conversation(&notifications, ConversationId(1)),
        1
    );
    assert_eq!(
        notifications_of_kind(&notifications, NotificationKind::Message).len(),
        2
    );
}

#[test]
fn search_matches_display_name_case_insensitively() {
    let conversations = vec![
        conversation(1, Some("Design Review")),
        conversation(2, None),
        conversation(3, Some("ops")),
    ];
    let ids = |query: &str| {
        search_conversations(&conversations, query)
            .into_iter()
            .map(|c| c.id.0)
            .collect::<Vec<_>>()
    };
    assert_eq!(ids("design"), vec![1]);
    assert_eq!(ids("direct"), vec![2]);
    assert_eq!(ids("  "), vec![1, 2, 3]);
    assert!(ids("finance").is_empty());
}

#[test]
fn relative_time_labels() {
    let now = at(30);
    assert_eq!(format_relative_time(now, now), "now");
    assert_eq!(format_relative_time(now + Duration::minutes(5), now), "now");
    assert_eq!(format_relative_time(now - Duration::minutes(5), now), "5m ago");
    assert_eq!(format_relative_time(now - Duration::hours(3), now), "3h ago");
    assert_eq!(format_relative_time(now - Duration::days(2), now), "2d ago");
}

#[test]
fn classifies_attachment_mime_types() {
    assert_eq!(attachment_type_for_mime("image/png"), MessageType::Image);
    assert_eq!(attachment_type_for_mime("Audio/webm"), MessageType::Voice);
    assert_eq!(attachment_type_for_mime("application/pdf"), MessageType::File);
}
