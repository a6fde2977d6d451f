use std::{cmp::Ordering, fmt, hash::Hash};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Call, CallId, CallStatus, CallType, Conversation, ConversationId, ConversationKind,
        Message, MessageId, MessageType, Notification, NotificationId, NotificationKind, UserId,
    },
    error::StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Conversation,
    Message,
    Notification,
    Call,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Conversation => "conversation",
            EntityType::Message => "message",
            EntityType::Notification => "notification",
            EntityType::Call => "call",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Filter {
    /// Conversations the user is a member of.
    MemberOf(UserId),
    /// Rows belonging to one conversation.
    Conversation(ConversationId),
    /// Rows addressed to one user.
    Recipient(UserId),
}

/// One subscription's domain: an entity type plus a row filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub entity: EntityType,
    pub filter: Filter,
}

impl Scope {
    pub fn conversations_of(user_id: UserId) -> Self {
        Self {
            entity: EntityType::Conversation,
            filter: Filter::MemberOf(user_id),
        }
    }

    pub fn messages_in(conversation_id: ConversationId) -> Self {
        Self {
            entity: EntityType::Message,
            filter: Filter::Conversation(conversation_id),
        }
    }

    pub fn calls_in(conversation_id: ConversationId) -> Self {
        Self {
            entity: EntityType::Call,
            filter: Filter::Conversation(conversation_id),
        }
    }

    pub fn notifications_for(user_id: UserId) -> Self {
        Self {
            entity: EntityType::Notification,
            filter: Filter::Recipient(user_id),
        }
    }

    /// Membership of conversations is owned by the store, so it is asked through `is_member`.
    pub fn matches(&self, row: &Row, is_member: impl Fn(ConversationId, UserId) -> bool) -> bool {
        if row.entity_type() != self.entity {
            return false;
        }
        match (self.filter, row) {
            (Filter::MemberOf(user_id), Row::Conversation(conversation)) => {
                is_member(conversation.id, user_id)
            }
            (Filter::Conversation(conversation_id), Row::Message(message)) => {
                message.conversation_id == conversation_id
            }
            (Filter::Conversation(conversation_id), Row::Call(call)) => {
                call.conversation_id == conversation_id
            }
            (Filter::Recipient(user_id), Row::Notification(notification)) => {
                notification.user_id == user_id
            }
            _ => false,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.filter {
            Filter::MemberOf(user_id) => write!(f, "{}:member={}", self.entity, user_id.0),
            Filter::Conversation(conversation_id) => {
                write!(f, "{}:conversation={}", self.entity, conversation_id.0)
            }
            Filter::Recipient(user_id) => write!(f, "{}:recipient={}", self.entity, user_id.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotQuery {
    pub scope: Scope,
    pub direction: SortDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl SnapshotQuery {
    pub fn for_entity<T: Entity>(scope: Scope, limit: Option<usize>) -> Self {
        Self {
            scope,
            direction: T::DISPLAY_DIRECTION,
            limit,
        }
    }

    /// Sorts rows by the entity key (ties broken by id) and applies the limit.
    pub fn arrange(&self, mut rows: Vec<Row>) -> Vec<Row> {
        rows.sort_by(|a, b| {
            let ascending = a
                .sort_at()
                .cmp(&b.sort_at())
                .then_with(|| a.raw_id().cmp(&b.raw_id()));
            match self.direction {
                SortDirection::Ascending => ascending,
                SortDirection::Descending => ascending.reverse(),
            }
        });
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "row", rename_all = "snake_case")]
pub enum Row {
    Conversation(Conversation),
    Message(Message),
    Notification(Notification),
    Call(Call),
}

impl Row {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Row::Conversation(_) => EntityType::Conversation,
            Row::Message(_) => EntityType::Message,
            Row::Notification(_) => EntityType::Notification,
            Row::Call(_) => EntityType::Call,
        }
    }

    pub fn raw_id(&self) -> i64 {
        match self {
            Row::Conversation(row) => row.id.0,
            Row::Message(row) => row.id.0,
            Row::Notification(row) => row.id.0,
            Row::Call(row) => row.id.0,
        }
    }

    pub fn sort_at(&self) -> DateTime<Utc> {
        match self {
            Row::Conversation(row) => row.sort_at(),
            Row::Message(row) => row.sort_at(),
            Row::Notification(row) => row.sort_at(),
            Row::Call(row) => row.sort_at(),
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Row::Conversation(row) => Some(row.id),
            Row::Message(row) => Some(row.conversation_id),
            Row::Notification(row) => row.conversation_id,
            Row::Call(row) => Some(row.conversation_id),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Row::Notification(row) => Some(row.user_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOperation {
    Insert,
    Update,
    Delete,
}

impl FeedOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedOperation::Insert => "insert",
            FeedOperation::Update => "update",
            FeedOperation::Delete => "delete",
        }
    }
}

/// One committed change. `event_id` increases with the store's commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub event_id: u64,
    pub op: FeedOperation,
    pub row: Row,
}

/// A feed event narrowed to one entity type.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Insert(T),
    Update(T),
    Delete(T),
}

impl<T: Entity> Change<T> {
    pub fn from_event(event: FeedEvent) -> Option<Self> {
        let row = T::from_row(event.row)?;
        Some(match event.op {
            FeedOperation::Insert => Change::Insert(row),
            FeedOperation::Update => Change::Update(row),
            FeedOperation::Delete => Change::Delete(row),
        })
    }

    pub fn row(&self) -> &T {
        match self {
            Change::Insert(row) | Change::Update(row) | Change::Delete(row) => row,
        }
    }
}

pub trait Entity: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    type Id: Copy + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static;

    const ENTITY_TYPE: EntityType;
    const DISPLAY_DIRECTION: SortDirection;

    fn id(&self) -> Self::Id;
    fn sort_at(&self) -> DateTime<Utc>;
    fn from_row(row: Row) -> Option<Self>;
    fn into_row(self) -> Row;

    fn display_order(a: &Self, b: &Self) -> Ordering {
        let ascending = a
            .sort_at()
            .cmp(&b.sort_at())
            .then_with(|| a.id().cmp(&b.id()));
        match Self::DISPLAY_DIRECTION {
            SortDirection::Ascending => ascending,
            SortDirection::Descending => ascending.reverse(),
        }
    }
}

macro_rules! entity_impl {
    ($ty:ident, $id:ty, $direction:ident, $sort_field:ident) => {
        impl Entity for $ty {
            type Id = $id;

            const ENTITY_TYPE: EntityType = EntityType::$ty;
            const DISPLAY_DIRECTION: SortDirection = SortDirection::$direction;

            fn id(&self) -> $id {
                self.id
            }

            fn sort_at(&self) -> DateTime<Utc> {
                self.$sort_field
            }

            fn from_row(row: Row) -> Option<Self> {
                match row {
                    Row::$ty(value) => Some(value),
                    _ => None,
                }
            }

            fn into_row(self) -> Row {
                Row::$ty(self)
            }
        }
    };
}

entity_impl!(Conversation, ConversationId, Descending, updated_at);
entity_impl!(Message, MessageId, Ascending, created_at);
entity_impl!(Notification, NotificationId, Descending, created_at);
entity_impl!(Call, CallId, Descending, started_at);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConversation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: ConversationKind,
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub kind: NotificationKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// New calls always start ringing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCall {
    pub conversation_id: ConversationId,
    pub initiator_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    pub call_type: CallType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "row", rename_all = "snake_case")]
pub enum NewRow {
    Conversation(NewConversation),
    Message(NewMessage),
    Notification(NewNotification),
    Call(NewCall),
}

impl NewRow {
    pub fn entity_type(&self) -> EntityType {
        match self {
            NewRow::Conversation(_) => EntityType::Conversation,
            NewRow::Message(_) => EntityType::Message,
            NewRow::Notification(_) => EntityType::Notification,
            NewRow::Call(_) => EntityType::Call,
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        match self {
            NewRow::Message(message) if message.content.trim().is_empty() => {
                Err(StoreError::validation("message content must not be empty"))
            }
            NewRow::Message(message)
                if message.message_type.is_attachment() && message.attachment_url.is_none() =>
            {
                Err(StoreError::validation(
                    "attachment messages require an attachment reference",
                ))
            }
            NewRow::Call(call) if call.receiver_id == Some(call.initiator_id) => Err(
                StoreError::validation("call initiator and receiver must be distinct"),
            ),
            _ => Ok(()),
        }
    }

    /// Builds the stored row once the store has assigned an id and commit time.
    pub fn into_row(self, id: i64, now: DateTime<Utc>) -> Row {
        match self {
            NewRow::Conversation(new) => Row::Conversation(Conversation {
                id: ConversationId(id),
                name: new.name,
                kind: new.kind,
                created_at: now,
                updated_at: now,
            }),
            NewRow::Message(new) => Row::Message(Message {
                id: MessageId(id),
                conversation_id: new.conversation_id,
                sender_id: new.sender_id,
                content: new.content,
                message_type: new.message_type,
                attachment_url: new.attachment_url,
                created_at: now,
            }),
            NewRow::Notification(new) => Row::Notification(Notification {
                id: NotificationId(id),
                user_id: new.user_id,
                conversation_id: new.conversation_id,
                kind: new.kind,
                title: new.title,
                body: new.body,
                read: false,
                created_at: now,
            }),
            NewRow::Call(new) => Row::Call(Call {
                id: CallId(id),
                conversation_id: new.conversation_id,
                initiator_id: new.initiator_id,
                receiver_id: new.receiver_id,
                call_type: new.call_type,
                status: CallStatus::Ringing,
                started_at: now,
                ended_at: None,
                duration_seconds: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPatch {
    pub read: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    /// Compare-and-set guard: the patch is rejected with `Conflict` unless the stored status matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<CallStatus>,
}

impl CallPatch {
    pub fn accept(receiver_id: UserId) -> Self {
        Self {
            status: Some(CallStatus::Active),
            receiver_id: Some(receiver_id),
            expected_status: Some(CallStatus::Ringing),
            ..Self::default()
        }
    }

    pub fn missed() -> Self {
        Self {
            status: Some(CallStatus::Missed),
            expected_status: Some(CallStatus::Ringing),
            ..Self::default()
        }
    }

    pub fn ended(ended_at: DateTime<Utc>, duration_seconds: u64) -> Self {
        Self {
            status: Some(CallStatus::Ended),
            ended_at: Some(ended_at),
            duration_seconds: Some(duration_seconds),
            expected_status: Some(CallStatus::Active),
            ..Self::default()
        }
    }

    pub fn apply(&self, call: &mut Call) -> Result<bool, StoreError> {
        if let Some(expected) = self.expected_status {
            if call.status != expected {
                return Err(StoreError::conflict(format!(
                    "call {} is {:?}, expected {:?}",
                    call.id.0, call.status, expected
                )));
            }
        }
        if self.receiver_id.is_some() && self.receiver_id == Some(call.initiator_id) {
            return Err(StoreError::validation(
                "call initiator and receiver must be distinct",
            ));
        }

        let before = call.clone();
        if let Some(status) = self.status {
            call.status = status;
        }
        if let Some(receiver_id) = self.receiver_id {
            call.receiver_id = Some(receiver_id);
        }
        if let Some(ended_at) = self.ended_at {
            call.ended_at = Some(ended_at);
        }
        if let Some(duration_seconds) = self.duration_seconds {
            call.duration_seconds = Some(duration_seconds);
        }
        Ok(*call != before)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "patch", rename_all = "snake_case")]
pub enum Patch {
    Conversation(ConversationPatch),
    Notification(NotificationPatch),
    Call(CallPatch),
}

impl Patch {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Patch::Conversation(_) => EntityType::Conversation,
            Patch::Notification(_) => EntityType::Notification,
            Patch::Call(_) => EntityType::Call,
        }
    }

    /// Applies the patch in place and reports whether the row changed.
    pub fn apply(&self, row: &mut Row, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match (self, row) {
            (Patch::Conversation(patch), Row::Conversation(conversation)) => {
                if let Some(name) = &patch.name {
                    conversation.name = Some(name.clone());
                }
                conversation.updated_at = now;
                Ok(true)
            }
            (Patch::Notification(patch), Row::Notification(notification)) => {
                // The read flag only moves forward.
                if patch.read && !notification.read {
                    notification.read = true;
                    return Ok(true);
                }
                Ok(false)
            }
            (Patch::Call(patch), Row::Call(call)) => patch.apply(call),
            (patch, row) => Err(StoreError::validation(format!(
                "{} patch cannot apply to {} row",
                patch.entity_type(),
                row.entity_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(minute: u32) -> DateTime<Utc> {
        format!("2024-01-01T10:{minute:02}:00Z")
            .parse()
            .expect("timestamp")
    }

    fn message(id: i64, conversation: i64, minute: u32) -> Row {
        Row::Message(Message {
            id: MessageId(id),
            conversation_id: ConversationId(conversation),
            sender_id: UserId(1),
            content: format!("m{id}"),
            message_type: MessageType::Text,
            attachment_url: None,
            created_at: at(minute),
        })
    }

    fn ringing_call() -> Call {
        Call {
            id: CallId(4),
            conversation_id: ConversationId(1),
            initiator_id: UserId(1),
            receiver_id: None,
            call_type: CallType::Audio,
            status: CallStatus::Ringing,
            started_at: at(0),
            ended_at: None,
            duration_seconds: None,
        }
    }

    #[test]
    fn scope_matches_rows_by_filter() {
        let scope = Scope::messages_in(ConversationId(7));
        assert!(scope.matches(&message(1, 7, 0), |_, _| false));
        assert!(!scope.matches(&message(1, 8, 0), |_, _| false));
        assert!(!Scope::calls_in(ConversationId(7)).matches(&message(1, 7, 0), |_, _| true));
    }

    #[test]
    fn member_scope_consults_membership() {
        let conversation = Row::Conversation(Conversation {
            id: ConversationId(3),
            name: None,
            kind: ConversationKind::Direct,
            created_at: at(0),
            updated_at: at(0),
        });
        let scope = Scope::conversations_of(UserId(9));
        assert!(scope.matches(&conversation, |c, u| c == ConversationId(3) && u == UserId(9)));
        assert!(!scope.matches(&conversation, |_, _| false));
    }

    #[test]
    fn arrange_orders_and_limits_rows() {
        let query = SnapshotQuery {
            scope: Scope::messages_in(ConversationId(1)),
            direction: SortDirection::Descending,
            limit: Some(2),
        };
        let rows = query.arrange(vec![message(1, 1, 0), message(3, 1, 2), message(2, 1, 1)]);
        let ids: Vec<i64> = rows.iter().map(Row::raw_id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn change_from_event_rejects_other_entities() {
        let event = FeedEvent {
            event_id: 1,
            op: FeedOperation::Insert,
            row: message(1, 1, 0),
        };
        assert!(Change::<Call>::from_event(event.clone()).is_none());
        match Change::<Message>::from_event(event) {
            Some(Change::Insert(message)) => assert_eq!(message.id, MessageId(1)),
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn call_patch_enforces_expected_status() {
        let mut call = ringing_call();
        call.status = CallStatus::Missed;
        let err = CallPatch::accept(UserId(2))
            .apply(&mut call)
            .expect_err("accepting a missed call must conflict");
        assert_eq!(err.code, crate::error::ErrorCode::Conflict);
        assert_eq!(call.status, CallStatus::Missed);
    }

    #[test]
    fn call_patch_rejects_self_accept() {
        let mut call = ringing_call();
        let err = CallPatch::accept(UserId(1))
            .apply(&mut call)
            .expect_err("initiator cannot accept");
        assert_eq!(err.code, crate::error::ErrorCode::Validation);
    }

    #[test]
    fn notification_read_flag_is_monotonic() {
        let mut row = Row::Notification(Notification {
            id: NotificationId(1),
            user_id: UserId(1),
            conversation_id: None,
            kind: NotificationKind::Message,
            title: "hi".into(),
            body: None,
            read: true,
            created_at: at(0),
        });
        let unread = Patch::Notification(NotificationPatch { read: false });
        assert!(!unread.apply(&mut row, at(1)).expect("patch"));
        let read = Patch::Notification(NotificationPatch { read: true });
        assert!(!read.apply(&mut row, at(1)).expect("patch"));
    }

    #[test]
    fn rows_serialize_with_entity_tag() {
        let json = serde_json::to_value(message(1, 2, 0)).expect("json");
        assert_eq!(json["entity"], "message");
        assert_eq!(json["row"]["message_type"], "text");
    }
}
