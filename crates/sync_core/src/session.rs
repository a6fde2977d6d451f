use std::{collections::HashMap, sync::Arc};

use integrations::{ChangeFeedStore, MediaDeviceProvider};
use shared::{
    domain::{
        CallType, Conversation, ConversationId, Message, MessageType, Notification,
        NotificationId, UserId,
    },
    protocol::{Entity, NewMessage, NewRow, NotificationPatch, Patch, Scope},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    call::{CallPhase, CallSignalingController, CallSnapshot},
    config::EngineSettings,
    error::SyncError,
    feed::{ChangeFeedClient, FeedStatusEvent},
    mirror::EntityMirror,
    views, SessionContext,
};

const VOICE_MESSAGE_LABEL: &str = "Voice message";

/// An uploaded blob ready to be referenced from a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub url: String,
    pub name: String,
}

struct Selection {
    conversation_id: ConversationId,
    messages: EntityMirror<Message>,
}

#[derive(Default)]
struct SessionState {
    selected: Option<Selection>,
    calls: HashMap<ConversationId, Arc<CallSignalingController>>,
    /// Bumped by every selection change so a slower, superseded open is discarded.
    selection_epoch: u64,
    closed: bool,
}

/// Everything one signed-in user's client needs: the conversation list, notifications, and the
/// messages and call of whichever conversation is selected.
pub struct SessionCoordinator {
    context: SessionContext,
    settings: EngineSettings,
    feed: Arc<ChangeFeedClient>,
    media: Arc<dyn MediaDeviceProvider>,
    conversations: EntityMirror<Conversation>,
    notifications: EntityMirror<Notification>,
    inner: Mutex<SessionState>,
}

impl SessionCoordinator {
    pub async fn start(
        context: SessionContext,
        store: Arc<dyn ChangeFeedStore>,
        media: Arc<dyn MediaDeviceProvider>,
        settings: EngineSettings,
    ) -> Result<Self, SyncError> {
        let feed = ChangeFeedClient::new(store, &settings);
        let conversations = EntityMirror::open(
            Arc::clone(&feed),
            Scope::conversations_of(context.user_id),
            None,
        )
        .await?;
        let notifications = EntityMirror::open(
            Arc::clone(&feed),
            Scope::notifications_for(context.user_id),
            Some(settings.notification_snapshot_limit),
        )
        .await?;
        info!(user_id = context.user_id.0, "session: started");

        Ok(Self {
            context,
            settings,
            feed,
            media,
            conversations,
            notifications,
            inner: Mutex::new(SessionState::default()),
        })
    }

    pub fn context(&self) -> SessionContext {
        self.context
    }

    pub fn user_id(&self) -> UserId {
        self.context.user_id
    }

    pub fn feed(&self) -> &Arc<ChangeFeedClient> {
        &self.feed
    }

    pub fn subscribe_feed_status(&self) -> broadcast::Receiver<FeedStatusEvent> {
        self.feed.subscribe_status()
    }

    /// Binds the message mirror and call controller to `conversation_id`.
    ///
    /// A call still live in the previously selected conversation keeps its controller.
    pub async fn select_conversation(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        let (epoch, previous, existing_call) = {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return Err(SyncError::ScopeClosed("session".to_string()));
            }
            if guard
                .selected
                .as_ref()
                .is_some_and(|selection| selection.conversation_id == conversation_id)
            {
                return Ok(());
            }
            guard.selection_epoch += 1;
            (
                guard.selection_epoch,
                guard.selected.take(),
                guard.calls.get(&conversation_id).cloned(),
            )
        };
        if let Some(previous) = previous {
            previous.messages.close().await;
        }

        let messages = EntityMirror::open(
            Arc::clone(&self.feed),
            Scope::messages_in(conversation_id),
            None,
        )
        .await?;
        let controller = match existing_call {
            Some(controller) => controller,
            None => {
                match CallSignalingController::attach(
                    self.context,
                    conversation_id,
                    Arc::clone(&self.feed),
                    Arc::clone(&self.media),
                    &self.settings,
                )
                .await
                {
                    Ok(controller) => controller,
                    Err(err) => {
                        messages.close().await;
                        return Err(err);
                    }
                }
            }
        };

        let mut guard = self.inner.lock().await;
        if guard.closed || guard.selection_epoch != epoch {
            drop(guard);
            debug!(conversation_id = conversation_id.0, "session: selection superseded");
            messages.close().await;
            self.prune_idle_calls().await;
            return Ok(());
        }
        guard.selected = Some(Selection {
            conversation_id,
            messages,
        });
        guard.calls.entry(conversation_id).or_insert(controller);
        drop(guard);
        info!(conversation_id = conversation_id.0, "session: conversation selected");

        self.prune_idle_calls().await;
        Ok(())
    }

    pub async fn clear_selection(&self) {
        let previous = {
            let mut guard = self.inner.lock().await;
            guard.selection_epoch += 1;
            guard.selected.take()
        };
        if let Some(previous) = previous {
            previous.messages.close().await;
            debug!(conversation_id = previous.conversation_id.0, "session: selection cleared");
        }
        self.prune_idle_calls().await;
    }

    pub async fn selected_conversation(&self) -> Option<ConversationId> {
        self.inner
            .lock()
            .await
            .selected
            .as_ref()
            .map(|selection| selection.conversation_id)
    }

    /// Sends a text message. The message list updates once the store echoes it back.
    pub async fn send_message(&self, text: &str) -> Result<Message, SyncError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(SyncError::Validation("message must not be empty".to_string()));
        }
        let conversation_id = self.require_selection().await?;
        self.insert_message(NewMessage {
            conversation_id,
            sender_id: self.context.user_id,
            content: content.to_string(),
            message_type: MessageType::Text,
            attachment_url: None,
        })
        .await
    }

    pub async fn send_attachment(
        &self,
        attachment: AttachmentRef,
        message_type: MessageType,
    ) -> Result<Message, SyncError> {
        if !message_type.is_attachment() {
            return Err(SyncError::Validation(
                "attachments need an image, file or voice type".to_string(),
            ));
        }
        if attachment.url.trim().is_empty() {
            return Err(SyncError::Validation(
                "attachment reference must not be empty".to_string(),
            ));
        }
        let name = attachment.name.trim();
        let content = match message_type {
            MessageType::Voice if name.is_empty() => VOICE_MESSAGE_LABEL.to_string(),
            _ if name.is_empty() => {
                return Err(SyncError::Validation(
                    "attachment name must not be empty".to_string(),
                ))
            }
            _ => name.to_string(),
        };
        let conversation_id = self.require_selection().await?;
        self.insert_message(NewMessage {
            conversation_id,
            sender_id: self.context.user_id,
            content,
            message_type,
            attachment_url: Some(attachment.url),
        })
        .await
    }

    /// Calls from the selected conversation. Only one call may be in progress per session, and
    /// an ended call still counts until its grace period is over.
    pub async fn initiate_call(
        &self,
        call_type: CallType,
        receiver: Option<UserId>,
    ) -> Result<shared::domain::Call, SyncError> {
        let controller = {
            let guard = self.inner.lock().await;
            for controller in guard.calls.values() {
                if controller.is_busy().await {
                    return Err(SyncError::CallBusy);
                }
            }
            let selection = guard.selected.as_ref().ok_or(SyncError::NoSelection)?;
            guard
                .calls
                .get(&selection.conversation_id)
                .cloned()
                .ok_or(SyncError::NoSelection)?
        };
        controller.initiate_call(call_type, receiver).await
    }

    /// Answers the incoming call, wherever it rings. Refused while another call is live.
    pub async fn accept_call(&self) -> Result<(), SyncError> {
        let target = self.call_target(&[CallPhase::IncomingRinging]).await?;
        if target.phase().await != CallPhase::IncomingRinging {
            return target.accept_call().await;
        }
        let others = {
            let guard = self.inner.lock().await;
            guard
                .calls
                .iter()
                .filter(|(conversation_id, _)| **conversation_id != target.conversation_id())
                .map(|(_, controller)| Arc::clone(controller))
                .collect::<Vec<_>>()
        };
        for controller in others {
            if controller.is_live().await {
                return Err(SyncError::CallBusy);
            }
        }
        target.accept_call().await
    }

    /// Rejects a ringing call before touching an active one.
    pub async fn decline_call(&self) -> Result<(), SyncError> {
        self.call_target(&[
            CallPhase::IncomingRinging,
            CallPhase::OutgoingRinging,
            CallPhase::Active,
        ])
        .await?
        .decline_call()
        .await
    }

    /// Hangs up the active call before withdrawing a ringing one.
    pub async fn end_call(&self) -> Result<(), SyncError> {
        self.call_target(&[
            CallPhase::Active,
            CallPhase::OutgoingRinging,
            CallPhase::IncomingRinging,
        ])
        .await?
        .end_call()
        .await
    }

    /// The call in progress if there is one, else the selected conversation's.
    pub async fn call_snapshot(&self) -> Option<CallSnapshot> {
        let controller = self
            .call_target(&[
                CallPhase::Active,
                CallPhase::OutgoingRinging,
                CallPhase::IncomingRinging,
                CallPhase::Ended,
            ])
            .await
            .ok()?;
        Some(controller.snapshot().await)
    }

    /// Every attached call controller's state, by conversation id.
    pub async fn call_snapshots(&self) -> Vec<CallSnapshot> {
        let mut controllers = {
            let guard = self.inner.lock().await;
            guard.calls.values().cloned().collect::<Vec<_>>()
        };
        controllers.sort_by_key(|controller| controller.conversation_id());
        let mut snapshots = Vec::with_capacity(controllers.len());
        for controller in controllers {
            snapshots.push(controller.snapshot().await);
        }
        snapshots
    }

    pub async fn mark_notification_read(&self, id: NotificationId) -> Result<(), SyncError> {
        let notification = self
            .notifications
            .get(id)
            .await
            .ok_or_else(|| SyncError::NotFound(format!("notification {}", id.0)))?;
        if notification.read {
            return Ok(());
        }
        self.feed
            .update(
                id.0,
                Patch::Notification(NotificationPatch { read: true }),
            )
            .await?;
        Ok(())
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.conversations.rows().await
    }

    pub async fn search_conversations(&self, query: &str) -> Vec<Conversation> {
        self.conversations
            .read(|rows| {
                views::search_conversations(rows, query)
                    .into_iter()
                    .cloned()
                    .collect()
            })
            .await
    }

    /// Messages of the selected conversation, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        match self.inner.lock().await.selected.as_ref() {
            Some(selection) => selection.messages.rows().await,
            None => Vec::new(),
        }
    }

    pub async fn latest_message(&self) -> Option<Message> {
        let guard = self.inner.lock().await;
        let selection = guard.selected.as_ref()?;
        selection
            .messages
            .read(|rows| views::latest_message(rows).cloned())
            .await
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.rows().await
    }

    pub async fn unread_notifications(&self) -> usize {
        self.notifications.read(views::unread_count).await
    }

    pub async fn unread_notifications_for(&self, conversation_id: ConversationId) -> usize {
        self.notifications
            .read(|rows| views::unread_count_for_conversation(rows, conversation_id))
            .await
    }

    pub async fn conversations_stale(&self) -> bool {
        self.conversations.is_stale().await
    }

    pub fn conversation_mirror(&self) -> &EntityMirror<Conversation> {
        &self.conversations
    }

    pub fn notification_mirror(&self) -> &EntityMirror<Notification> {
        &self.notifications
    }

    pub async fn shutdown(&self) {
        let (selected, calls) = {
            let mut guard = self.inner.lock().await;
            guard.closed = true;
            guard.selection_epoch += 1;
            (
                guard.selected.take(),
                guard.calls.drain().map(|(_, controller)| controller).collect::<Vec<_>>(),
            )
        };
        if let Some(selection) = selected {
            selection.messages.close().await;
        }
        for controller in calls {
            controller.shutdown().await;
        }
        self.feed.shutdown().await;
        info!(user_id = self.context.user_id.0, "session: shut down");
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, SyncError> {
        let row = self.feed.insert(NewRow::Message(message)).await?;
        Message::from_row(row)
            .ok_or_else(|| SyncError::Validation("store returned a non-message row".to_string()))
    }

    async fn require_selection(&self) -> Result<ConversationId, SyncError> {
        self.selected_conversation()
            .await
            .ok_or(SyncError::NoSelection)
    }

    /// The first controller in one of `phases`, tried in order. Within a phase the selected
    /// conversation wins, then the lowest conversation id. Falls back to the selected controller.
    async fn call_target(
        &self,
        phases: &[CallPhase],
    ) -> Result<Arc<CallSignalingController>, SyncError> {
        let (selected, mut candidates) = {
            let guard = self.inner.lock().await;
            let selected = guard
                .selected
                .as_ref()
                .map(|selection| selection.conversation_id);
            let candidates = guard
                .calls
                .iter()
                .map(|(conversation_id, controller)| (*conversation_id, Arc::clone(controller)))
                .collect::<Vec<_>>();
            (selected, candidates)
        };
        candidates.sort_by_key(|(conversation_id, _)| (Some(*conversation_id) != selected, *conversation_id));

        let mut current = Vec::with_capacity(candidates.len());
        for (_, controller) in &candidates {
            current.push(controller.phase().await);
        }
        for wanted in phases {
            if let Some(index) = current.iter().position(|phase| phase == wanted) {
                return Ok(Arc::clone(&candidates[index].1));
            }
        }

        let selected = selected.ok_or(SyncError::NoSelection)?;
        candidates
            .into_iter()
            .find(|(conversation_id, _)| *conversation_id == selected)
            .map(|(_, controller)| controller)
            .ok_or(SyncError::NoSelection)
    }

    /// Detaches controllers that are neither selected nor busy with a call.
    async fn prune_idle_calls(&self) {
        let idle = {
            let mut guard = self.inner.lock().await;
            let selected = guard
                .selected
                .as_ref()
                .map(|selection| selection.conversation_id);
            let mut idle = Vec::new();
            for (conversation_id, controller) in &guard.calls {
                if Some(*conversation_id) != selected && !controller.is_busy().await {
                    idle.push(*conversation_id);
                }
            }
            idle.into_iter()
                .filter_map(|conversation_id| guard.calls.remove(&conversation_id))
                .collect::<Vec<_>>()
        };
        for controller in idle {
            debug!(conversation_id = controller.conversation_id().0, "session: detaching idle call controller");
            controller.shutdown().await;
        }
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        if !self.inner.get_mut().closed {
            warn!(user_id = self.context.user_id.0, "session: dropped without shutdown");
        }
    }
}
