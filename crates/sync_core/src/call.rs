//! Call signalling for one conversation.
//!
//! The store's call row is the source of truth. Local actions write to it and then wait for the
//! echo; remote changes arriving through the feed always win. Every transition runs under the
//! state lock, while media and store requests run outside it and are checked against the attempt
//! counter when they complete.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use integrations::{MediaDeviceProvider, MediaHandle};
use shared::{
    domain::{Call, CallId, CallStatus, CallType, ConversationId, UserId},
    protocol::{CallPatch, Change, Entity, NewCall, NewRow, Patch, Scope},
};
use tokio::{
    sync::{broadcast, Mutex, MutexGuard},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    config::EngineSettings,
    error::SyncError,
    feed::{ChangeFeedClient, ScopeId, ScopeSignal},
    views::format_call_duration,
    SessionContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Initiating,
    Accepting,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub conversation_id: ConversationId,
    pub phase: CallPhase,
    pub call: Option<Call>,
    pub duration_seconds: u64,
    pub formatted_duration: String,
    pub holds_media: bool,
    pub pending: Option<PendingAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallEvent {
    pub conversation_id: ConversationId,
    pub phase: CallPhase,
    pub call: Option<Call>,
}

struct CallState {
    phase: CallPhase,
    call: Option<Call>,
    media: Option<MediaHandle>,
    pending: Option<PendingAction>,
    /// Bumped on every reset and every local action; stale completions compare against it.
    attempt: u64,
    active_since: Option<Instant>,
    final_duration: Option<u64>,
    clear_task: Option<JoinHandle<()>>,
    closed: bool,
}

#[derive(Default)]
struct Effects {
    release: Option<MediaHandle>,
    schedule_clear: bool,
    changed: bool,
}

impl CallState {
    fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            call: None,
            media: None,
            pending: None,
            attempt: 0,
            active_since: None,
            final_duration: None,
            clear_task: None,
            closed: false,
        }
    }

    fn tracked_id(&self) -> Option<CallId> {
        self.call.as_ref().map(|call| call.id)
    }

    fn is_live(&self) -> bool {
        self.pending.is_some()
            || matches!(
                self.phase,
                CallPhase::OutgoingRinging | CallPhase::IncomingRinging | CallPhase::Active
            )
    }

    /// Live, or still showing an ended call during the grace period.
    fn is_busy(&self) -> bool {
        self.is_live() || self.phase == CallPhase::Ended
    }

    fn duration_seconds(&self) -> u64 {
        match self.phase {
            CallPhase::Active => self
                .active_since
                .map(|since| since.elapsed().as_secs())
                .unwrap_or(0),
            CallPhase::Ended => self.final_duration.unwrap_or(0),
            _ => 0,
        }
    }

    fn begin_attempt(&mut self) -> u64 {
        self.attempt += 1;
        self.attempt
    }

    /// Back to Idle. Hands back the media handle, if any, for the caller to release.
    fn reset(&mut self) -> Option<MediaHandle> {
        self.attempt += 1;
        self.phase = CallPhase::Idle;
        self.call = None;
        self.pending = None;
        self.active_since = None;
        self.final_duration = None;
        if let Some(task) = self.clear_task.take() {
            task.abort();
        }
        self.media.take()
    }

    /// Freezes the timer and moves to Ended.
    fn finish(&mut self, reported_duration: Option<u64>) -> (Option<MediaHandle>, u64) {
        let duration = self
            .active_since
            .map(|since| since.elapsed().as_secs())
            .or(reported_duration)
            .unwrap_or(0);
        self.attempt += 1;
        self.phase = CallPhase::Ended;
        self.pending = None;
        self.active_since = None;
        self.final_duration = Some(duration);
        (self.media.take(), duration)
    }

    /// Applies a call row seen on the feed.
    fn observe(&mut self, call: Call, me: UserId) -> Effects {
        let mut effects = Effects::default();

        if self.tracked_id() != Some(call.id) {
            if call.status != CallStatus::Ringing {
                return effects;
            }
            let own_echo = self.phase == CallPhase::OutgoingRinging
                && self.call.is_none()
                && self.pending == Some(PendingAction::Initiating)
                && call.initiator_id == me;
            let incoming = self.phase == CallPhase::Idle
                && self.pending.is_none()
                && call.initiator_id != me
                && call.receiver_id.map_or(true, |receiver| receiver == me);
            if own_echo {
                self.call = Some(call);
                effects.changed = true;
            } else if incoming {
                info!(call_id = call.id.0, "call: incoming call ringing");
                self.phase = CallPhase::IncomingRinging;
                self.call = Some(call);
                effects.changed = true;
            }
            return effects;
        }

        match call.status {
            CallStatus::Ringing => {
                if self.call.as_ref() != Some(&call) {
                    self.call = Some(call);
                    effects.changed = true;
                }
            }
            CallStatus::Active => {
                if self.phase == CallPhase::Ended {
                    return effects;
                }
                let initiated_here = call.initiator_id == me;
                let accepted_here = call.receiver_id == Some(me)
                    && (self.pending == Some(PendingAction::Accepting)
                        || self.phase == CallPhase::Active);
                if !initiated_here && !accepted_here {
                    info!(call_id = call.id.0, "call: answered elsewhere");
                    effects.release = self.reset();
                    effects.changed = true;
                    return effects;
                }
                if self.active_since.is_none() {
                    self.active_since = Some(Instant::now());
                }
                if self.phase != CallPhase::Active {
                    info!(call_id = call.id.0, "call: active");
                    self.phase = CallPhase::Active;
                    effects.changed = true;
                }
                if self.pending == Some(PendingAction::Accepting) {
                    self.pending = None;
                    effects.changed = true;
                }
                if self.call.as_ref() != Some(&call) {
                    self.call = Some(call);
                    effects.changed = true;
                }
            }
            CallStatus::Missed => {
                info!(call_id = call.id.0, "call: missed");
                effects.release = self.reset();
                effects.changed = true;
            }
            CallStatus::Ended => {
                if self.phase != CallPhase::Ended {
                    info!(call_id = call.id.0, "call: ended remotely");
                    let (media, _) = self.finish(call.duration_seconds);
                    effects.release = media;
                    effects.schedule_clear = true;
                    effects.changed = true;
                }
                self.call = Some(call);
            }
        }
        effects
    }

    fn forget(&mut self, call_id: CallId) -> Effects {
        let mut effects = Effects::default();
        if self.tracked_id() == Some(call_id) {
            info!(call_id = call_id.0, "call: tracked call deleted");
            effects.release = self.reset();
            effects.changed = true;
        }
        effects
    }

    /// Aligns with an authoritative snapshot.
    fn reconcile(&mut self, rows: Vec<Call>, me: UserId, adopt_incoming: bool) -> Effects {
        if let Some(tracked) = self.tracked_id() {
            return match rows.into_iter().find(|call| call.id == tracked) {
                Some(call) => self.observe(call, me),
                None if self.phase == CallPhase::Ended => Effects::default(),
                None => self.forget(tracked),
            };
        }
        if !adopt_incoming {
            return Effects::default();
        }
        // Rows are newest first.
        match rows.into_iter().find(|call| {
            call.status == CallStatus::Ringing
                && call.initiator_id != me
                && call.receiver_id.map_or(true, |receiver| receiver == me)
        }) {
            Some(call) => self.observe(call, me),
            None => Effects::default(),
        }
    }
}

pub struct CallSignalingController {
    context: SessionContext,
    conversation_id: ConversationId,
    feed: Arc<ChangeFeedClient>,
    media: Arc<dyn MediaDeviceProvider>,
    end_grace: Duration,
    inner: Mutex<CallState>,
    events: broadcast::Sender<CallEvent>,
    listener: Mutex<Option<(ScopeId, JoinHandle<()>)>>,
}

impl CallSignalingController {
    /// Subscribes to the conversation's calls and waits for the first snapshot.
    ///
    /// Calls already ringing at attach time are not raised; only later inserts are.
    pub async fn attach(
        context: SessionContext,
        conversation_id: ConversationId,
        feed: Arc<ChangeFeedClient>,
        media: Arc<dyn MediaDeviceProvider>,
        settings: &EngineSettings,
    ) -> Result<Arc<Self>, SyncError> {
        let mut subscription = feed
            .subscribe::<Call>(
                Scope::calls_in(conversation_id),
                Some(settings.call_snapshot_limit),
            )
            .await?;
        match subscription.recv().await {
            Some(ScopeSignal::Snapshot(_)) => {}
            Some(ScopeSignal::Failed(err)) => {
                feed.unsubscribe(subscription.id).await;
                return Err(err);
            }
            Some(_) | None => {
                feed.unsubscribe(subscription.id).await;
                return Err(SyncError::ScopeClosed(subscription.scope.to_string()));
            }
        }

        let (events, _) = broadcast::channel(64);
        let controller = Arc::new(Self {
            context,
            conversation_id,
            feed,
            media,
            end_grace: settings.call_end_grace(),
            inner: Mutex::new(CallState::new()),
            events,
            listener: Mutex::new(None),
        });

        let scope_id = subscription.id;
        let weak = Arc::downgrade(&controller);
        let task = tokio::spawn(async move {
            while let Some(signal) = subscription.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.handle_signal(signal).await;
            }
        });
        *controller.listener.lock().await = Some((scope_id, task));
        debug!(
            conversation_id = conversation_id.0,
            user_id = context.user_id.0,
            "call: controller attached"
        );
        Ok(controller)
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> CallPhase {
        self.inner.lock().await.phase
    }

    /// Ringing, active, or with a local action still in flight.
    pub async fn is_live(&self) -> bool {
        self.inner.lock().await.is_live()
    }

    /// Live or in the Ended grace period. A busy controller blocks new calls in the session.
    pub async fn is_busy(&self) -> bool {
        self.inner.lock().await.is_busy()
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        let guard = self.inner.lock().await;
        let duration_seconds = guard.duration_seconds();
        CallSnapshot {
            conversation_id: self.conversation_id,
            phase: guard.phase,
            call: guard.call.clone(),
            duration_seconds,
            formatted_duration: format_call_duration(duration_seconds),
            holds_media: guard.media.is_some(),
            pending: guard.pending,
        }
    }

    /// Starts an outgoing call. `receiver` is `None` for a call to the whole conversation.
    pub async fn initiate_call(
        self: &Arc<Self>,
        call_type: CallType,
        receiver: Option<UserId>,
    ) -> Result<Call, SyncError> {
        let me = self.context.user_id;
        if receiver == Some(me) {
            return Err(SyncError::InvalidParticipants(
                "cannot call yourself".to_string(),
            ));
        }

        let attempt = {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return Err(SyncError::ScopeClosed(self.scope_label()));
            }
            if guard.phase != CallPhase::Idle || guard.pending.is_some() {
                return Err(SyncError::CallBusy);
            }
            let attempt = guard.begin_attempt();
            guard.phase = CallPhase::OutgoingRinging;
            guard.pending = Some(PendingAction::Initiating);
            guard.call = None;
            self.emit(&guard);
            attempt
        };
        info!(
            conversation_id = self.conversation_id.0,
            ?call_type,
            "call: initiating"
        );

        let handle = match self.media.acquire(call_type.into()).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(conversation_id = self.conversation_id.0, "call: media acquisition failed: {err}");
                let mut guard = self.inner.lock().await;
                if guard.attempt == attempt {
                    guard.reset();
                    self.emit(&guard);
                }
                return Err(err.into());
            }
        };

        {
            let mut guard = self.inner.lock().await;
            if guard.attempt != attempt || guard.closed {
                drop(guard);
                debug!(conversation_id = self.conversation_id.0, "call: cancelled during media setup");
                self.media.release(handle).await;
                return Err(SyncError::Cancelled);
            }
            guard.media = Some(handle);
        }

        let inserted = self
            .feed
            .insert(NewRow::Call(NewCall {
                conversation_id: self.conversation_id,
                initiator_id: me,
                receiver_id: receiver,
                call_type,
            }))
            .await;

        let row = match inserted {
            Ok(row) => row,
            Err(err) => {
                warn!(conversation_id = self.conversation_id.0, "call: creating call row failed: {err}");
                self.abandon(attempt).await;
                return Err(err);
            }
        };
        let Some(call) = Call::from_row(row) else {
            warn!(conversation_id = self.conversation_id.0, "call: store answered the insert with a non-call row");
            self.abandon(attempt).await;
            return Err(SyncError::Validation(
                "store returned a non-call row".to_string(),
            ));
        };

        let mut guard = self.inner.lock().await;
        if guard.attempt != attempt || guard.closed {
            drop(guard);
            // Torn down while the row was being created; nobody should see it ring.
            info!(call_id = call.id.0, "call: cancelled during setup, marking missed");
            self.settle(call.id, CallPatch::missed()).await?;
            return Err(SyncError::Cancelled);
        }
        guard.pending = None;
        // Only the row id is taken from the insert, so a cancel before the echo can settle it.
        if guard.call.is_none() {
            guard.call = Some(call.clone());
        }
        let current = guard.call.clone().unwrap_or(call);
        self.emit(&guard);
        Ok(current)
    }

    /// Answers the ringing incoming call. A call that stopped ringing meanwhile is left alone.
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), SyncError> {
        let me = self.context.user_id;
        let (attempt, call) = {
            let mut guard = self.inner.lock().await;
            match guard.phase {
                CallPhase::Idle | CallPhase::Ended => return Ok(()),
                CallPhase::IncomingRinging if guard.pending.is_none() => {}
                _ => return Err(SyncError::CallBusy),
            }
            let Some(call) = guard.call.clone() else {
                return Ok(());
            };
            if call.initiator_id == me {
                return Err(SyncError::InvalidParticipants(
                    "cannot accept your own call".to_string(),
                ));
            }
            let attempt = guard.begin_attempt();
            guard.pending = Some(PendingAction::Accepting);
            self.emit(&guard);
            (attempt, call)
        };
        info!(call_id = call.id.0, "call: accepting");

        let handle = match self.media.acquire(call.call_type.into()).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(call_id = call.id.0, "call: media acquisition failed: {err}");
                let mut guard = self.inner.lock().await;
                if guard.attempt == attempt {
                    guard.reset();
                    self.emit(&guard);
                }
                return Err(err.into());
            }
        };

        {
            let mut guard = self.inner.lock().await;
            if guard.attempt != attempt || guard.closed {
                drop(guard);
                debug!(call_id = call.id.0, "call: stopped ringing before media was ready");
                self.media.release(handle).await;
                return Ok(());
            }
            guard.media = Some(handle);
        }

        match self
            .feed
            .update(call.id.0, Patch::Call(CallPatch::accept(me)))
            .await
        {
            Ok(_) => {
                // Active once the feed echoes the accepted row.
                debug!(call_id = call.id.0, "call: accept written, waiting for echo");
                Ok(())
            }
            Err(SyncError::ConflictingState(detail)) => {
                info!(call_id = call.id.0, "call: accept lost the race: {detail}");
                self.abandon(attempt).await;
                Ok(())
            }
            Err(err) => {
                warn!(call_id = call.id.0, "call: accept failed: {err}");
                let released = {
                    let mut guard = self.inner.lock().await;
                    if guard.attempt == attempt {
                        guard.pending = None;
                        self.emit(&guard);
                        guard.media.take()
                    } else {
                        None
                    }
                };
                self.release(released).await;
                Err(err)
            }
        }
    }

    /// Rejects a ringing call, cancels one still being set up, or ends an active one.
    pub async fn decline_call(self: &Arc<Self>) -> Result<(), SyncError> {
        self.hang_up().await
    }

    /// Ends the active call. A call that is still ringing is withdrawn instead.
    pub async fn end_call(self: &Arc<Self>) -> Result<(), SyncError> {
        self.hang_up().await
    }

    async fn hang_up(self: &Arc<Self>) -> Result<(), SyncError> {
        let guard = self.inner.lock().await;
        match guard.phase {
            CallPhase::Idle | CallPhase::Ended => Ok(()),
            CallPhase::OutgoingRinging | CallPhase::IncomingRinging => {
                self.withdraw_ringing(guard).await
            }
            CallPhase::Active => self.hang_up_active(guard).await,
        }
    }

    /// Back to Idle and marks the row missed.
    async fn withdraw_ringing(&self, mut guard: MutexGuard<'_, CallState>) -> Result<(), SyncError> {
        let call_id = guard.tracked_id();
        let released = guard.reset();
        self.emit(&guard);
        drop(guard);
        self.release(released).await;

        let Some(call_id) = call_id else {
            // Setup still in flight; `initiate_call` notices the reset and cleans up.
            info!(conversation_id = self.conversation_id.0, "call: outgoing call cancelled");
            return Ok(());
        };
        info!(call_id = call_id.0, "call: declined");
        self.settle(call_id, CallPatch::missed()).await
    }

    /// Freezes the timer, writes the final duration and lingers in Ended for the grace period.
    async fn hang_up_active(
        self: &Arc<Self>,
        mut guard: MutexGuard<'_, CallState>,
    ) -> Result<(), SyncError> {
        let call_id = guard.tracked_id();
        let (released, duration) = guard.finish(None);
        self.schedule_clear(&mut guard);
        self.emit(&guard);
        drop(guard);
        self.release(released).await;

        let Some(call_id) = call_id else {
            return Ok(());
        };
        info!(call_id = call_id.0, duration_seconds = duration, "call: ended");
        self.settle(call_id, CallPatch::ended(Utc::now(), duration))
            .await
    }

    /// Stops listening. A call still ringing outward is withdrawn and an active one is ended,
    /// as is an accept still waiting for its echo.
    pub async fn shutdown(self: &Arc<Self>) {
        let hang_up = {
            let guard = self.inner.lock().await;
            matches!(guard.phase, CallPhase::OutgoingRinging | CallPhase::Active)
                || guard.pending == Some(PendingAction::Accepting)
        };
        let result = if hang_up { self.hang_up().await } else { Ok(()) };
        if let Err(err) = result {
            warn!(conversation_id = self.conversation_id.0, "call: hang-up on shutdown failed: {err}");
        }

        let released = {
            let mut guard = self.inner.lock().await;
            guard.closed = true;
            let released = guard.reset();
            self.emit(&guard);
            released
        };
        self.release(released).await;

        if let Some((scope_id, task)) = self.listener.lock().await.take() {
            task.abort();
            self.feed.unsubscribe(scope_id).await;
        }
        debug!(conversation_id = self.conversation_id.0, "call: controller detached");
    }

    async fn handle_signal(self: &Arc<Self>, signal: ScopeSignal<Call>) {
        let me = self.context.user_id;
        let released = {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return;
            }
            let effects = match signal {
                ScopeSignal::Snapshot(rows) => guard.reconcile(rows, me, true),
                ScopeSignal::Change(Change::Insert(call)) | ScopeSignal::Change(Change::Update(call)) => {
                    guard.observe(call, me)
                }
                ScopeSignal::Change(Change::Delete(call)) => guard.forget(call.id),
                ScopeSignal::Disconnected => {
                    info!(conversation_id = self.conversation_id.0, "call: feed disconnected, holding state");
                    Effects::default()
                }
                ScopeSignal::Failed(err) => {
                    warn!(conversation_id = self.conversation_id.0, "call: feed failed: {err}");
                    Effects::default()
                }
            };
            if effects.schedule_clear {
                self.schedule_clear(&mut guard);
            }
            if effects.changed {
                self.emit(&guard);
            }
            effects.release
        };
        self.release(released).await;
    }

    /// Writes a terminal patch. A conflict means the store already moved on, which is fine.
    async fn settle(&self, call_id: CallId, patch: CallPatch) -> Result<(), SyncError> {
        let missed = patch.status == Some(CallStatus::Missed);
        match self.feed.update(call_id.0, Patch::Call(patch)).await {
            Ok(_) => Ok(()),
            Err(SyncError::ConflictingState(_)) if missed => {
                // Answered before the decline landed; hang up instead.
                match self
                    .feed
                    .update(call_id.0, Patch::Call(CallPatch::ended(Utc::now(), 0)))
                    .await
                {
                    Ok(_) | Err(SyncError::ConflictingState(_)) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Err(SyncError::ConflictingState(detail)) => {
                debug!(call_id = call_id.0, "call: terminal patch superseded: {detail}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn schedule_clear(self: &Arc<Self>, state: &mut CallState) {
        if let Some(task) = state.clear_task.take() {
            task.abort();
        }
        let attempt = state.attempt;
        let grace = self.end_grace;
        let weak: Weak<Self> = Arc::downgrade(self);
        state.clear_task = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(controller) = weak.upgrade() else {
                return;
            };
            let released = {
                let mut guard = controller.inner.lock().await;
                if guard.phase != CallPhase::Ended || guard.attempt != attempt {
                    return;
                }
                guard.clear_task = None;
                let released = guard.reset();
                controller.emit(&guard);
                released
            };
            controller.release(released).await;
        }));
    }

    /// Drops back to Idle if `attempt` is still current and releases what it held.
    async fn abandon(&self, attempt: u64) {
        let released = {
            let mut guard = self.inner.lock().await;
            if guard.attempt == attempt {
                let released = guard.reset();
                self.emit(&guard);
                released
            } else {
                None
            }
        };
        self.release(released).await;
    }

    async fn release(&self, handle: Option<MediaHandle>) {
        if let Some(handle) = handle {
            debug!(conversation_id = self.conversation_id.0, media = %handle.id, "call: releasing media");
            self.media.release(handle).await;
        }
    }

    fn emit(&self, state: &CallState) {
        let _ = self.events.send(CallEvent {
            conversation_id: self.conversation_id,
            phase: state.phase,
            call: state.call.clone(),
        });
    }

    fn scope_label(&self) -> String {
        Scope::calls_in(self.conversation_id).to_string()
    }
}

impl Drop for CallSignalingController {
    fn drop(&mut self) {
        let state = self.inner.get_mut();
        if let Some(task) = state.clear_task.take() {
            task.abort();
        }
        let media = state.media.take();
        let listener = self.listener.get_mut().take();
        if let Some((_, task)) = &listener {
            task.abort();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let feed = Arc::clone(&self.feed);
        let provider = Arc::clone(&self.media);
        runtime.spawn(async move {
            if let Some(handle) = media {
                provider.release(handle).await;
            }
            if let Some((scope_id, _)) = listener {
                feed.unsubscribe(scope_id).await;
            }
        });
    }
}
