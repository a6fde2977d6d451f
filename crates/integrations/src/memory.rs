//! In-process collaborators: a change-feed store, media devices and a blob store, each with
//! fault-injection knobs so races and outages can be reproduced deterministically.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ConversationId, UserId},
    error::StoreError,
    protocol::{
        EntityType, FeedEvent, FeedOperation, NewRow, Patch, Row, Scope, SnapshotQuery,
    },
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    BlobStore, ChangeFeedStore, FeedSignal, MediaDeviceProvider, MediaError, MediaHandle,
    MediaKind, Snapshot, StoreSubscription, SubscriptionHandle,
};

struct MemorySubscriber {
    scope: Scope,
    events: mpsc::UnboundedSender<FeedSignal>,
}

#[derive(Default)]
struct MemoryFeedState {
    last_event_id: u64,
    next_row_ids: HashMap<EntityType, i64>,
    rows: HashMap<EntityType, BTreeMap<i64, Row>>,
    members: HashMap<ConversationId, HashSet<UserId>>,
    log: Vec<FeedEvent>,
    subscribers: HashMap<SubscriptionHandle, MemorySubscriber>,
    next_handle: u64,
    delivery_paused: bool,
    rejected_scopes: HashSet<Scope>,
    subscribe_failures: VecDeque<StoreError>,
    snapshot_failures: VecDeque<StoreError>,
    mutation_failures: VecDeque<StoreError>,
    subscribe_calls: usize,
    snapshot_calls: usize,
}

impl MemoryFeedState {
    fn next_row_id(&mut self, entity: EntityType) -> i64 {
        let next = self.next_row_ids.entry(entity).or_insert(1);
        let id = *next;
        *next += 1;
        id
    }

    fn store_row(&mut self, row: Row) {
        let entity = row.entity_type();
        let next = self.next_row_ids.entry(entity).or_insert(1);
        if *next <= row.raw_id() {
            *next = row.raw_id() + 1;
        }
        self.rows.entry(entity).or_default().insert(row.raw_id(), row);
    }

    fn row(&self, entity: EntityType, id: i64) -> Option<&Row> {
        self.rows.get(&entity).and_then(|rows| rows.get(&id))
    }

    fn commit(&mut self, op: FeedOperation, row: Row) -> FeedEvent {
        self.last_event_id += 1;
        let event = FeedEvent {
            event_id: self.last_event_id,
            op,
            row,
        };
        self.log.push(event.clone());
        if !self.delivery_paused {
            fan_out(&self.members, &mut self.subscribers, &event);
        }
        event
    }

    fn touch_conversation(&mut self, conversation_id: ConversationId) {
        let Some(Row::Conversation(mut conversation)) = self
            .row(EntityType::Conversation, conversation_id.0)
            .cloned()
        else {
            return;
        };
        conversation.updated_at = Utc::now();
        let row = Row::Conversation(conversation);
        self.store_row(row.clone());
        self.commit(FeedOperation::Update, row);
    }
}

fn fan_out(
    members: &HashMap<ConversationId, HashSet<UserId>>,
    subscribers: &mut HashMap<SubscriptionHandle, MemorySubscriber>,
    event: &FeedEvent,
) {
    subscribers.retain(|handle, subscriber| {
        let is_member = |conversation_id: ConversationId, user_id: UserId| {
            members
                .get(&conversation_id)
                .is_some_and(|users| users.contains(&user_id))
        };
        if !subscriber.scope.matches(&event.row, is_member) {
            return true;
        }
        let delivered = subscriber
            .events
            .send(FeedSignal::Event(event.clone()))
            .is_ok();
        if !delivered {
            debug!(handle = handle.0, "store: pruning closed subscriber");
        }
        delivered
    });
}

/// Change-feed store kept entirely in memory. Every mutation is committed and fanned out under
/// one lock, so per-scope delivery follows commit order.
pub struct MemoryFeedStore {
    inner: Mutex<MemoryFeedState>,
    snapshot_gate: watch::Sender<bool>,
}

impl Default for MemoryFeedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeedStore {
    pub fn new() -> Self {
        let (snapshot_gate, _) = watch::channel(true);
        Self {
            inner: Mutex::new(MemoryFeedState::default()),
            snapshot_gate,
        }
    }

    /// Adds a member and emits a conversation update so the member's scope picks it up.
    pub async fn add_member(&self, conversation_id: ConversationId, user_id: UserId) {
        let mut guard = self.inner.lock().await;
        guard
            .members
            .entry(conversation_id)
            .or_default()
            .insert(user_id);
        guard.touch_conversation(conversation_id);
    }

    /// Writes a fully formed row as-is and emits it, bypassing validation.
    pub async fn publish(&self, op: FeedOperation, row: Row) -> FeedEvent {
        let mut guard = self.inner.lock().await;
        match op {
            FeedOperation::Delete => {
                if let Some(rows) = guard.rows.get_mut(&row.entity_type()) {
                    rows.remove(&row.raw_id());
                }
            }
            FeedOperation::Insert | FeedOperation::Update => guard.store_row(row.clone()),
        }
        guard.commit(op, row)
    }

    /// Delivers an already committed event again, as a flaky transport would.
    pub async fn replay(&self, event: &FeedEvent) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        fan_out(&state.members, &mut state.subscribers, event);
    }

    /// Signals `Disconnected` to every subscriber and forgets them.
    pub async fn disconnect_all(&self) {
        let mut guard = self.inner.lock().await;
        for (_, subscriber) in guard.subscribers.drain() {
            let _ = subscriber.events.send(FeedSignal::Disconnected);
        }
    }

    /// Commits keep happening but are not delivered until `resume_delivery`.
    pub async fn pause_delivery(&self) {
        self.inner.lock().await.delivery_paused = true;
    }

    pub async fn resume_delivery(&self) {
        self.inner.lock().await.delivery_paused = false;
    }

    pub async fn reject_scope(&self, scope: Scope) {
        self.inner.lock().await.rejected_scopes.insert(scope);
    }

    pub async fn fail_next_subscribe(&self, err: StoreError) {
        self.inner.lock().await.subscribe_failures.push_back(err);
    }

    pub async fn fail_next_snapshot(&self, err: StoreError) {
        self.inner.lock().await.snapshot_failures.push_back(err);
    }

    pub async fn fail_next_mutation(&self, err: StoreError) {
        self.inner.lock().await.mutation_failures.push_back(err);
    }

    /// Parks snapshot fetches until `release_snapshots`.
    pub fn hold_snapshots(&self) {
        self.snapshot_gate.send_replace(false);
    }

    pub fn release_snapshots(&self) {
        self.snapshot_gate.send_replace(true);
    }

    pub async fn row(&self, entity: EntityType, id: i64) -> Option<Row> {
        self.inner.lock().await.row(entity, id).cloned()
    }

    pub async fn rows(&self, entity: EntityType) -> Vec<Row> {
        self.inner
            .lock()
            .await
            .rows
            .get(&entity)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn event_log(&self) -> Vec<FeedEvent> {
        self.inner.lock().await.log.clone()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    pub async fn subscribe_calls(&self) -> usize {
        self.inner.lock().await.subscribe_calls
    }

    pub async fn snapshot_calls(&self) -> usize {
        self.inner.lock().await.snapshot_calls
    }

    async fn wait_for_snapshot_gate(&self) {
        let mut gate = self.snapshot_gate.subscribe();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl ChangeFeedStore for MemoryFeedStore {
    async fn fetch_snapshot(&self, query: &SnapshotQuery) -> Result<Snapshot, StoreError> {
        self.wait_for_snapshot_gate().await;
        let mut guard = self.inner.lock().await;
        guard.snapshot_calls += 1;
        if let Some(err) = guard.snapshot_failures.pop_front() {
            return Err(err);
        }
        if guard.rejected_scopes.contains(&query.scope) {
            return Err(StoreError::unauthorized(format!(
                "scope {} rejected",
                query.scope
            )));
        }

        let state = &*guard;
        let is_member = |conversation_id: ConversationId, user_id: UserId| {
            state
                .members
                .get(&conversation_id)
                .is_some_and(|users| users.contains(&user_id))
        };
        let rows = state
            .rows
            .get(&query.scope.entity)
            .map(|rows| {
                rows.values()
                    .filter(|row| query.scope.matches(row, is_member))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Snapshot {
            rows: query.arrange(rows),
            cursor: state.last_event_id,
        })
    }

    async fn insert(&self, row: NewRow) -> Result<Row, StoreError> {
        let mut guard = self.inner.lock().await;
        if let Some(err) = guard.mutation_failures.pop_front() {
            return Err(err);
        }
        row.validate()?;

        let entity = row.entity_type();
        let id = guard.next_row_id(entity);
        let members = match &row {
            NewRow::Conversation(new) => new.members.clone(),
            _ => Vec::new(),
        };
        let bumped_conversation = match &row {
            NewRow::Message(new) => Some(new.conversation_id),
            _ => None,
        };

        let stored = row.into_row(id, Utc::now());
        if !members.is_empty() {
            guard
                .members
                .entry(stored.conversation_id().unwrap_or(ConversationId(id)))
                .or_default()
                .extend(members);
        }
        guard.store_row(stored.clone());
        guard.commit(FeedOperation::Insert, stored.clone());
        if let Some(conversation_id) = bumped_conversation {
            guard.touch_conversation(conversation_id);
        }
        Ok(stored)
    }

    async fn update(&self, id: i64, patch: Patch) -> Result<Row, StoreError> {
        let mut guard = self.inner.lock().await;
        if let Some(err) = guard.mutation_failures.pop_front() {
            return Err(err);
        }
        let entity = patch.entity_type();
        let mut row = guard
            .row(entity, id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("{entity} {id} not found")))?;
        if patch.apply(&mut row, Utc::now())? {
            guard.store_row(row.clone());
            guard.commit(FeedOperation::Update, row.clone());
        }
        Ok(row)
    }

    async fn delete(&self, entity: EntityType, id: i64) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        if let Some(err) = guard.mutation_failures.pop_front() {
            return Err(err);
        }
        let removed = guard
            .rows
            .get_mut(&entity)
            .and_then(|rows| rows.remove(&id))
            .ok_or_else(|| StoreError::not_found(format!("{entity} {id} not found")))?;
        guard.commit(FeedOperation::Delete, removed);
        Ok(())
    }

    async fn subscribe(&self, scope: &Scope) -> Result<StoreSubscription, StoreError> {
        let mut guard = self.inner.lock().await;
        guard.subscribe_calls += 1;
        if let Some(err) = guard.subscribe_failures.pop_front() {
            return Err(err);
        }
        if guard.rejected_scopes.contains(scope) {
            return Err(StoreError::unauthorized(format!("scope {scope} rejected")));
        }

        guard.next_handle += 1;
        let handle = SubscriptionHandle(guard.next_handle);
        let (tx, rx) = mpsc::unbounded_channel();
        guard.subscribers.insert(
            handle,
            MemorySubscriber {
                scope: *scope,
                events: tx,
            },
        );
        debug!(handle = handle.0, %scope, "store: subscriber registered");
        Ok(StoreSubscription { handle, events: rx })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.inner.lock().await.subscribers.remove(&handle);
    }
}

#[derive(Default)]
struct MediaState {
    live: HashSet<Uuid>,
    acquisitions: usize,
    releases: usize,
    waiting: usize,
    failures: VecDeque<MediaError>,
}

/// Fake capture devices that count every acquisition and release.
pub struct MemoryMediaDevices {
    inner: Mutex<MediaState>,
    gate: watch::Sender<bool>,
}

impl Default for MemoryMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMediaDevices {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner: Mutex::new(MediaState::default()),
            gate,
        }
    }

    pub async fn fail_next(&self, err: MediaError) {
        self.inner.lock().await.failures.push_back(err);
    }

    /// Parks acquisitions until `resume`.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    pub async fn live_handles(&self) -> usize {
        self.inner.lock().await.live.len()
    }

    pub async fn acquisitions(&self) -> usize {
        self.inner.lock().await.acquisitions
    }

    pub async fn releases(&self) -> usize {
        self.inner.lock().await.releases
    }

    pub async fn waiting(&self) -> usize {
        self.inner.lock().await.waiting
    }
}

#[async_trait]
impl MediaDeviceProvider for MemoryMediaDevices {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaHandle, MediaError> {
        {
            let mut guard = self.inner.lock().await;
            if let Some(err) = guard.failures.pop_front() {
                return Err(err);
            }
            guard.waiting += 1;
        }

        let mut gate = self.gate.subscribe();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }

        let handle = MediaHandle::new(kind);
        let mut guard = self.inner.lock().await;
        guard.waiting -= 1;
        guard.acquisitions += 1;
        guard.live.insert(handle.id);
        Ok(handle)
    }

    async fn release(&self, handle: MediaHandle) {
        let mut guard = self.inner.lock().await;
        guard.releases += 1;
        if !guard.live.remove(&handle.id) {
            warn!(handle = %handle.id, "media: release of unknown handle");
        }
    }
}

/// Blob store keeping objects in memory and handing out `base_url/path` references.
pub struct MemoryBlobStore {
    base_url: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(path).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(StoreError::validation("blob path must not be empty"));
        }
        self.objects.lock().await.insert(path.to_string(), bytes);
        Ok(format!("{}/{path}", self.base_url.trim_end_matches('/')))
    }
}
