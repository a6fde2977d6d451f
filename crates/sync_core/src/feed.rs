//! Typed scope subscriptions over a [`ChangeFeedStore`].
//!
//! Each subscribed scope gets its own pump task. The pump subscribes to the store, takes an
//! authoritative snapshot, then forwards only events newer than the snapshot's cursor. When the
//! store connection drops it reports `Disconnected`, backs off, resubscribes and resyncs.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use integrations::{ChangeFeedStore, FeedSignal, SubscriptionHandle};
use shared::{
    error::StoreError,
    protocol::{Change, Entity, EntityType, NewRow, Patch, Row, Scope, SnapshotQuery},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::EngineSettings,
    error::SyncError,
    retry::{retry_transient, RetryPolicy},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum ScopeSignal<T> {
    /// Authoritative state; replaces whatever the consumer holds.
    Snapshot(Vec<T>),
    Change(Change<T>),
    /// Connectivity was lost. A fresh `Snapshot` follows once the scope recovers.
    Disconnected,
    /// The scope is dead and will not deliver again.
    Failed(SyncError),
}

pub struct ScopeSubscription<T> {
    pub id: ScopeId,
    pub scope: Scope,
    signals: mpsc::UnboundedReceiver<ScopeSignal<T>>,
}

impl<T> ScopeSubscription<T> {
    pub async fn recv(&mut self) -> Option<ScopeSignal<T>> {
        self.signals.recv().await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopeSnapshot<T> {
    pub rows: Vec<T>,
    pub cursor: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Live,
    Disconnected,
    Resynced,
    Failed(SyncError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedStatusEvent {
    pub scope_id: ScopeId,
    pub scope: Scope,
    pub status: FeedStatus,
}

struct ActiveScope {
    scope: Scope,
    resync: Arc<Notify>,
    store_handle: Arc<Mutex<Option<SubscriptionHandle>>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct FeedClientState {
    next_scope_id: u64,
    scopes: HashMap<ScopeId, ActiveScope>,
}

pub struct ChangeFeedClient {
    store: Arc<dyn ChangeFeedStore>,
    retry: RetryPolicy,
    mutation_timeout: Duration,
    inner: Mutex<FeedClientState>,
    status: broadcast::Sender<FeedStatusEvent>,
}

impl ChangeFeedClient {
    pub fn new(store: Arc<dyn ChangeFeedStore>, settings: &EngineSettings) -> Arc<Self> {
        let (status, _) = broadcast::channel(256);
        Arc::new(Self {
            store,
            retry: RetryPolicy::from_settings(settings),
            mutation_timeout: settings.mutation_timeout(),
            inner: Mutex::new(FeedClientState::default()),
            status,
        })
    }

    pub fn store(&self) -> &Arc<dyn ChangeFeedStore> {
        &self.store
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<FeedStatusEvent> {
        self.status.subscribe()
    }

    /// Opens a scope. The first signal is always the initial `Snapshot` or a `Failed`.
    pub async fn subscribe<T: Entity>(
        &self,
        scope: Scope,
        limit: Option<usize>,
    ) -> Result<ScopeSubscription<T>, SyncError> {
        if scope.entity != T::ENTITY_TYPE {
            return Err(SyncError::Validation(format!(
                "scope {scope} cannot carry {} rows",
                T::ENTITY_TYPE
            )));
        }

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let resync = Arc::new(Notify::new());
        let store_handle = Arc::new(Mutex::new(None));

        let mut guard = self.inner.lock().await;
        guard.next_scope_id += 1;
        let id = ScopeId(guard.next_scope_id);

        let pump = ScopePump::<T> {
            id,
            scope,
            query: SnapshotQuery::for_entity::<T>(scope, limit),
            store: Arc::clone(&self.store),
            retry: self.retry,
            signals: signals_tx,
            resync: Arc::clone(&resync),
            store_handle: Arc::clone(&store_handle),
            status: self.status.clone(),
        };
        let task = tokio::spawn(pump.run());
        guard.scopes.insert(
            id,
            ActiveScope {
                scope,
                resync,
                store_handle,
                task,
            },
        );
        debug!(scope_id = id.0, %scope, "feed: scope opened");

        Ok(ScopeSubscription {
            id,
            scope,
            signals: signals_rx,
        })
    }

    /// Closes a scope. Any snapshot still in flight for it is discarded.
    pub async fn unsubscribe(&self, id: ScopeId) {
        let Some(active) = self.inner.lock().await.scopes.remove(&id) else {
            return;
        };
        active.task.abort();
        let handle = active.store_handle.lock().await.take();
        if let Some(handle) = handle {
            self.store.unsubscribe(handle).await;
        }
        debug!(scope_id = id.0, scope = %active.scope, "feed: scope closed");
    }

    /// Asks a live scope to refetch its snapshot in place.
    pub async fn request_resync(&self, id: ScopeId) -> Result<(), SyncError> {
        let guard = self.inner.lock().await;
        let active = guard
            .scopes
            .get(&id)
            .ok_or_else(|| SyncError::ScopeClosed(format!("scope id {}", id.0)))?;
        if active.task.is_finished() {
            return Err(SyncError::ScopeClosed(active.scope.to_string()));
        }
        active.resync.notify_one();
        Ok(())
    }

    /// Authoritative one-off fetch, outside any subscription.
    pub async fn resync<T: Entity>(
        &self,
        scope: Scope,
        limit: Option<usize>,
    ) -> Result<ScopeSnapshot<T>, SyncError> {
        let query = SnapshotQuery::for_entity::<T>(scope, limit);
        fetch_typed_snapshot::<T>(&self.store, self.retry, &query).await
    }

    pub async fn active_scopes(&self) -> usize {
        self.inner.lock().await.scopes.len()
    }

    pub async fn insert(&self, row: NewRow) -> Result<Row, SyncError> {
        let store = Arc::clone(&self.store);
        let timeout = self.mutation_timeout;
        retry_transient(self.retry, "feed", || {
            let store = Arc::clone(&store);
            let row = row.clone();
            async move { with_timeout(timeout, store.insert(row)).await }
        })
        .await
    }

    pub async fn update(&self, id: i64, patch: Patch) -> Result<Row, SyncError> {
        let store = Arc::clone(&self.store);
        let timeout = self.mutation_timeout;
        retry_transient(self.retry, "feed", || {
            let store = Arc::clone(&store);
            let patch = patch.clone();
            async move { with_timeout(timeout, store.update(id, patch)).await }
        })
        .await
    }

    pub async fn delete(&self, entity: EntityType, id: i64) -> Result<(), SyncError> {
        let store = Arc::clone(&self.store);
        let timeout = self.mutation_timeout;
        retry_transient(self.retry, "feed", || {
            let store = Arc::clone(&store);
            async move { with_timeout(timeout, store.delete(entity, id)).await }
        })
        .await
    }

    pub async fn shutdown(&self) {
        let ids: Vec<ScopeId> = self.inner.lock().await.scopes.keys().copied().collect();
        for id in ids {
            self.unsubscribe(id).await;
        }
    }
}

impl Drop for ChangeFeedClient {
    fn drop(&mut self) {
        for active in self.inner.get_mut().scopes.values() {
            active.task.abort();
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    request: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, SyncError> {
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result.map_err(SyncError::from),
        Err(_) => Err(StoreError::timeout(format!(
            "store request exceeded {}ms",
            timeout.as_millis()
        ))
        .into()),
    }
}

async fn fetch_typed_snapshot<T: Entity>(
    store: &Arc<dyn ChangeFeedStore>,
    retry: RetryPolicy,
    query: &SnapshotQuery,
) -> Result<ScopeSnapshot<T>, SyncError> {
    let snapshot = retry_transient(retry, "feed", || {
        let store = Arc::clone(store);
        let query = *query;
        async move { store.fetch_snapshot(&query).await.map_err(SyncError::from) }
    })
    .await?;

    let mut rows = Vec::with_capacity(snapshot.rows.len());
    for row in snapshot.rows {
        match T::from_row(row) {
            Some(row) => rows.push(row),
            None => warn!(scope = %query.scope, "feed: snapshot row of unexpected entity dropped"),
        }
    }
    Ok(ScopeSnapshot {
        rows,
        cursor: snapshot.cursor,
    })
}

enum SessionEnd {
    Disconnected,
    Failed(SyncError),
    ConsumerGone,
}

struct ScopePump<T> {
    id: ScopeId,
    scope: Scope,
    query: SnapshotQuery,
    store: Arc<dyn ChangeFeedStore>,
    retry: RetryPolicy,
    signals: mpsc::UnboundedSender<ScopeSignal<T>>,
    resync: Arc<Notify>,
    store_handle: Arc<Mutex<Option<SubscriptionHandle>>>,
    status: broadcast::Sender<FeedStatusEvent>,
}

impl<T: Entity> ScopePump<T> {
    async fn run(self) {
        let mut consecutive_disconnects = 0u32;
        let mut first_session = true;
        loop {
            match self.session(&mut consecutive_disconnects, first_session).await {
                SessionEnd::ConsumerGone => {
                    debug!(scope_id = self.id.0, "feed: consumer gone, stopping pump");
                    break;
                }
                SessionEnd::Failed(err) => {
                    warn!(scope_id = self.id.0, scope = %self.scope, "feed: scope failed: {err}");
                    self.publish_status(FeedStatus::Failed(err.clone()));
                    let _ = self.signals.send(ScopeSignal::Failed(err));
                    break;
                }
                SessionEnd::Disconnected => {
                    first_session = false;
                    consecutive_disconnects += 1;
                    if consecutive_disconnects >= self.retry.max_attempts {
                        let err = SyncError::TransientNetwork(format!(
                            "scope {} lost its connection {consecutive_disconnects} times in a row",
                            self.scope
                        ));
                        warn!(scope_id = self.id.0, "feed: giving up on scope: {err}");
                        self.publish_status(FeedStatus::Failed(err.clone()));
                        let _ = self.signals.send(ScopeSignal::Failed(err));
                        break;
                    }
                    let delay = self.retry.delay_for(consecutive_disconnects);
                    info!(
                        scope_id = self.id.0,
                        scope = %self.scope,
                        delay_ms = delay.as_millis() as u64,
                        "feed: resubscribing after disconnect"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        self.detach().await;
    }

    async fn session(&self, consecutive_disconnects: &mut u32, first_session: bool) -> SessionEnd {
        let store = Arc::clone(&self.store);
        let scope = self.scope;
        let subscription = match retry_transient(self.retry, "feed", || {
            let store = Arc::clone(&store);
            async move { store.subscribe(&scope).await.map_err(SyncError::from) }
        })
        .await
        {
            Ok(subscription) => subscription,
            Err(err) => return SessionEnd::Failed(err),
        };
        *self.store_handle.lock().await = Some(subscription.handle);
        let mut events = subscription.events;

        // Events already reflected in the snapshot are at or below its cursor.
        let mut cursor = match fetch_typed_snapshot::<T>(&self.store, self.retry, &self.query).await {
            Ok(snapshot) => {
                if self.signals.send(ScopeSignal::Snapshot(snapshot.rows)).is_err() {
                    return SessionEnd::ConsumerGone;
                }
                *consecutive_disconnects = 0;
                self.publish_status(if first_session {
                    FeedStatus::Live
                } else {
                    FeedStatus::Resynced
                });
                snapshot.cursor
            }
            Err(err) => return SessionEnd::Failed(err),
        };

        loop {
            tokio::select! {
                signal = events.recv() => match signal {
                    Some(FeedSignal::Event(event)) => {
                        if event.event_id <= cursor {
                            debug!(
                                scope_id = self.id.0,
                                event_id = event.event_id,
                                cursor,
                                "feed: dropping already applied event"
                            );
                            continue;
                        }
                        cursor = event.event_id;
                        let event_id = event.event_id;
                        match Change::<T>::from_event(event) {
                            Some(change) => {
                                if self.signals.send(ScopeSignal::Change(change)).is_err() {
                                    return SessionEnd::ConsumerGone;
                                }
                            }
                            None => warn!(
                                scope_id = self.id.0,
                                event_id,
                                "feed: event of unexpected entity dropped"
                            ),
                        }
                    }
                    Some(FeedSignal::Disconnected) | None => {
                        self.detach().await;
                        self.publish_status(FeedStatus::Disconnected);
                        if self.signals.send(ScopeSignal::Disconnected).is_err() {
                            return SessionEnd::ConsumerGone;
                        }
                        return SessionEnd::Disconnected;
                    }
                },
                _ = self.resync.notified() => {
                    match fetch_typed_snapshot::<T>(&self.store, self.retry, &self.query).await {
                        Ok(snapshot) => {
                            cursor = cursor.max(snapshot.cursor);
                            if self.signals.send(ScopeSignal::Snapshot(snapshot.rows)).is_err() {
                                return SessionEnd::ConsumerGone;
                            }
                            self.publish_status(FeedStatus::Resynced);
                        }
                        Err(err) if err.is_transient() => {
                            warn!(scope_id = self.id.0, "feed: in-place resync failed: {err}");
                        }
                        Err(err) => return SessionEnd::Failed(err),
                    }
                }
            }
        }
    }

    async fn detach(&self) {
        let handle = self.store_handle.lock().await.take();
        if let Some(handle) = handle {
            self.store.unsubscribe(handle).await;
        }
    }

    fn publish_status(&self, status: FeedStatus) {
        let _ = self.status.send(FeedStatusEvent {
            scope_id: self.id,
            scope: self.scope,
            status,
        });
    }
}
