use std::{collections::HashSet, sync::Arc};

use shared::protocol::{Change, Entity, Scope};
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    error::SyncError,
    feed::{ChangeFeedClient, ScopeId, ScopeSignal, ScopeSubscription},
};

/// Rows of one entity kept in display order, at most one per id.
///
/// Deleted ids are remembered until the next reset, so a late insert or update for a row that
/// is already gone cannot bring it back. Stores never reuse ids.
#[derive(Debug, Clone)]
pub struct MirrorCollection<T: Entity> {
    rows: Vec<T>,
    ids: HashSet<T::Id>,
    deleted: HashSet<T::Id>,
}

impl<T: Entity> Default for MirrorCollection<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            ids: HashSet::new(),
            deleted: HashSet::new(),
        }
    }
}

impl<T: Entity> MirrorCollection<T> {
    pub fn from_rows(rows: Vec<T>) -> Self {
        let mut collection = Self::default();
        collection.reset(rows);
        collection
    }

    /// Replaces the contents wholesale. Later duplicates of an id win.
    pub fn reset(&mut self, rows: Vec<T>) {
        self.rows.clear();
        self.ids.clear();
        self.deleted.clear();
        for row in rows {
            self.upsert(row);
        }
    }

    /// Returns whether the visible state changed.
    pub fn apply(&mut self, change: Change<T>) -> bool {
        match change {
            Change::Insert(row) => {
                if self.ids.contains(&row.id()) || self.deleted.contains(&row.id()) {
                    return false;
                }
                self.insert_sorted(row);
                true
            }
            Change::Update(row) => {
                if self.deleted.contains(&row.id()) {
                    return false;
                }
                self.upsert(row)
            }
            Change::Delete(row) => {
                self.deleted.insert(row.id());
                self.remove(row.id()).is_some()
            }
        }
    }

    pub fn get(&self, id: T::Id) -> Option<&T> {
        if !self.ids.contains(&id) {
            return None;
        }
        self.rows.iter().find(|row| row.id() == id)
    }

    pub fn contains(&self, id: T::Id) -> bool {
        self.ids.contains(&id)
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn upsert(&mut self, row: T) -> bool {
        if let Some(existing) = self.get(row.id()) {
            if *existing == row {
                return false;
            }
            // The sort key may have moved, so re-place rather than overwrite.
            self.remove(row.id());
        }
        self.insert_sorted(row);
        true
    }

    fn insert_sorted(&mut self, row: T) {
        let at = self
            .rows
            .partition_point(|existing| T::display_order(existing, &row).is_lt());
        self.ids.insert(row.id());
        self.rows.insert(at, row);
    }

    fn remove(&mut self, id: T::Id) -> Option<T> {
        if !self.ids.remove(&id) {
            return None;
        }
        let at = self.rows.iter().position(|row| row.id() == id)?;
        Some(self.rows.remove(at))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    /// State was replaced by a snapshot.
    Reset,
    Changed,
    Stale,
    Failed(SyncError),
}

struct MirrorState<T: Entity> {
    rows: MirrorCollection<T>,
    stale: bool,
    failure: Option<SyncError>,
}

/// A local, ordered copy of one scope that follows the change feed.
///
/// Writes go to the store and come back through the feed; nothing mutates the mirror directly.
pub struct EntityMirror<T: Entity> {
    scope: Scope,
    scope_id: ScopeId,
    feed: Arc<ChangeFeedClient>,
    state: Arc<RwLock<MirrorState<T>>>,
    updates: broadcast::Sender<MirrorEvent>,
    task: JoinHandle<()>,
    closed: bool,
}

impl<T: Entity> EntityMirror<T> {
    /// Subscribes and waits for the initial snapshot before returning.
    pub async fn open(
        feed: Arc<ChangeFeedClient>,
        scope: Scope,
        limit: Option<usize>,
    ) -> Result<Self, SyncError> {
        let mut subscription = feed.subscribe::<T>(scope, limit).await?;
        let initial = match subscription.recv().await {
            Some(ScopeSignal::Snapshot(rows)) => rows,
            Some(ScopeSignal::Failed(err)) => {
                feed.unsubscribe(subscription.id).await;
                return Err(err);
            }
            Some(_) | None => {
                feed.unsubscribe(subscription.id).await;
                return Err(SyncError::ScopeClosed(scope.to_string()));
            }
        };

        let scope_id = subscription.id;
        let state = Arc::new(RwLock::new(MirrorState {
            rows: MirrorCollection::from_rows(initial),
            stale: false,
            failure: None,
        }));
        let (updates, _) = broadcast::channel(256);
        let task = tokio::spawn(reduce(subscription, Arc::clone(&state), updates.clone()));
        debug!(scope_id = scope_id.0, %scope, "mirror: opened");

        Ok(Self {
            scope,
            scope_id,
            feed,
            state,
            updates,
            task,
            closed: false,
        })
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub async fn rows(&self) -> Vec<T> {
        self.state.read().await.rows.rows().to_vec()
    }

    pub async fn get(&self, id: T::Id) -> Option<T> {
        self.state.read().await.rows.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.rows.is_empty()
    }

    /// Runs `f` against the current rows without cloning them.
    pub async fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(self.state.read().await.rows.rows())
    }

    /// True between a disconnect and the snapshot that follows it.
    pub async fn is_stale(&self) -> bool {
        self.state.read().await.stale
    }

    pub async fn failure(&self) -> Option<SyncError> {
        self.state.read().await.failure.clone()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<MirrorEvent> {
        self.updates.subscribe()
    }

    pub async fn resync(&self) -> Result<(), SyncError> {
        self.feed.request_resync(self.scope_id).await
    }

    pub async fn close(mut self) {
        self.closed = true;
        self.task.abort();
        self.feed.unsubscribe(self.scope_id).await;
        debug!(scope_id = self.scope_id.0, scope = %self.scope, "mirror: closed");
    }
}

impl<T: Entity> Drop for EntityMirror<T> {
    fn drop(&mut self) {
        self.task.abort();
        if self.closed {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let feed = Arc::clone(&self.feed);
            let scope_id = self.scope_id;
            runtime.spawn(async move { feed.unsubscribe(scope_id).await });
        }
    }
}

async fn reduce<T: Entity>(
    mut subscription: ScopeSubscription<T>,
    state: Arc<RwLock<MirrorState<T>>>,
    updates: broadcast::Sender<MirrorEvent>,
) {
    while let Some(signal) = subscription.recv().await {
        let event = {
            let mut guard = state.write().await;
            match signal {
                ScopeSignal::Snapshot(rows) => {
                    guard.rows.reset(rows);
                    guard.stale = false;
                    guard.failure = None;
                    Some(MirrorEvent::Reset)
                }
                ScopeSignal::Change(change) => {
                    guard.rows.apply(change).then_some(MirrorEvent::Changed)
                }
                ScopeSignal::Disconnected => {
                    guard.stale = true;
                    Some(MirrorEvent::Stale)
                }
                ScopeSignal::Failed(err) => {
                    warn!(scope = %subscription.scope, "mirror: scope failed: {err}");
                    guard.stale = true;
                    guard.failure = Some(err.clone());
                    Some(MirrorEvent::Failed(err))
                }
            }
        };
        if let Some(event) = event {
            let _ = updates.send(event);
        }
    }
}
