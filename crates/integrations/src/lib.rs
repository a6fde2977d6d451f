//! Contracts for the collaborators the engine talks to: the change-feed store, the local
//! media-device provider and the attachment blob store.

use std::fmt;

use async_trait::async_trait;
use shared::{
    domain::CallType,
    error::StoreError,
    protocol::{EntityType, FeedEvent, NewRow, Patch, Row, Scope, SnapshotQuery},
};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    Event(FeedEvent),
    /// The store lost the connection; nothing more arrives on this subscription.
    Disconnected,
}

pub struct StoreSubscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<FeedSignal>,
}

impl fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSubscription")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Rows for one scope plus the id of the last event they reflect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub rows: Vec<Row>,
    pub cursor: u64,
}

#[async_trait]
pub trait ChangeFeedStore: Send + Sync {
    async fn fetch_snapshot(&self, query: &SnapshotQuery) -> Result<Snapshot, StoreError>;
    async fn insert(&self, row: NewRow) -> Result<Row, StoreError>;
    async fn update(&self, id: i64, patch: Patch) -> Result<Row, StoreError>;
    async fn delete(&self, entity: EntityType, id: i64) -> Result<(), StoreError>;
    async fn subscribe(&self, scope: &Scope) -> Result<StoreSubscription, StoreError>;
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    AudioVideo,
}

impl From<CallType> for MediaKind {
    fn from(value: CallType) -> Self {
        match value {
            CallType::Audio => MediaKind::Audio,
            CallType::Video => MediaKind::AudioVideo,
        }
    }
}

/// An acquired set of local capture devices. Not `Clone`: exactly one owner releases it.
#[derive(Debug, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: Uuid,
    pub kind: MediaKind,
}

impl MediaHandle {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
}

#[async_trait]
pub trait MediaDeviceProvider: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaHandle, MediaError>;
    async fn release(&self, handle: MediaHandle);
}

/// Provider for hosts without capture devices; every acquisition fails.
pub struct UnavailableMediaDevices;

#[async_trait]
impl MediaDeviceProvider for UnavailableMediaDevices {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaHandle, MediaError> {
        Err(MediaError::DeviceUnavailable(format!(
            "no capture devices available for {kind:?}"
        )))
    }

    async fn release(&self, _handle: MediaHandle) {}
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the bytes and returns a public reference usable as a message attachment.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StoreError>;
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
