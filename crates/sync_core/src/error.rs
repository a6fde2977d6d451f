use integrations::MediaError;
use shared::error::{ErrorCode, StoreError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("authorization rejected: {0}")]
    AuthRejected(String),
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("conflicting state: {0}")]
    ConflictingState(String),
    #[error("a call is already in progress")]
    CallBusy,
    #[error("invalid call participants: {0}")]
    InvalidParticipants(String),
    #[error("no conversation selected")]
    NoSelection,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("scope {0} is closed")]
    ScopeClosed(String),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl SyncError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err.code {
            ErrorCode::Unavailable | ErrorCode::Timeout => SyncError::TransientNetwork(err.message),
            ErrorCode::Unauthorized | ErrorCode::Forbidden => SyncError::AuthRejected(err.message),
            ErrorCode::Conflict => SyncError::ConflictingState(err.message),
            ErrorCode::Validation => SyncError::Validation(err.message),
            ErrorCode::NotFound => SyncError::NotFound(err.message),
            ErrorCode::Internal => SyncError::Store(err),
        }
    }
}

impl From<MediaError> for SyncError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(detail) => SyncError::PermissionDenied(detail),
            MediaError::DeviceUnavailable(detail) => SyncError::DeviceUnavailable(detail),
        }
    }
}
