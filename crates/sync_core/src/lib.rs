//! Client-side realtime sync: typed change-feed subscriptions, local entity mirrors, call
//! signalling and the per-user session that ties them to a selected conversation.

use shared::domain::UserId;

pub mod call;
pub mod config;
pub mod error;
pub mod feed;
pub mod mirror;
pub mod retry;
pub mod session;
pub mod views;

pub use call::{CallEvent, CallPhase, CallSignalingController, CallSnapshot, PendingAction};
pub use config::{load_settings, EngineSettings};
pub use error::SyncError;
pub use feed::{
    ChangeFeedClient, FeedStatus, FeedStatusEvent, ScopeId, ScopeSignal, ScopeSnapshot,
    ScopeSubscription,
};
pub use mirror::{EntityMirror, MirrorCollection, MirrorEvent};
pub use session::{AttachmentRef, SessionCoordinator};

/// Who the engine acts for. Passed explicitly to everything that needs an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionContext {
    pub user_id: UserId,
}

impl SessionContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod feed_tests;

#[cfg(test)]
#[path = "tests/mirror_tests.rs"]
mod mirror_tests;

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod call_tests;

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod session_tests;
