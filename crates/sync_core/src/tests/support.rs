use std::{future::Future, time::Duration};

use integrations::memory::MemoryFeedStore;
use shared::{
    domain::{ConversationId, ConversationKind, UserId},
    protocol::{NewConversation, NewRow},
};
use tokio::time::Instant;

use crate::{
    config::EngineSettings,
    feed::{ScopeSignal, ScopeSubscription},
};

pub(crate) const ALICE: UserId = UserId(1);
pub(crate) const BOB: UserId = UserId(2);
pub(crate) const CAROL: UserId = UserId(3);

pub(crate) fn fast_settings() -> EngineSettings {
    EngineSettings {
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 20,
        retry_max_attempts: 4,
        mutation_timeout_ms: 1_000,
        call_end_grace_ms: 300,
        ..EngineSettings::default()
    }
}

/// Polls `check` until it holds, failing the test after two seconds.
pub(crate) async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub(crate) async fn next_signal<T>(subscription: &mut ScopeSubscription<T>) -> ScopeSignal<T> {
    tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("signal before timeout")
        .expect("scope still open")
}

pub(crate) async fn create_conversation(
    store: &MemoryFeedStore,
    name: Option<&str>,
    members: &[UserId],
) -> ConversationId {
    use integrations::ChangeFeedStore;

    let row = store
        .insert(NewRow::Conversation(NewConversation {
            name: name.map(str::to_string),
            kind: if members.len() > 2 {
                ConversationKind::Group
            } else {
                ConversationKind::Direct
            },
            members: members.to_vec(),
        }))
        .await
        .expect("conversation");
    ConversationId(row.raw_id())
}
