use std::sync::Arc;

use integrations::{
    memory::{MemoryFeedStore, MemoryMediaDevices},
    ChangeFeedStore,
};
use shared::{
    domain::{
        CallId, CallStatus, CallType, ConversationId, MessageType, NotificationId,
        NotificationKind, UserId,
    },
    protocol::{EntityType, NewNotification, NewRow, Row},
};

use crate::{
    call::CallPhase,
    error::SyncError,
    session::{AttachmentRef, SessionCoordinator},
    test_support::{create_conversation, eventually, fast_settings, ALICE, BOB, CAROL},
    SessionContext,
};

async fn start(store: &Arc<MemoryFeedStore>, user: UserId) -> SessionCoordinator {
    SessionCoordinator::start(
        SessionContext::new(user),
        store.clone(),
        Arc::new(MemoryMediaDevices::new()),
        fast_settings(),
    )
    .await
    .expect("session start")
}

async fn notify(store: &MemoryFeedStore, user: UserId, conversation_id: Option<ConversationId>) {
    store
        .insert(NewRow::Notification(NewNotification {
            user_id: user,
            conversation_id,
            kind: NotificationKind::Message,
            title: "New message".to_string(),
            body: None,
        }))
        .await
        .expect("notification");
}

async fn call_status(store: &MemoryFeedStore, id: CallId) -> CallStatus {
    match store.row(EntityType::Call, id.0).await {
        Some(Row::Call(call)) => call.status,
        other => panic!("expected call row, got {other:?}"),
    }
}

async fn phase_in(session: &SessionCoordinator, conversation_id: ConversationId) -> Option<CallPhase> {
    session
        .call_snapshots()
        .await
        .into_iter()
        .find(|snapshot| snapshot.conversation_id == conversation_id)
        .map(|snapshot| snapshot.phase)
}

fn attachment(url: &str, name: &str) -> AttachmentRef {
    AttachmentRef {
        url: url.to_string(),
        name: name.to_string(),
    }
}

#[tokio::test]
async fn start_loads_member_conversations_and_recent_notifications() {
    let store = Arc::new(MemoryFeedStore::new());
    create_conversation(&store, Some("one"), &[ALICE, BOB]).await;
    create_conversation(&store, Some("two"), &[ALICE, CAROL]).await;
    create_conversation(&store, Some("other"), &[BOB, CAROL]).await;
    for _ in 0..55 {
        notify(&store, ALICE, None).await;
    }
    notify(&store, BOB, None).await;

    let session = start(&store, ALICE).await;
    assert_eq!(session.conversations().await.len(), 2);
    let notifications = session.notifications().await;
    assert_eq!(notifications.len(), 50);
    assert_eq!(notifications.first().map(|n| n.id), Some(NotificationId(55)));
    assert_eq!(session.unread_notifications().await, 50);
    assert_eq!(session.feed().active_scopes().await, 2);
    assert!(!session.conversations_stale().await);

    session.shutdown().await;
}

#[tokio::test]
async fn sending_requires_a_selection_and_content() {
    let store = Arc::new(MemoryFeedStore::new());
    let quiet = create_conversation(&store, Some("quiet"), &[ALICE, BOB]).await;
    let busy = create_conversation(&store, Some("busy"), &[ALICE, BOB]).await;
    let session = start(&store, ALICE).await;
    assert_eq!(session.conversations().await.first().map(|c| c.id), Some(busy));

    assert_eq!(
        session.send_message("hello").await.expect_err("no selection"),
        SyncError::NoSelection
    );
    assert!(matches!(
        session.send_message("   ").await,
        Err(SyncError::Validation(_))
    ));

    session.select_conversation(quiet).await.expect("select");
    assert_eq!(session.selected_conversation().await, Some(quiet));
    let sent = session.send_message("  hello  ").await.expect("send");
    assert_eq!(sent.content, "hello");
    assert_eq!(sent.sender_id, ALICE);

    let s = &session;
    eventually("message echoed", || async move { s.messages().await.len() == 1 }).await;
    assert_eq!(session.latest_message().await.map(|m| m.id), Some(sent.id));
    eventually("sent-to conversation first", || async move {
        s.conversations().await.first().map(|c| c.id) == Some(quiet)
    })
    .await;

    session.shutdown().await;
}

#[tokio::test]
async fn attachments_are_validated_and_labelled() {
    let store = Arc::new(MemoryFeedStore::new());
    let conversation_id = create_conversation(&store, None, &[ALICE, BOB]).await;
    let session = start(&store, ALICE).await;
    session
        .select_conversation(conversation_id)
        .await
        .expect("select");

    let url = "https://blobs.local/a/1";
    assert!(matches!(
        session
            .send_attachment(attachment(url, "x"), MessageType::Text)
            .await,
        Err(SyncError::Validation(_))
    ));
    assert!(matches!(
        session
            .send_attachment(attachment(" ", "x.png"), MessageType::Image)
            .await,
        Err(SyncError::Validation(_))
    ));
    assert!(matches!(
        session
            .send_attachment(attachment(url, ""), MessageType::File)
            .await,
        Err(SyncError::Validation(_))
    ));

    let voice = session
        .send_attachment(attachment(url, ""), MessageType::Voice)
        .await
        .expect("voice");
    assert_eq!(voice.content, "Voice message");
    assert_eq!(voice.attachment_url.as_deref(), Some(url));

    let image = session
        .send_attachment(attachment(url, "cat.png"), MessageType::Image)
        .await
        .expect("image");
    assert_eq!(image.content, "cat.png");
    assert_eq!(image.message_type, MessageType::Image);

    session.shutdown().await;
}

#[tokio::test]
async fn marking_notifications_read() {
    let store = Arc::new(MemoryFeedStore::new());
    let conversation_id = create_conversation(&store, None, &[ALICE, BOB]).await;
    notify(&store, ALICE, Some(conversation_id)).await;
    notify(&store, ALICE, None).await;
    let session = start(&store, ALICE).await;
    assert_eq!(session.unread_notifications_for(conversation_id).await, 1);

    let err = session
        .mark_notification_read(NotificationId(404))
        .await
        .expect_err("unknown");
    assert!(matches!(err, SyncError::NotFound(_)));

    session
        .mark_notification_read(NotificationId(1))
        .await
        .expect("mark");
    let s = &session;
    eventually("read flag echoed", || async move {
        s.unread_notifications().await == 1
    })
    .await;
    assert_eq!(session.unread_notifications_for(conversation_id).await, 0);

    let events = store.event_log().await.len();
    session
        .mark_notification_read(NotificationId(1))
        .await
        .expect("already read");
    assert_eq!(store.event_log().await.len(), events);

    session.shutdown().await;
}

#[tokio::test]
async fn switching_conversations_swaps_scopes() {
    let store = Arc::new(MemoryFeedStore::new());
    let first = create_conversation(&store, None, &[ALICE, BOB]).await;
    let second = create_conversation(&store, None, &[ALICE, CAROL]).await;
    let session = start(&store, ALICE).await;
    let feed = session.feed().clone();

    session.select_conversation(first).await.expect("first");
    assert_eq!(feed.active_scopes().await, 4);
    session.select_conversation(first).await.expect("again");
    assert_eq!(feed.active_scopes().await, 4);

    session.select_conversation(second).await.expect("second");
    assert_eq!(feed.active_scopes().await, 4);
    assert!(session.messages().await.is_empty());

    session.clear_selection().await;
    assert_eq!(feed.active_scopes().await, 2);
    assert!(session.call_snapshot().await.is_none());
    assert_eq!(
        session
            .initiate_call(CallType::Audio, None)
            .await
            .expect_err("nothing selected"),
        SyncError::NoSelection
    );

    session.shutdown().await;
    assert_eq!(feed.active_scopes().await, 0);
    assert_eq!(store.subscriber_count().await, 0);
    assert!(matches!(
        session.select_conversation(first).await,
        Err(SyncError::ScopeClosed(_))
    ));
}

#[tokio::test]
async fn live_call_survives_navigation() {
    let store = Arc::new(MemoryFeedStore::new());
    let with_bob = create_conversation(&store, None, &[ALICE, BOB]).await;
    let with_carol = create_conversation(&store, None, &[ALICE, CAROL]).await;
    let alice = start(&store, ALICE).await;
    let bob = start(&store, BOB).await;
    alice.select_conversation(with_bob).await.expect("select");
    bob.select_conversation(with_bob).await.expect("select");

    alice
        .initiate_call(CallType::Audio, Some(BOB))
        .await
        .expect("initiate");
    let b = &bob;
    eventually("bob ringing", || async move {
        b.call_snapshot().await.map(|s| s.phase) == Some(CallPhase::IncomingRinging)
    })
    .await;
    bob.accept_call().await.expect("accept");

    let a = &alice;
    eventually("alice connected", || async move {
        a.call_snapshot().await.map(|s| s.phase) == Some(CallPhase::Active)
    })
    .await;

    alice.select_conversation(with_carol).await.expect("navigate");
    assert_eq!(alice.feed().active_scopes().await, 5);
    let snapshot = alice.call_snapshot().await.expect("live call");
    assert_eq!(snapshot.conversation_id, with_bob);
    assert_eq!(snapshot.phase, CallPhase::Active);
    assert_eq!(
        alice
            .initiate_call(CallType::Video, None)
            .await
            .expect_err("one call at a time"),
        SyncError::CallBusy
    );

    alice.end_call().await.expect("end");
    eventually("bob sees the end", || async move {
        b.call_snapshot().await.map(|s| s.phase) != Some(CallPhase::Active)
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
    assert_eq!(store.subscriber_count().await, 0);
}

#[tokio::test]
async fn call_actions_reach_the_call_they_are_meant_for() {
    let store = Arc::new(MemoryFeedStore::new());
    let with_bob = create_conversation(&store, None, &[ALICE, BOB]).await;
    let with_carol = create_conversation(&store, None, &[ALICE, CAROL]).await;
    let alice = start(&store, ALICE).await;
    let bob = start(&store, BOB).await;
    let carol = start(&store, CAROL).await;
    alice.select_conversation(with_bob).await.expect("select");
    bob.select_conversation(with_bob).await.expect("select");

    let bob_call = alice
        .initiate_call(CallType::Audio, Some(BOB))
        .await
        .expect("initiate");
    let b = &bob;
    eventually("bob ringing", || async move {
        b.call_snapshot().await.map(|s| s.phase) == Some(CallPhase::IncomingRinging)
    })
    .await;
    bob.accept_call().await.expect("accept");
    let a = &alice;
    eventually("alice connected", || async move {
        phase_in(a, with_bob).await == Some(CallPhase::Active)
    })
    .await;

    alice.select_conversation(with_carol).await.expect("navigate");
    carol.select_conversation(with_carol).await.expect("select");
    let c = &carol;
    for _ in 0..4 {
        carol
            .initiate_call(CallType::Audio, Some(ALICE))
            .await
            .expect("carol rings");
        eventually("alice ringing", || async move {
            phase_in(a, with_carol).await == Some(CallPhase::IncomingRinging)
        })
        .await;
        assert_eq!(
            alice.call_snapshot().await.map(|s| s.conversation_id),
            Some(with_bob)
        );

        alice.decline_call().await.expect("decline carol");
        assert_eq!(phase_in(&alice, with_carol).await, Some(CallPhase::Idle));
        assert_eq!(phase_in(&alice, with_bob).await, Some(CallPhase::Active));
        assert_eq!(call_status(&store, bob_call.id).await, CallStatus::Active);
        eventually("carol stopped ringing", || async move {
            c.call_snapshot().await.map(|s| s.phase) == Some(CallPhase::Idle)
        })
        .await;
    }

    carol
        .initiate_call(CallType::Video, Some(ALICE))
        .await
        .expect("carol rings again");
    eventually("alice ringing", || async move {
        phase_in(a, with_carol).await == Some(CallPhase::IncomingRinging)
    })
    .await;
    assert_eq!(
        alice.accept_call().await.expect_err("still on the bob call"),
        SyncError::CallBusy
    );
    assert_eq!(phase_in(&alice, with_carol).await, Some(CallPhase::IncomingRinging));

    alice.end_call().await.expect("hang up on bob");
    assert_eq!(phase_in(&alice, with_bob).await, Some(CallPhase::Ended));
    assert_eq!(call_status(&store, bob_call.id).await, CallStatus::Ended);
    alice.accept_call().await.expect("answer carol");
    eventually("carol connected", || async move {
        c.call_snapshot().await.map(|s| s.phase) == Some(CallPhase::Active)
    })
    .await;
    eventually("alice on the carol call", || async move {
        phase_in(a, with_carol).await == Some(CallPhase::Active)
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
    carol.shutdown().await;
}

#[tokio::test]
async fn ended_call_blocks_new_calls_until_the_grace_passes() {
    let store = Arc::new(MemoryFeedStore::new());
    let with_bob = create_conversation(&store, None, &[ALICE, BOB]).await;
    let with_carol = create_conversation(&store, None, &[ALICE, CAROL]).await;
    let alice = start(&store, ALICE).await;
    let bob = start(&store, BOB).await;
    alice.select_conversation(with_bob).await.expect("select");
    bob.select_conversation(with_bob).await.expect("select");

    alice
        .initiate_call(CallType::Audio, Some(BOB))
        .await
        .expect("initiate");
    let b = &bob;
    eventually("bob ringing", || async move {
        b.call_snapshot().await.map(|s| s.phase) == Some(CallPhase::IncomingRinging)
    })
    .await;
    bob.accept_call().await.expect("accept");
    let a = &alice;
    eventually("alice connected", || async move {
        a.call_snapshot().await.map(|s| s.phase) == Some(CallPhase::Active)
    })
    .await;

    alice.end_call().await.expect("end");
    alice.select_conversation(with_carol).await.expect("navigate");
    let snapshot = alice.call_snapshot().await.expect("ended call still shown");
    assert_eq!(snapshot.conversation_id, with_bob);
    assert_eq!(snapshot.phase, CallPhase::Ended);
    assert_eq!(
        alice
            .initiate_call(CallType::Audio, Some(CAROL))
            .await
            .expect_err("busy during grace"),
        SyncError::CallBusy
    );

    eventually("grace over", || async move {
        phase_in(a, with_bob).await != Some(CallPhase::Ended)
    })
    .await;
    let call = alice
        .initiate_call(CallType::Audio, Some(CAROL))
        .await
        .expect("initiate after grace");
    assert_eq!(call.conversation_id, with_carol);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn search_matches_display_names() {
    let store = Arc::new(MemoryFeedStore::new());
    create_conversation(&store, Some("Design Team"), &[ALICE, BOB, CAROL]).await;
    create_conversation(&store, Some("Ops"), &[ALICE, BOB, CAROL]).await;
    create_conversation(&store, None, &[ALICE, BOB]).await;
    let session = start(&store, ALICE).await;

    let names = |rows: Vec<shared::domain::Conversation>| -> Vec<String> {
        rows.iter().map(|c| c.display_name().to_string()).collect()
    };
    assert_eq!(names(session.search_conversations("  design ").await), ["Design Team"]);
    assert_eq!(names(session.search_conversations("direct").await), ["Direct Message"]);
    assert_eq!(session.search_conversations("").await.len(), 3);
    assert!(session.search_conversations("zzz").await.is_empty());

    session.shutdown().await;
}
