use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use integrations::{
    memory::{MemoryBlobStore, MemoryFeedStore, MemoryMediaDevices},
    BlobStore, ChangeFeedStore,
};
use shared::{
    domain::{CallType, ConversationId, ConversationKind, MessageType, UserId},
    protocol::{NewConversation, NewRow},
};
use storage::SqliteFeedStore;
use sync_core::{
    load_settings, views, AttachmentRef, CallPhase, SessionContext, SessionCoordinator,
};
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// SQLite database to sync through. An in-memory store is used when omitted.
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long, default_value_t = 1)]
    caller: i64,
    #[arg(long, default_value_t = 2)]
    callee: i64,
    /// How long the demo call stays connected.
    #[arg(long, default_value_t = 2)]
    call_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();
    if args.caller == args.callee {
        bail!("caller and callee must be different users");
    }
    let settings = load_settings()?;

    let store: Arc<dyn ChangeFeedStore> = match &args.database_url {
        Some(url) => Arc::new(SqliteFeedStore::new(url).await?),
        None => Arc::new(MemoryFeedStore::new()),
    };
    let caller_id = UserId(args.caller);
    let callee_id = UserId(args.callee);

    let row = store
        .insert(NewRow::Conversation(NewConversation {
            name: None,
            kind: ConversationKind::Direct,
            members: vec![caller_id, callee_id],
        }))
        .await
        .context("creating demo conversation")?;
    let conversation_id = ConversationId(row.raw_id());
    info!(conversation_id = conversation_id.0, "demo: conversation ready");

    let caller = SessionCoordinator::start(
        SessionContext::new(caller_id),
        Arc::clone(&store),
        Arc::new(MemoryMediaDevices::new()),
        settings.clone(),
    )
    .await?;
    let callee = SessionCoordinator::start(
        SessionContext::new(callee_id),
        Arc::clone(&store),
        Arc::new(MemoryMediaDevices::new()),
        settings.clone(),
    )
    .await?;
    caller.select_conversation(conversation_id).await?;
    callee.select_conversation(conversation_id).await?;

    caller.send_message("hey, got a minute?").await?;
    callee.send_message("sure, call me").await?;

    let blobs = MemoryBlobStore::new("memory://blobs");
    let url = blobs
        .put("notes/agenda.txt", b"1. sync engine".to_vec())
        .await
        .context("uploading attachment")?;
    caller
        .send_attachment(
            AttachmentRef {
                url,
                name: "agenda.txt".to_string(),
            },
            views::attachment_type_for_mime("text/plain"),
        )
        .await?;
    wait_until("messages to reach both sides", || async {
        callee.messages().await.len() == 3 && caller.messages().await.len() == 3
    })
    .await?;

    caller.initiate_call(CallType::Audio, Some(callee_id)).await?;
    wait_until("the call to ring", || async {
        callee.call_snapshot().await.map(|snapshot| snapshot.phase)
            == Some(CallPhase::IncomingRinging)
    })
    .await?;
    callee.accept_call().await?;
    wait_until("both sides to connect", || async {
        caller.call_snapshot().await.map(|snapshot| snapshot.phase) == Some(CallPhase::Active)
            && callee.call_snapshot().await.map(|snapshot| snapshot.phase)
                == Some(CallPhase::Active)
    })
    .await?;

    tokio::time::sleep(Duration::from_secs(args.call_seconds)).await;
    caller.end_call().await?;
    if let Some(snapshot) = caller.call_snapshot().await {
        println!("call ended after {}", snapshot.formatted_duration);
    }

    let now = Utc::now();
    for message in callee.messages().await {
        let label = match message.message_type {
            MessageType::Text => message.content.clone(),
            _ => format!("[{:?}] {}", message.message_type, message.content),
        };
        println!(
            "{:>8}  user {}: {label}",
            views::format_relative_time(message.created_at, now),
            message.sender_id.0
        );
    }
    for conversation in callee.conversations().await {
        println!(
            "conversation {} ({}), unread notifications: {}",
            conversation.id.0,
            conversation.display_name(),
            callee.unread_notifications_for(conversation.id).await
        );
    }

    caller.shutdown().await;
    callee.shutdown().await;
    Ok(())
}

async fn wait_until<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
