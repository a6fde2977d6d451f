use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use integrations::ChangeFeedStore;
use shared::{
    domain::{ConversationId, ConversationKind, NotificationKind, UserId},
    protocol::{EntityType, NewConversation, NewNotification, NewRow},
};
use storage::SqliteFeedStore;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://sync.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateConversation {
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "member", required = true)]
        members: Vec<i64>,
    },
    AddMember {
        conversation_id: i64,
        user_id: i64,
    },
    Notify {
        user_id: i64,
        title: String,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        conversation_id: Option<i64>,
        #[arg(long, value_enum, default_value_t = Kind::Message)]
        kind: Kind,
    },
    DeleteMessage {
        message_id: i64,
    },
    /// Prints committed feed events as JSON lines.
    Events {
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Message,
    Call,
    GroupInvite,
}

impl From<Kind> for NotificationKind {
    fn from(value: Kind) -> Self {
        match value {
            Kind::Message => NotificationKind::Message,
            Kind::Call => NotificationKind::Call,
            Kind::GroupInvite => NotificationKind::GroupInvite,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();
    let store = SqliteFeedStore::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateConversation { name, members } => {
            let kind = if members.len() > 2 {
                ConversationKind::Group
            } else {
                ConversationKind::Direct
            };
            let row = store
                .insert(NewRow::Conversation(NewConversation {
                    name,
                    kind,
                    members: members.into_iter().map(UserId).collect(),
                }))
                .await
                .context("creating conversation")?;
            println!("created conversation_id={}", row.raw_id());
        }
        Command::AddMember {
            conversation_id,
            user_id,
        } => {
            store
                .add_member(ConversationId(conversation_id), UserId(user_id))
                .await?;
            println!("added user_id={user_id} to conversation_id={conversation_id}");
        }
        Command::Notify {
            user_id,
            title,
            body,
            conversation_id,
            kind,
        } => {
            let row = store
                .insert(NewRow::Notification(NewNotification {
                    user_id: UserId(user_id),
                    conversation_id: conversation_id.map(ConversationId),
                    kind: kind.into(),
                    title,
                    body,
                }))
                .await
                .context("creating notification")?;
            println!("created notification_id={}", row.raw_id());
        }
        Command::DeleteMessage { message_id } => {
            store
                .delete(EntityType::Message, message_id)
                .await
                .with_context(|| format!("deleting message {message_id}"))?;
            println!("deleted message_id={message_id}");
        }
        Command::Events { since, limit } => {
            for event in store.events_since(since, limit).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    Ok(())
}
