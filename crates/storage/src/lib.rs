use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use integrations::{
    ChangeFeedStore, FeedSignal, Snapshot, StoreSubscription, SubscriptionHandle,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite, SqliteConnection,
};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use shared::{
    domain::{ConversationId, UserId},
    error::StoreError,
    protocol::{
        EntityType, FeedEvent, FeedOperation, Filter, NewRow, Patch, Row, Scope, SnapshotQuery,
        SortDirection,
    },
};

/// Change-feed store backed by SQLite. Rows are kept as JSON next to the columns scopes filter
/// on, and every committed change is appended to `feed_events` before it is fanned out.
pub struct SqliteFeedStore {
    pool: Pool<Sqlite>,
    hub: Mutex<FeedHub>,
}

#[derive(Default)]
struct FeedHub {
    next_handle: u64,
    subscribers: HashMap<SubscriptionHandle, HubSubscriber>,
}

struct HubSubscriber {
    scope: Scope,
    events: mpsc::UnboundedSender<FeedSignal>,
}

/// An event plus the membership of its conversation at commit time.
struct CommittedEvent {
    event: FeedEvent,
    members: HashSet<UserId>,
}

impl FeedHub {
    fn publish(&mut self, committed: &[CommittedEvent]) {
        for entry in committed {
            self.subscribers.retain(|handle, subscriber| {
                let is_member = |_: ConversationId, user_id: UserId| entry.members.contains(&user_id);
                if !subscriber.scope.matches(&entry.event.row, is_member) {
                    return true;
                }
                let delivered = subscriber
                    .events
                    .send(FeedSignal::Event(entry.event.clone()))
                    .is_ok();
                if !delivered {
                    debug!(handle = handle.0, "storage: pruning closed subscriber");
                }
                delivered
            });
        }
    }
}

impl SqliteFeedStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool_options = if database_url == "sqlite::memory:" {
            // Every connection to `:memory:` is its own database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(database_url, "storage: change feed ready");

        Ok(Self {
            pool,
            hub: Mutex::new(FeedHub::default()),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Adds a member and bumps the conversation so the member's scope picks it up.
    pub async fn add_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()> {
        let mut hub = self.hub.lock().await;
        let mut tx = self.pool.begin().await?;

        let exists = load_row(&mut tx, EntityType::Conversation, conversation_id.0)
            .await?
            .is_some();
        if !exists {
            anyhow::bail!("conversation {} not found", conversation_id.0);
        }

        let added = insert_member(&mut tx, conversation_id, user_id).await?;
        let mut committed = Vec::new();
        if added {
            if let Some(event) = touch_conversation(&mut tx, conversation_id, Utc::now()).await? {
                committed.push(event);
            }
        }
        tx.commit().await?;
        hub.publish(&committed);
        Ok(())
    }

    pub async fn members(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM conversation_members WHERE conversation_id = ? ORDER BY user_id",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to list conversation members")?;
        Ok(ids.into_iter().map(UserId).collect())
    }

    /// Committed events after `cursor`, oldest first.
    pub async fn events_since(&self, cursor: u64, limit: u32) -> Result<Vec<FeedEvent>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT event_id, op, row_json FROM feed_events WHERE event_id > ? ORDER BY event_id LIMIT ?",
        )
        .bind(cursor as i64)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("failed to read feed events")?;

        rows.into_iter()
            .map(|(event_id, op, row_json)| -> Result<FeedEvent> {
                Ok(FeedEvent {
                    event_id: event_id as u64,
                    op: parse_operation(&op)?,
                    row: serde_json::from_str(&row_json).context("malformed event row")?,
                })
            })
            .collect()
    }

    /// Ends every live subscription with `Disconnected`.
    pub async fn disconnect_all(&self) {
        let mut hub = self.hub.lock().await;
        for (_, subscriber) in hub.subscribers.drain() {
            let _ = subscriber.events.send(FeedSignal::Disconnected);
        }
    }
}

#[async_trait]
impl ChangeFeedStore for SqliteFeedStore {
    async fn fetch_snapshot(&self, query: &SnapshotQuery) -> Result<Snapshot, StoreError> {
        // Holding the hub keeps the cursor consistent with what subscribers have been sent.
        let _hub = self.hub.lock().await;

        let direction = match query.direction {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        };
        let limit = query.limit.map(|limit| limit as i64).unwrap_or(-1);
        let entity = query.scope.entity.as_str();

        let encoded: Vec<String> = match query.scope.filter {
            Filter::MemberOf(user_id) => {
                let sql = format!(
                    "SELECT r.row_json FROM feed_rows r \
                     JOIN conversation_members m ON m.conversation_id = r.id \
                     WHERE r.entity = ? AND m.user_id = ? \
                     ORDER BY r.sort_at {direction}, r.id {direction} LIMIT ?"
                );
                sqlx::query_scalar::<_, String>(&sql)
                    .bind(entity)
                    .bind(user_id.0)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
            Filter::Conversation(conversation_id) => {
                let sql = format!(
                    "SELECT row_json FROM feed_rows \
                     WHERE entity = ? AND conversation_id = ? \
                     ORDER BY sort_at {direction}, id {direction} LIMIT ?"
                );
                sqlx::query_scalar::<_, String>(&sql)
                    .bind(entity)
                    .bind(conversation_id.0)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
            Filter::Recipient(user_id) => {
                let sql = format!(
                    "SELECT row_json FROM feed_rows \
                     WHERE entity = ? AND user_id = ? \
                     ORDER BY sort_at {direction}, id {direction} LIMIT ?"
                );
                sqlx::query_scalar::<_, String>(&sql)
                    .bind(entity)
                    .bind(user_id.0)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(store_error)?;

        let mut rows = Vec::with_capacity(encoded.len());
        for row_json in encoded {
            let row = decode_row(&row_json)?;
            // Membership was already enforced by the join.
            if query.scope.matches(&row, |_, _| true) {
                rows.push(row);
            }
        }

        let cursor: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(event_id), 0) FROM feed_events")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(Snapshot {
            rows: query.arrange(rows),
            cursor: cursor as u64,
        })
    }

    async fn insert(&self, new_row: NewRow) -> Result<Row, StoreError> {
        new_row.validate()?;
        let entity = new_row.entity_type();
        let members = match &new_row {
            NewRow::Conversation(new) => new.members.clone(),
            _ => Vec::new(),
        };
        let bumped_conversation = match &new_row {
            NewRow::Message(new) => Some(new.conversation_id),
            _ => None,
        };

        let mut hub = self.hub.lock().await;
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let id = next_row_id(&mut tx, entity).await?;
        let now = Utc::now();
        let row = new_row.into_row(id, now);
        for user_id in members {
            insert_member(&mut tx, ConversationId(id), user_id).await?;
        }
        write_row(&mut tx, &row).await?;

        let mut committed = vec![append_event(&mut tx, FeedOperation::Insert, &row).await?];
        if let Some(conversation_id) = bumped_conversation {
            if let Some(event) = touch_conversation(&mut tx, conversation_id, now).await? {
                committed.push(event);
            }
        }
        tx.commit().await.map_err(store_error)?;
        hub.publish(&committed);

        debug!(entity = %entity, id, "storage: inserted row");
        Ok(row)
    }

    async fn update(&self, id: i64, patch: Patch) -> Result<Row, StoreError> {
        let entity = patch.entity_type();
        let mut hub = self.hub.lock().await;
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let mut row = load_row(&mut tx, entity, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("{entity} {id} not found")))?;
        if !patch.apply(&mut row, Utc::now())? {
            return Ok(row);
        }
        write_row(&mut tx, &row).await?;
        let committed = append_event(&mut tx, FeedOperation::Update, &row).await?;
        tx.commit().await.map_err(store_error)?;
        hub.publish(&[committed]);
        Ok(row)
    }

    async fn delete(&self, entity: EntityType, id: i64) -> Result<(), StoreError> {
        let mut hub = self.hub.lock().await;
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let row = load_row(&mut tx, entity, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("{entity} {id} not found")))?;
        sqlx::query("DELETE FROM feed_rows WHERE entity = ? AND id = ?")
            .bind(entity.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        let committed = append_event(&mut tx, FeedOperation::Delete, &row).await?;
        tx.commit().await.map_err(store_error)?;
        hub.publish(&[committed]);
        Ok(())
    }

    async fn subscribe(&self, scope: &Scope) -> Result<StoreSubscription, StoreError> {
        let mut hub = self.hub.lock().await;
        hub.next_handle += 1;
        let handle = SubscriptionHandle(hub.next_handle);
        let (tx, rx) = mpsc::unbounded_channel();
        hub.subscribers.insert(
            handle,
            HubSubscriber {
                scope: *scope,
                events: tx,
            },
        );
        debug!(handle = handle.0, %scope, "storage: subscriber registered");
        Ok(StoreSubscription { handle, events: rx })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.hub.lock().await.subscribers.remove(&handle);
    }
}

async fn next_row_id(conn: &mut SqliteConnection, entity: EntityType) -> Result<i64, StoreError> {
    sqlx::query_scalar(
        "INSERT INTO feed_sequences (entity, last_id) VALUES (?, 1) \
         ON CONFLICT(entity) DO UPDATE SET last_id = last_id + 1 \
         RETURNING last_id",
    )
    .bind(entity.as_str())
    .fetch_one(&mut *conn)
    .await
    .map_err(store_error)
}

async fn insert_member(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id) VALUES (?, ?)",
    )
    .bind(conversation_id.0)
    .bind(user_id.0)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;
    Ok(result.rows_affected() > 0)
}

async fn members_of(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
) -> Result<HashSet<UserId>, StoreError> {
    let ids: Vec<i64> =
        sqlx::query_scalar("SELECT user_id FROM conversation_members WHERE conversation_id = ?")
            .bind(conversation_id.0)
            .fetch_all(&mut *conn)
            .await
            .map_err(store_error)?;
    Ok(ids.into_iter().map(UserId).collect())
}

async fn load_row(
    conn: &mut SqliteConnection,
    entity: EntityType,
    id: i64,
) -> Result<Option<Row>, StoreError> {
    let encoded: Option<String> =
        sqlx::query_scalar("SELECT row_json FROM feed_rows WHERE entity = ? AND id = ?")
            .bind(entity.as_str())
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_error)?;
    encoded.as_deref().map(decode_row).transpose()
}

async fn write_row(conn: &mut SqliteConnection, row: &Row) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO feed_rows (entity, id, conversation_id, user_id, sort_at, row_json) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(entity, id) DO UPDATE SET \
           conversation_id = excluded.conversation_id, \
           user_id = excluded.user_id, \
           sort_at = excluded.sort_at, \
           row_json = excluded.row_json",
    )
    .bind(row.entity_type().as_str())
    .bind(row.raw_id())
    .bind(row.conversation_id().map(|id| id.0))
    .bind(row.user_id().map(|id| id.0))
    .bind(sort_key(row.sort_at()))
    .bind(encode_row(row)?)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;
    Ok(())
}

async fn append_event(
    conn: &mut SqliteConnection,
    op: FeedOperation,
    row: &Row,
) -> Result<CommittedEvent, StoreError> {
    let result = sqlx::query("INSERT INTO feed_events (entity, op, row_json) VALUES (?, ?, ?)")
        .bind(row.entity_type().as_str())
        .bind(op.as_str())
        .bind(encode_row(row)?)
        .execute(&mut *conn)
        .await
        .map_err(store_error)?;

    let members = match row {
        Row::Conversation(conversation) => members_of(conn, conversation.id).await?,
        _ => HashSet::new(),
    };
    Ok(CommittedEvent {
        event: FeedEvent {
            event_id: result.last_insert_rowid() as u64,
            op,
            row: row.clone(),
        },
        members,
    })
}

async fn touch_conversation(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
    now: DateTime<Utc>,
) -> Result<Option<CommittedEvent>, StoreError> {
    let Some(Row::Conversation(mut conversation)) =
        load_row(conn, EntityType::Conversation, conversation_id.0).await?
    else {
        return Ok(None);
    };
    conversation.updated_at = now;
    let row = Row::Conversation(conversation);
    write_row(conn, &row).await?;
    append_event(conn, FeedOperation::Update, &row).await.map(Some)
}

/// Fixed-width UTC timestamps so lexical order is chronological order.
fn sort_key(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_row(row: &Row) -> Result<String, StoreError> {
    serde_json::to_string(row)
        .map_err(|err| StoreError::internal(format!("failed to encode row: {err}")))
}

fn decode_row(row_json: &str) -> Result<Row, StoreError> {
    serde_json::from_str(row_json)
        .map_err(|err| StoreError::internal(format!("malformed stored row: {err}")))
}

fn parse_operation(op: &str) -> Result<FeedOperation> {
    match op {
        "insert" => Ok(FeedOperation::Insert),
        "update" => Ok(FeedOperation::Update),
        "delete" => Ok(FeedOperation::Delete),
        other => anyhow::bail!("unknown feed operation '{other}'"),
    }
}

fn store_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::unavailable(err.to_string())
        }
        _ => StoreError::internal(err.to_string()),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
