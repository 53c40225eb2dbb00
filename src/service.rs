use std::time::Duration;

use chrono::{TimeDelta, Utc};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::{
    config::Config,
    db::dispatch_queue::{self, ClaimTarget, NewItems, NewRecipient},
    dispatch::{
        CustomPersonTokens, DispatchQueueItem, DispatchQueueRow, DispatchType, MessageType,
        RecipientQueue, SendingContext,
    },
    error::Error,
    retry::RetryPolicy,
    statement::Statement,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The dispatch queue store.
///
/// Each operation is one statement run through the configured [`RetryPolicy`], on a
/// connection acquired for that attempt alone.
pub struct Service {
    db: SqlitePool,
    retry: RetryPolicy,
}

#[bon::bon]
impl Service {
    /// Connects to a private in-memory database with the default retry policy.
    pub async fn connect() -> eyre::Result<Self> {
        Self::connect_with().config(Config::default()).call().await
    }

    #[builder]
    pub async fn connect_with(config: Config) -> eyre::Result<Self> {
        let opts = if let Some(path) = config.db_path() {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        // Every in-memory connection is its own database, so keep exactly one alive.
        let pool_opts = if config.db_path().is_some() {
            SqlitePoolOptions::new()
        } else {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        };

        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self::with_pool(pool, config.retry_policy()))
    }

    /// Wraps an already migrated pool.
    pub fn with_pool(db: SqlitePool, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Queues one item per `(recipient, dispatch type)` pair, in a single transaction.
    ///
    /// When a `context` is given and exactly one item is queued, that item's id is recorded
    /// in it. Returns the number of items queued.
    pub async fn enqueue<S>(
        &self,
        message_id: Uuid,
        message_type: MessageType,
        recipients: impl IntoIterator<Item = (S, DispatchType)>,
        custom_person_tokens: Option<&CustomPersonTokens>,
        context: Option<&mut SendingContext>,
    ) -> Result<u64, Error>
    where
        S: Into<String>,
    {
        let items = NewItems {
            message_id,
            message_type,
            last_modified: Utc::now().timestamp_millis(),
            custom_person_tokens: custom_person_tokens
                .map(serde_json::to_string)
                .transpose()?,
            recipients: recipients
                .into_iter()
                .map(|(recipient_id, dispatch_type)| NewRecipient {
                    id: Uuid::new_v4(),
                    recipient_id: recipient_id.into(),
                    dispatch_type,
                })
                .collect(),
        };

        if items.recipients.is_empty() {
            return Ok(0);
        }

        let db = &self.db;
        let batch = &items;
        let inserted = self
            .retry
            .run_returning(move || async move {
                let mut tx = db.begin().await?;
                let inserted = dispatch_queue::insert(&mut *tx, batch).await?;
                tx.commit().await?;

                Result::<_, Error>::Ok(inserted)
            })
            .await?;

        if let (Some(context), [only]) = (context, items.recipients.as_slice()) {
            context.record(only.id);
        }

        tracing::debug!(%message_id, inserted, "Queued recipients for dispatch");

        Ok(inserted)
    }

    /// Removes every item of a message. Returns the number of items removed.
    pub async fn clear_queue(&self, message_id: Uuid) -> Result<u64, Error> {
        let removed = self.execute(&dispatch_queue::clear(message_id)).await?;

        tracing::debug!(%message_id, removed, "Cleared dispatch queue");

        Ok(removed)
    }

    /// Counts a message's items, restricted to `queue_states` unless it is empty.
    pub async fn count_in_queue(
        &self,
        message_id: Uuid,
        queue_states: &[RecipientQueue],
    ) -> Result<u64, Error> {
        let count: i64 = self
            .retry
            .get_scalar(&self.db, &dispatch_queue::count(message_id, queue_states))
            .await?;

        Ok(count.max(0) as u64)
    }

    /// Removes a single item. Returns whether it existed.
    pub async fn delete_item(&self, item_id: Uuid) -> Result<bool, Error> {
        Ok(self.execute(&dispatch_queue::delete_item(item_id)).await? > 0)
    }

    /// Messages of `message_type` holding at least one claim older than `timeout`.
    pub async fn list_in_progress_messages(
        &self,
        message_type: MessageType,
        timeout: Duration,
    ) -> Result<Vec<Uuid>, Error> {
        let stmt = dispatch_queue::in_progress_messages(message_type, cutoff(timeout)?);
        let db = &self.db;
        let stmt = &stmt;

        self.retry
            .run_returning(move || async move {
                let mut conn = db.acquire().await?;

                let mut stream = sqlx::query_scalar_with::<_, Uuid, _>(stmt.sql(), stmt.arguments()?)
                    .fetch(&mut *conn);

                let mut messages = Vec::new();

                while let Some(id) = stream.next().await.transpose()? {
                    messages.push(id);
                }

                Result::<_, Error>::Ok(messages)
            })
            .await
    }

    /// Claims the next unclaimed item of a message's sub-queue.
    ///
    /// With a `context`, the item recorded in it is claimed instead; a context without a
    /// recorded item claims nothing. Returns `None` when no item could be claimed.
    pub async fn claim_next(
        &self,
        message_id: Uuid,
        queue_state: RecipientQueue,
        context: Option<&SendingContext>,
    ) -> Result<Option<DispatchQueueItem>, Error> {
        let target = match context {
            None => ClaimTarget::Next {
                message_id,
                queue: queue_state,
            },
            Some(context) => match context.exact_item_id() {
                Some(id) => ClaimTarget::Item(id),
                None => return Ok(None),
            },
        };

        let stmt = dispatch_queue::claim(target, Utc::now().timestamp_millis());
        let db = &self.db;
        let stmt = &stmt;

        let row = self
            .retry
            .run_returning(move || async move {
                let mut conn = db.acquire().await?;

                let row = sqlx::query_as_with::<_, DispatchQueueRow, _>(
                    stmt.sql(),
                    stmt.arguments()?,
                )
                .fetch_optional(&mut *conn)
                .await?;

                Result::<_, Error>::Ok(row)
            })
            .await?;

        if let Some(row) = &row {
            tracing::debug!(%message_id, item = %row.id, "Claimed dispatch item");
        }

        row.map(DispatchQueueItem::try_from).transpose()
    }

    /// Releases a message's claims.
    ///
    /// With a non-zero `timeout` only claims older than it are released; `None` or a zero
    /// timeout releases every claim of the message. Returns the number of items released.
    pub async fn reset_stale_claims(
        &self,
        message_id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<u64, Error> {
        let cutoff = match timeout {
            Some(timeout) if !timeout.is_zero() => Some(cutoff(timeout)?),
            _ => None,
        };

        let stmt = dispatch_queue::reset(message_id, Utc::now().timestamp_millis(), cutoff);
        let reset = self.execute(&stmt).await?;

        tracing::debug!(%message_id, reset, "Reset dispatch claims");

        Ok(reset)
    }

    /// Moves up to `item_count` unclaimed items from `source_type` to `target_type`.
    ///
    /// Which items are moved is unspecified. Returns the number of items moved.
    pub async fn retype(
        &self,
        message_id: Uuid,
        source_type: DispatchType,
        target_type: DispatchType,
        item_count: u32,
    ) -> Result<u64, Error> {
        if item_count == 0 {
            return Ok(0);
        }

        let stmt = dispatch_queue::retype(
            message_id,
            source_type,
            target_type,
            item_count,
            Utc::now().timestamp_millis(),
        );
        let moved = self.execute(&stmt).await?;

        tracing::debug!(
            %message_id,
            %source_type,
            %target_type,
            moved,
            "Changed dispatch type"
        );

        Ok(moved)
    }

    async fn execute(&self, stmt: &Statement) -> Result<u64, Error> {
        let db = &self.db;

        self.retry
            .run_returning(move || async move {
                let mut conn = db.acquire().await?;

                let res = sqlx::query_with(stmt.sql(), stmt.arguments()?)
                    .execute(&mut *conn)
                    .await?;

                Result::<_, Error>::Ok(res.rows_affected())
            })
            .await
    }
}

/// `now - timeout` in unix milliseconds.
fn cutoff(timeout: Duration) -> Result<i64, Error> {
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|timeout| Utc::now().checked_sub_signed(timeout))
        .map(|cutoff| cutoff.timestamp_millis())
        .ok_or_else(|| Error::invalid_parameter(format!("timeout out of range: {timeout:?}")))
}
