//! Statements over the `dispatch_queue` table.
//!
//! Every operation is a single statement so that it can be retried as a unit. Timestamps are
//! passed in by the caller as unix milliseconds.

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::{
    dispatch::{DispatchType, MessageType, RecipientQueue},
    statement::Statement,
};

pub const COLUMNS: &str = "id, message_id, recipient_id, recipient_queue, dispatch_type, \
     last_modified, message_type, custom_person_tokens, in_progress";

/// Rows per multi-row `INSERT`, kept well under SQLite's bound-parameter limit.
const INSERT_CHUNK: usize = 1000;

/// The rows produced by one enqueue call. Everything but the recipient is shared.
#[derive(Debug, Clone)]
pub struct NewItems {
    pub message_id: Uuid,
    pub message_type: MessageType,
    pub last_modified: i64,
    pub custom_person_tokens: Option<String>,
    pub recipients: Vec<NewRecipient>,
}

#[derive(Debug, Clone)]
pub struct NewRecipient {
    pub id: Uuid,
    pub recipient_id: String,
    pub dispatch_type: DispatchType,
}

/// Which row a claim may pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimTarget {
    /// Any unclaimed row of the message's sub-queue.
    Next {
        message_id: Uuid,
        queue: RecipientQueue,
    },
    /// Exactly this row, if it is unclaimed.
    Item(Uuid),
}

/// Inserts all rows with multi-row `INSERT`s. Run it inside a transaction to make the
/// whole batch a single unit.
pub async fn insert(db: &mut SqliteConnection, items: &NewItems) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;

    for chunk in items.recipients.chunks(INSERT_CHUNK) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO dispatch_queue ({COLUMNS}) "));

        builder.push_values(chunk, |mut row, recipient| {
            row.push_bind(recipient.id)
                .push_bind(items.message_id)
                .push_bind(recipient.recipient_id.as_str())
                .push_bind(recipient.dispatch_type.recipient_queue())
                .push_bind(recipient.dispatch_type)
                .push_bind(items.last_modified)
                .push_bind(items.message_type)
                .push_bind(items.custom_person_tokens.as_deref())
                .push_bind(false);
        });

        inserted += builder.build().execute(&mut *db).await?.rows_affected();
    }

    Ok(inserted)
}

pub fn clear(message_id: Uuid) -> Statement {
    Statement::new("DELETE FROM dispatch_queue WHERE message_id = ?").bind(message_id)
}

pub fn count(message_id: Uuid, queue_states: &[RecipientQueue]) -> Statement {
    let stmt =
        Statement::new("SELECT COUNT(id) FROM dispatch_queue WHERE message_id = ?").bind(message_id);

    if queue_states.is_empty() {
        return stmt;
    }

    stmt.push("AND recipient_queue")
        .push_in(queue_states.iter().copied())
}

pub fn delete_item(item_id: Uuid) -> Statement {
    Statement::new("DELETE FROM dispatch_queue WHERE id = ?").bind(item_id)
}

/// Messages with at least one claim older than `cutoff`.
pub fn in_progress_messages(message_type: MessageType, cutoff: i64) -> Statement {
    Statement::new(
        "
        SELECT DISTINCT message_id FROM dispatch_queue
        WHERE message_type = ? AND in_progress = 1 AND last_modified < ?
        ",
    )
    .bind(message_type)
    .bind(cutoff)
}

/// Claims at most one row and returns it.
///
/// The row is picked and marked in a single `UPDATE`, and the outer `in_progress = 0` check
/// means a row that was claimed in between is never returned twice.
pub fn claim(target: ClaimTarget, now: i64) -> Statement {
    let stmt = Statement::new("UPDATE dispatch_queue SET in_progress = 1, last_modified = ?")
        .bind(now)
        .push("WHERE in_progress = 0 AND id =");

    let stmt = match target {
        ClaimTarget::Next { message_id, queue } => stmt
            .push(
                "(SELECT id FROM dispatch_queue \
                 WHERE in_progress = 0 AND message_id = ? AND recipient_queue = ? LIMIT 1)",
            )
            .bind(message_id)
            .bind(queue),
        ClaimTarget::Item(id) => stmt.push("?").bind(id),
    };

    stmt.push(&format!("RETURNING {COLUMNS}"))
}

/// Releases claims on a message. With a `cutoff`, only claims older than it are released.
pub fn reset(message_id: Uuid, now: i64, cutoff: Option<i64>) -> Statement {
    let stmt = Statement::new(
        "UPDATE dispatch_queue SET in_progress = 0, last_modified = ? \
         WHERE message_id = ? AND in_progress = 1",
    )
    .bind(now)
    .bind(message_id);

    match cutoff {
        Some(cutoff) => stmt.push("AND last_modified < ?").bind(cutoff),
        None => stmt,
    }
}

/// Moves up to `item_count` unclaimed rows from one dispatch type to another.
pub fn retype(
    message_id: Uuid,
    source: DispatchType,
    target: DispatchType,
    item_count: u32,
    now: i64,
) -> Statement {
    Statement::new(
        "
        UPDATE dispatch_queue
        SET recipient_queue = ?, dispatch_type = ?, last_modified = ?
        WHERE in_progress = 0 AND id IN (
            SELECT id FROM dispatch_queue
            WHERE message_id = ? AND recipient_queue = ? AND in_progress = 0
            LIMIT ?
        )
        ",
    )
    .bind(target.recipient_queue())
    .bind(target)
    .bind(now)
    .bind(message_id)
    .bind(source.recipient_queue())
    .bind(item_count)
}

#[cfg(test)]
mod tests {
    use crate::statement::Param;

    use super::*;

    #[test]
    fn test_count_without_filter() {
        let id = Uuid::new_v4();
        let stmt = count(id, &[]);

        assert!(!stmt.sql().contains("recipient_queue"));
        assert_eq!(stmt.params(), &[Param::Uuid(id)]);
    }

    #[test]
    fn test_count_with_filter() {
        let id = Uuid::new_v4();
        let stmt = count(
            id,
            &[RecipientQueue::Recipient, RecipientQueue::AbTestRecipient],
        );

        assert!(stmt.sql().ends_with("AND recipient_queue IN (?, ?)"));
        assert_eq!(
            stmt.params(),
            &[Param::Uuid(id), Param::Int(0), Param::Int(1)]
        );
    }

    #[test]
    fn test_claim_next_is_scoped_to_message_and_queue() {
        let message_id = Uuid::new_v4();
        let stmt = claim(
            ClaimTarget::Next {
                message_id,
                queue: RecipientQueue::AbTestRecipient,
            },
            42,
        );

        assert!(stmt.sql().contains("message_id = ? AND recipient_queue = ? LIMIT 1"));
        assert!(stmt.sql().ends_with(&format!("RETURNING {COLUMNS}")));
        assert_eq!(
            stmt.params(),
            &[Param::Int(42), Param::Uuid(message_id), Param::Int(1)]
        );
    }

    #[test]
    fn test_claim_item() {
        let item = Uuid::new_v4();
        let stmt = claim(ClaimTarget::Item(item), 42);

        assert!(stmt.sql().contains("WHERE in_progress = 0 AND id = ?"));
        assert!(!stmt.sql().contains("message_id = ?"));
        assert_eq!(stmt.params(), &[Param::Int(42), Param::Uuid(item)]);
    }

    #[test]
    fn test_reset_cutoff() {
        let id = Uuid::new_v4();

        let all = reset(id, 10, None);
        assert!(!all.sql().contains("last_modified < ?"));
        assert_eq!(all.params().len(), 2);

        let stale = reset(id, 10, Some(5));
        assert!(stale.sql().ends_with("AND last_modified < ?"));
        assert_eq!(stale.params().last(), Some(&Param::Int(5)));
    }

    #[test]
    fn test_retype_params() {
        let id = Uuid::new_v4();
        let stmt = retype(id, DispatchType::Normal, DispatchType::AbTest, 5, 7);

        assert_eq!(
            stmt.params(),
            &[
                Param::Int(1),
                Param::Int(1),
                Param::Int(7),
                Param::Uuid(id),
                Param::Int(0),
                Param::Int(5),
            ]
        );
    }
}
