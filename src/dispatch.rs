//! Dispatch queue items and the enums stored alongside them.
//!
//! A dispatch queue holds one row per recipient of a campaign message that is still waiting
//! for delivery. Rows are split into two sub-queues (regular recipients and A/B-test
//! recipients), and each row can be claimed by exactly one worker at a time.
//!
//! # Item Lifecycle
//!
//! 1. Items are created in bulk when a message is queued, with `in_progress = false`
//! 2. A worker claims an item, setting `in_progress = true` and refreshing `last_modified`
//! 3. After the delivery attempt the item is deleted
//!
//! Claims that are never finished go stale and can be reset, and items that have not been
//! claimed yet can be moved between sub-queues.
//!
//! The enums are stored as small integers; the discriminants below are the storage encoding.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::{error::Error, statement::Param};

/// Arbitrary per-recipient personalization values, stored as a JSON object.
pub type CustomPersonTokens = HashMap<String, serde_json::Value>;

/// The sub-queue an item sits in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, strum::Display,
)]
#[repr(i32)]
pub enum RecipientQueue {
    Recipient = 0,
    AbTestRecipient = 1,
}

/// How an item is going to be delivered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, strum::Display,
)]
#[repr(i32)]
pub enum DispatchType {
    Normal = 0,
    AbTest = 1,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumIter,
)]
#[repr(i32)]
pub enum MessageType {
    Regular = 0,
    Automated = 1,
    Triggered = 2,
}

impl DispatchType {
    /// The sub-queue an item with this dispatch type belongs in.
    pub fn recipient_queue(self) -> RecipientQueue {
        match self {
            Self::Normal => RecipientQueue::Recipient,
            Self::AbTest => RecipientQueue::AbTestRecipient,
        }
    }
}

impl RecipientQueue {
    pub fn dispatch_type(self) -> DispatchType {
        match self {
            Self::Recipient => DispatchType::Normal,
            Self::AbTestRecipient => DispatchType::AbTest,
        }
    }
}

macro_rules! storage_param {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Param {
                fn from(value: $ty) -> Self {
                    Param::Int(value as i64)
                }
            }
        )*
    };
}

storage_param!(RecipientQueue, DispatchType, MessageType);

/// One recipient of one message, waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchQueueItem {
    pub id: Uuid,
    pub message_id: Uuid,
    pub recipient_id: String,
    pub recipient_queue: RecipientQueue,
    pub dispatch_type: DispatchType,
    pub last_modified: DateTime<Utc>,
    pub message_type: MessageType,
    pub custom_person_tokens: Option<CustomPersonTokens>,
    pub in_progress: bool,
}

/// A `dispatch_queue` row as stored.
#[derive(Debug, FromRow)]
pub struct DispatchQueueRow {
    pub id: Uuid,
    pub message_id: Uuid,
    pub recipient_id: String,
    pub recipient_queue: RecipientQueue,
    pub dispatch_type: DispatchType,
    /// Unix milliseconds, UTC.
    pub last_modified: i64,
    pub message_type: MessageType,
    pub custom_person_tokens: Option<String>,
    pub in_progress: bool,
}

impl TryFrom<DispatchQueueRow> for DispatchQueueItem {
    type Error = Error;

    fn try_from(row: DispatchQueueRow) -> Result<Self, Self::Error> {
        let last_modified = DateTime::from_timestamp_millis(row.last_modified).ok_or_else(|| {
            Error::invalid_parameter(format!(
                "last_modified out of range for item {}: {}",
                row.id, row.last_modified
            ))
        })?;

        let custom_person_tokens = match row.custom_person_tokens.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(json) => serde_json::from_str::<Option<CustomPersonTokens>>(json)?,
        };

        Ok(Self {
            id: row.id,
            message_id: row.message_id,
            recipient_id: row.recipient_id,
            recipient_queue: row.recipient_queue,
            dispatch_type: row.dispatch_type,
            last_modified,
            message_type: row.message_type,
            custom_person_tokens,
            in_progress: row.in_progress,
        })
    }
}

/// Correlates a single-item enqueue with the claim that must pick up exactly that item.
///
/// When passed to [`crate::service::Service::enqueue`] for a single recipient, the new
/// item's id is recorded here. Passing the context to
/// [`crate::service::Service::claim_next`] then claims that item instead of the next one in
/// the message's sub-queue.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SendingContext {
    exact_item_id: Option<Uuid>,
}

impl SendingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_item(id: Uuid) -> Self {
        Self {
            exact_item_id: Some(id),
        }
    }

    pub fn exact_item_id(&self) -> Option<Uuid> {
        self.exact_item_id
    }

    pub fn record(&mut self, id: Uuid) {
        self.exact_item_id = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(tokens: Option<&str>) -> DispatchQueueRow {
        DispatchQueueRow {
            id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            recipient_id: "alice".to_owned(),
            recipient_queue: RecipientQueue::AbTestRecipient,
            dispatch_type: DispatchType::AbTest,
            last_modified: 1_700_000_000_123,
            message_type: MessageType::Automated,
            custom_person_tokens: tokens.map(str::to_owned),
            in_progress: true,
        }
    }

    #[test]
    fn test_queue_follows_dispatch_type() {
        assert_eq!(
            DispatchType::Normal.recipient_queue(),
            RecipientQueue::Recipient
        );
        assert_eq!(
            DispatchType::AbTest.recipient_queue(),
            RecipientQueue::AbTestRecipient
        );
        for ty in [DispatchType::Normal, DispatchType::AbTest] {
            assert_eq!(ty.recipient_queue().dispatch_type(), ty);
        }
    }

    #[test]
    fn test_storage_encoding() {
        assert_eq!(Param::from(RecipientQueue::AbTestRecipient), Param::Int(1));
        assert_eq!(Param::from(DispatchType::Normal), Param::Int(0));
        assert_eq!(Param::from(MessageType::Triggered), Param::Int(2));
    }

    #[test]
    fn test_row_mapping() {
        let item = DispatchQueueItem::try_from(row(Some(r#"{"name":"Alice","score":3}"#)))
            .unwrap();

        assert_eq!(item.recipient_id, "alice");
        assert_eq!(item.last_modified.timestamp_millis(), 1_700_000_000_123);
        assert!(item.in_progress);

        let tokens = item.custom_person_tokens.unwrap();
        assert_eq!(tokens["name"], serde_json::json!("Alice"));
        assert_eq!(tokens["score"], serde_json::json!(3));
    }

    #[test]
    fn test_missing_tokens() {
        for tokens in [None, Some(""), Some("null")] {
            let item = DispatchQueueItem::try_from(row(tokens)).unwrap();
            assert_eq!(item.custom_person_tokens, None);
        }
    }

    #[test]
    fn test_malformed_tokens() {
        let err = DispatchQueueItem::try_from(row(Some("{not json"))).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn test_sending_context() {
        let mut ctx = SendingContext::new();
        assert_eq!(ctx.exact_item_id(), None);

        let id = Uuid::new_v4();
        ctx.record(id);
        assert_eq!(ctx, SendingContext::for_item(id));
    }
}
