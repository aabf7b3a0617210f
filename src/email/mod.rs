pub mod parse;
pub mod thread;
pub mod persist;
pub mod classify;
pub mod send;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedSecret;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Lifecycle of a message row.
///
/// Outbound mail moves `draft -> sent -> delivered`, and lands in `failed`
/// when the provider rejects it. Inbound mail is stored as `delivered`.
/// `delivered` and `failed` accept no further transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Draft,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Draft => "draft",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Failed)
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Draft, Sent) | (Draft, Failed) | (Sent, Delivered) | (Sent, Failed)
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl FromStr for Direction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(UnknownVariant { kind: "direction", value: other.to_string() }),
        }
    }
}

impl FromStr for MessageStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(MessageStatus::Draft),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(UnknownVariant { kind: "status", value: other.to_string() }),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: Uuid,
    pub user_id: String,
    pub email: String,
    pub name: String,
    #[serde(skip)]
    pub api_key: EncryptedSecret,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewAccount {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub api_key: EncryptedSecret,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: Uuid,
    pub account_id: Uuid,
    pub subject: String,
    pub last_message_at: DateTime<Utc>,
    pub message_count: i32,
    pub is_read: bool,
    pub is_starred: bool,
    pub snippet: Option<String>,
    pub ai_summary: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub account_id: Uuid,
    pub thread_id: Option<Uuid>,
    pub message_id: Option<String>,
    pub direction: Direction,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub snippet: String,
    pub is_read: bool,
    pub is_starred: bool,
    pub status: MessageStatus,
    pub ai_summary: Option<String>,
    pub ai_category: Option<String>,
    pub ai_priority: Option<i32>,
    pub headers: BTreeMap<String, String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A message row about to be written. The thread is always resolved first.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub account_id: Uuid,
    pub thread_id: Uuid,
    pub message_id: Option<String>,
    pub direction: Direction,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub snippet: String,
    pub is_read: bool,
    pub status: MessageStatus,
    pub headers: BTreeMap<String, String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
}

/// Aggregate update applied to a thread alongside a message insert. The
/// insert always bumps `message_count` by one.
#[derive(Clone, Debug)]
pub struct ThreadTouch {
    pub thread_id: Uuid,
    pub at: DateTime<Utc>,
    pub snippet: String,
    pub is_read: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted(Uuid),
    Duplicate(Uuid),
}

impl PersistOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            PersistOutcome::Inserted(id) | PersistOutcome::Duplicate(id) => *id,
        }
    }
}
