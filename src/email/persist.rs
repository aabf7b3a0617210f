use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::Store;
use crate::email::parse::{snippet, HeaderBag, NO_SUBJECT};
use crate::email::thread::Resolution;
use crate::email::{Direction, MessageStatus, NewMessage, PersistOutcome, ThreadTouch};

/// Fields of an inbound event after defaults have been applied.
#[derive(Clone, Debug)]
pub struct InboundEmail {
    pub message_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub headers: HeaderBag,
}

impl InboundEmail {
    pub fn subject_or_default(subject: Option<String>) -> String {
        subject
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| NO_SUBJECT.to_string())
    }

    pub fn snippet(&self) -> String {
        snippet(self.text.as_deref().unwrap_or_default())
    }
}

/// Writes an inbound message and bumps its thread's aggregates.
///
/// The thread's `last_message_at` is set to `received_at`, which is also the
/// message's receive time. Threads are created empty, so the count only moves
/// when the message row is actually written.
pub async fn persist_inbound(
    store: &dyn Store,
    account_id: Uuid,
    resolution: &Resolution,
    email: InboundEmail,
    received_at: DateTime<Utc>,
) -> Result<PersistOutcome, anyhow::Error> {

    let snippet = email.snippet();

    let touch = ThreadTouch {
        thread_id: resolution.thread_id,
        at: received_at,
        snippet: snippet.clone(),
        is_read: false,
    };

    let message = NewMessage {
        account_id,
        thread_id: resolution.thread_id,
        message_id: email.message_id,
        direction: Direction::Inbound,
        from: email.from,
        to: email.to,
        cc: email.cc,
        bcc: Vec::new(),
        subject: email.subject,
        body_html: email.html,
        body_text: email.text,
        snippet,
        is_read: false,
        status: MessageStatus::Delivered,
        headers: email.headers.into_inner(),
        sent_at: None,
        received_at: Some(received_at),
    };

    store.record_message(touch, message).await
}
