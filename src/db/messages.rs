use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::db::{MessageFilter, MessagePage};
use crate::email::classify::Classification;
use crate::email::{Message, MessageStatus, NewMessage, PersistOutcome, ThreadTouch};

const MESSAGE_COLUMNS: &str = r#"id, account_id, thread_id, message_id, direction, "from", "to", cc, bcc, subject,
    body_html, body_text, snippet, is_read, is_starred, status, ai_summary, ai_category, ai_priority,
    headers, sent_at, received_at, created_at"#;

#[derive(Clone)]
pub struct MessageQueries {
    pool: PgPool,
}

impl MessageQueries {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Message>, anyhow::Error> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM emails WHERE id = $1;"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn by_provider_id(&self, account_id: Uuid, message_id: &str) -> Result<Option<Message>, anyhow::Error> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM emails WHERE account_id = $1 AND message_id = $2 LIMIT 1;"))
            .bind(account_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn thread_of(&self, account_id: Uuid, message_id: &str) -> Result<Option<Uuid>, anyhow::Error> {
        let thread_id: Option<Option<Uuid>> = sqlx::query_scalar(
            "SELECT thread_id FROM emails WHERE account_id = $1 AND message_id = $2 AND thread_id IS NOT NULL LIMIT 1;"
        )
            .bind(account_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(thread_id.flatten())
    }

    pub async fn in_thread(&self, thread_id: Uuid) -> Result<Vec<Message>, anyhow::Error> {
        let rows = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM emails WHERE thread_id = $1 ORDER BY created_at ASC;"))
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn page(&self, filter: &MessageFilter, limit: i64, offset: i64) -> Result<MessagePage, anyhow::Error> {
        const FILTER: &str = "account_id = ANY($1)
            AND ($2::boolean IS NULL OR is_read = $2)
            AND ($3::boolean IS NULL OR is_starred = $3)
            AND ($4::text IS NULL OR direction = $4)
            AND ($5::text IS NULL OR status = $5)";

        let ids = filter.account_ids.clone();
        let direction = filter.direction.map(|d| d.as_str());
        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM emails WHERE {FILTER}
             ORDER BY received_at DESC NULLS LAST, created_at DESC LIMIT $6 OFFSET $7;"
        ))
            .bind(&ids)
            .bind(filter.is_read)
            .bind(filter.is_starred)
            .bind(direction)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let total: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM emails WHERE {FILTER};"))
            .bind(&ids)
            .bind(filter.is_read)
            .bind(filter.is_starred)
            .bind(direction)
            .bind(status)
            .fetch_one(&self.pool)
            .await?;

        let messages = rows.iter().map(message_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(MessagePage { messages, total })
    }

    /// Thread update first, then the insert, in one transaction. A
    /// redelivered provider id rolls both back.
    pub async fn record(&self, touch: ThreadTouch, message: NewMessage) -> Result<PersistOutcome, anyhow::Error> {

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE threads SET last_message_at = $1, snippet = $2, is_read = $3, message_count = message_count + 1 WHERE id = $4;"
        )
            .bind(touch.at)
            .bind(&touch.snippet)
            .bind(touch.is_read)
            .bind(touch.thread_id)
            .execute(&mut *tx)
            .await?;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"INSERT INTO emails (id, account_id, thread_id, message_id, direction, "from", "to", cc, bcc, subject,
                body_html, body_text, snippet, is_read, status, headers, sent_at, received_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
             ON CONFLICT (account_id, message_id) WHERE message_id IS NOT NULL DO NOTHING
             RETURNING id;"#
        )
            .bind(Uuid::new_v4())
            .bind(message.account_id)
            .bind(message.thread_id)
            .bind(&message.message_id)
            .bind(message.direction.as_str())
            .bind(&message.from)
            .bind(Json(&message.to))
            .bind(Json(&message.cc))
            .bind(Json(&message.bcc))
            .bind(&message.subject)
            .bind(&message.body_html)
            .bind(&message.body_text)
            .bind(&message.snippet)
            .bind(message.is_read)
            .bind(message.status.as_str())
            .bind(Json(&message.headers))
            .bind(message.sent_at)
            .bind(message.received_at)
            .fetch_optional(&mut *tx)
            .await?;

        match inserted {
            Some(id) => {
                tx.commit().await?;
                Ok(PersistOutcome::Inserted(id))
            }
            None => {
                tx.rollback().await?;
                let provider_id = message.message_id.as_deref().unwrap_or_default();
                let existing: Uuid = sqlx::query_scalar("SELECT id FROM emails WHERE account_id = $1 AND message_id = $2;")
                    .bind(message.account_id)
                    .bind(provider_id)
                    .fetch_one(&self.pool)
                    .await?;
                Ok(PersistOutcome::Duplicate(existing))
            }
        }
    }

    pub async fn set_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        provider_id: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), anyhow::Error> {

        sqlx::query(
            "UPDATE emails SET status = $1, message_id = COALESCE($2, message_id), sent_at = COALESCE($3, sent_at) WHERE id = $4;"
        )
            .bind(status.as_str())
            .bind(provider_id)
            .bind(sent_at)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_flags(&self, id: Uuid, is_read: Option<bool>, is_starred: Option<bool>) -> Result<Option<Message>, anyhow::Error> {
        let row = sqlx::query(&format!(
            "UPDATE emails SET is_read = COALESCE($1, is_read), is_starred = COALESCE($2, is_starred) WHERE id = $3 RETURNING {MESSAGE_COLUMNS};"
        ))
            .bind(is_read)
            .bind(is_starred)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn apply_classification(
        &self,
        message_id: Uuid,
        thread_id: Option<Uuid>,
        classification: &Classification,
    ) -> Result<(), anyhow::Error> {

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE emails SET ai_summary = $1, ai_category = $2, ai_priority = $3 WHERE id = $4;")
            .bind(&classification.summary)
            .bind(&classification.category)
            .bind(classification.priority)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        if let Some(thread_id) = thread_id {
            sqlx::query("UPDATE threads SET ai_summary = $1 WHERE id = $2;")
                .bind(&classification.summary)
                .bind(thread_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn message_from_row(row: &PgRow) -> Result<Message, anyhow::Error> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    let to: Json<Vec<String>> = row.try_get("to")?;
    let cc: Json<Vec<String>> = row.try_get("cc")?;
    let bcc: Json<Vec<String>> = row.try_get("bcc")?;
    let headers: Json<BTreeMap<String, String>> = row.try_get("headers")?;

    Ok(Message {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        thread_id: row.try_get("thread_id")?,
        message_id: row.try_get("message_id")?,
        direction: direction.parse()?,
        from: row.try_get("from")?,
        to: to.0,
        cc: cc.0,
        bcc: bcc.0,
        subject: row.try_get("subject")?,
        body_html: row.try_get("body_html")?,
        body_text: row.try_get("body_text")?,
        snippet: row.try_get("snippet")?,
        is_read: row.try_get("is_read")?,
        is_starred: row.try_get("is_starred")?,
        status: status.parse()?,
        ai_summary: row.try_get("ai_summary")?,
        ai_category: row.try_get("ai_category")?,
        ai_priority: row.try_get("ai_priority")?,
        headers: headers.0,
        sent_at: row.try_get("sent_at")?,
        received_at: row.try_get("received_at")?,
        created_at: row.try_get("created_at")?,
    })
}
