use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::db::{SubjectThread, ThreadPage};
use crate::email::Thread;

const THREAD_COLUMNS: &str = "id, account_id, subject, last_message_at, message_count, is_read, is_starred, snippet, ai_summary";

#[derive(Clone)]
pub struct ThreadQueries {
    pool: PgPool,
}

impl ThreadQueries {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Thread>, anyhow::Error> {
        let row = sqlx::query(&format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = $1;"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(thread_from_row).transpose()
    }

    pub async fn page(&self, account_ids: &[Uuid], limit: i64, offset: i64) -> Result<ThreadPage, anyhow::Error> {
        let ids = account_ids.to_vec();

        let rows = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE account_id = ANY($1) ORDER BY last_message_at DESC LIMIT $2 OFFSET $3;"
        ))
            .bind(&ids)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let total: i64 = sqlx::query_scalar("SELECT count(*) FROM threads WHERE account_id = ANY($1);")
            .bind(&ids)
            .fetch_one(&self.pool)
            .await?;

        let threads = rows.iter().map(thread_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(ThreadPage { threads, total })
    }

    /// Subject lookup and insert share a transaction holding an advisory
    /// lock on the account, so two concurrent deliveries that both miss the
    /// lookup cannot each create a thread.
    pub async fn find_or_create(
        &self,
        account_id: Uuid,
        subject: &str,
        snippet: &str,
        at: DateTime<Utc>,
    ) -> Result<SubjectThread, anyhow::Error> {

        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0));")
            .bind(account_id.to_string())
            .execute(&mut *tx)
            .await?;

        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM threads WHERE account_id = $1 AND subject = $2 ORDER BY last_message_at DESC LIMIT 1;"
        )
            .bind(account_id)
            .bind(subject)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(thread_id) = existing {
            tx.commit().await?;
            return Ok(SubjectThread { thread_id, created: false });
        }

        let thread_id = insert_thread(&mut tx, account_id, subject, snippet, at).await?;
        tx.commit().await?;

        Ok(SubjectThread { thread_id, created: true })
    }

    pub async fn create(
        &self,
        account_id: Uuid,
        subject: &str,
        snippet: &str,
        at: DateTime<Utc>,
    ) -> Result<Uuid, anyhow::Error> {
        let mut conn = self.pool.acquire().await?;
        insert_thread(&mut conn, account_id, subject, snippet, at).await
    }
}

async fn insert_thread(
    conn: &mut sqlx::PgConnection,
    account_id: Uuid,
    subject: &str,
    snippet: &str,
    at: DateTime<Utc>,
) -> Result<Uuid, anyhow::Error> {
    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO threads (id, account_id, subject, last_message_at, message_count, snippet)
         VALUES ($1, $2, $3, $4, 0, $5) RETURNING id;"
    )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(subject)
        .bind(at)
        .bind(snippet)
        .fetch_one(conn)
        .await?;

    Ok(id)
}

fn thread_from_row(row: &PgRow) -> Result<Thread, anyhow::Error> {
    Ok(Thread {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        subject: row.try_get("subject")?,
        last_message_at: row.try_get("last_message_at")?,
        message_count: row.try_get("message_count")?,
        is_read: row.try_get("is_read")?,
        is_starred: row.try_get("is_starred")?,
        snippet: row.try_get("snippet")?,
        ai_summary: row.try_get("ai_summary")?,
    })
}
