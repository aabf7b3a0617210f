mod accounts;
pub use accounts::*;

mod threads;
pub use threads::*;

mod messages;
pub use messages::*;

mod sessions;
pub use sessions::*;

mod memory;
pub use memory::*;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::config::Config;
use crate::email::classify::Classification;
use crate::email::{
    Account, Direction, Message, MessageStatus, NewAccount, NewMessage, PersistOutcome, Thread,
    ThreadTouch,
};

const SCHEMA: &str = include_str!("../../migrations/schema.sql");

/// Result of the subject-match-or-create step of thread resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubjectThread {
    pub thread_id: Uuid,
    pub created: bool,
}

#[derive(Clone, Debug)]
pub struct ThreadPage {
    pub threads: Vec<Thread>,
    pub total: i64,
}

/// Message listing filter. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct MessageFilter {
    pub account_ids: Vec<Uuid>,
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub direction: Option<Direction>,
    pub status: Option<MessageStatus>,
}

impl MessageFilter {
    pub fn matches(&self, message: &Message) -> bool {
        self.account_ids.contains(&message.account_id)
            && self.is_read.is_none_or(|v| message.is_read == v)
            && self.is_starred.is_none_or(|v| message.is_starred == v)
            && self.direction.is_none_or(|v| message.direction == v)
            && self.status.is_none_or(|v| message.status == v)
    }
}

#[derive(Clone, Debug)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub total: i64,
}

/// Everything the ingestion pipeline and the API need from storage.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn account_by_email(&self, email: &str) -> Result<Option<Account>, anyhow::Error>;
    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>, anyhow::Error>;
    async fn accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>, anyhow::Error>;
    async fn create_account(&self, account: NewAccount) -> Result<Account, anyhow::Error>;
    /// Makes `id` the user's only default account. `None` when the user has
    /// no such account.
    async fn set_default_account(&self, user_id: &str, id: Uuid) -> Result<Option<Account>, anyhow::Error>;
    /// Removes the account with its threads and messages. When it was the
    /// default, the user's oldest remaining account takes over.
    async fn delete_account(&self, id: Uuid) -> Result<bool, anyhow::Error>;

    async fn thread(&self, id: Uuid) -> Result<Option<Thread>, anyhow::Error>;
    async fn threads_for_accounts(&self, account_ids: &[Uuid], limit: i64, offset: i64) -> Result<ThreadPage, anyhow::Error>;
    /// Returns the thread of this account whose subject equals `subject`,
    /// creating it when none exists. Serialized per account.
    async fn find_or_create_thread(&self, account_id: Uuid, subject: &str, snippet: &str, at: DateTime<Utc>) -> Result<SubjectThread, anyhow::Error>;
    async fn create_thread(&self, account_id: Uuid, subject: &str, snippet: &str, at: DateTime<Utc>) -> Result<Uuid, anyhow::Error>;

    async fn message(&self, id: Uuid) -> Result<Option<Message>, anyhow::Error>;
    async fn message_by_provider_id(&self, account_id: Uuid, message_id: &str) -> Result<Option<Message>, anyhow::Error>;
    async fn thread_of_provider_message(&self, account_id: Uuid, message_id: &str) -> Result<Option<Uuid>, anyhow::Error>;
    async fn messages_in_thread(&self, thread_id: Uuid) -> Result<Vec<Message>, anyhow::Error>;
    /// Newest received first. Messages never received (outbound) sort after
    /// received ones, newest created first.
    async fn messages_page(&self, filter: &MessageFilter, limit: i64, offset: i64) -> Result<MessagePage, anyhow::Error>;
    /// Applies `touch` and inserts `message` as one unit.
    async fn record_message(&self, touch: ThreadTouch, message: NewMessage) -> Result<PersistOutcome, anyhow::Error>;
    async fn set_message_status(&self, id: Uuid, status: MessageStatus, provider_id: Option<&str>, sent_at: Option<DateTime<Utc>>) -> Result<(), anyhow::Error>;
    async fn set_message_flags(&self, id: Uuid, is_read: Option<bool>, is_starred: Option<bool>) -> Result<Option<Message>, anyhow::Error>;
    async fn apply_classification(&self, message_id: Uuid, thread_id: Option<Uuid>, classification: &Classification) -> Result<(), anyhow::Error>;

    async fn session_user(&self, token: &str) -> Result<Option<String>, anyhow::Error>;
}

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
    pub accounts: AccountQueries,
    pub threads: ThreadQueries,
    pub messages: MessageQueries,
    pub sessions: SessionQueries,
}

impl Database {
    pub async fn new(config: &Config) -> Result<Self, anyhow::Error> {

        let mut opts: PgConnectOptions = config.db.url.parse()?;
        opts = opts.log_statements(log::LevelFilter::Debug);

        let pool = PgPoolOptions::new()
            .max_connections(config.db.max_connections)
            .min_connections(1)
            .connect_with(opts)
            .await;

        let pool = match pool {
            Ok(pool) => pool,
            Err(e) => {
                let mut error: &dyn std::error::Error = &e;
                let mut chain = error.to_string();
                while let Some(source) = error.source() {
                    chain.push_str(&format!("\nCaused by: {}", source));
                    error = source;
                }
                anyhow::bail!("Could not connect to the database:\n{}", chain);
            }
        };

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            accounts: AccountQueries::new(pool.clone()),
            threads: ThreadQueries::new(pool.clone()),
            messages: MessageQueries::new(pool.clone()),
            sessions: SessionQueries::new(pool.clone()),
            pool,
        }
    }

    pub async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::info!("Schema applied");
        Ok(())
    }
}

/// Picks the backing store from `db.url`.
pub async fn connect(config: &Config) -> Result<Arc<dyn Store>, anyhow::Error> {
    if config.db.in_memory() {
        tracing::warn!("Using the in-memory store. Nothing will be persisted.");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let db = Database::new(config).await?;
    Ok(Arc::new(db))
}

#[async_trait::async_trait]
impl Store for Database {
    async fn account_by_email(&self, email: &str) -> Result<Option<Account>, anyhow::Error> {
        self.accounts.by_email(email).await
    }

    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>, anyhow::Error> {
        self.accounts.by_id(id).await
    }

    async fn accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>, anyhow::Error> {
        self.accounts.for_user(user_id).await
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account, anyhow::Error> {
        self.accounts.create(account).await
    }

    async fn set_default_account(&self, user_id: &str, id: Uuid) -> Result<Option<Account>, anyhow::Error> {
        self.accounts.set_default(user_id, id).await
    }

    async fn delete_account(&self, id: Uuid) -> Result<bool, anyhow::Error> {
        self.accounts.delete(id).await
    }

    async fn thread(&self, id: Uuid) -> Result<Option<Thread>, anyhow::Error> {
        self.threads.get(id).await
    }

    async fn threads_for_accounts(&self, account_ids: &[Uuid], limit: i64, offset: i64) -> Result<ThreadPage, anyhow::Error> {
        self.threads.page(account_ids, limit, offset).await
    }

    async fn find_or_create_thread(&self, account_id: Uuid, subject: &str, snippet: &str, at: DateTime<Utc>) -> Result<SubjectThread, anyhow::Error> {
        self.threads.find_or_create(account_id, subject, snippet, at).await
    }

    async fn create_thread(&self, account_id: Uuid, subject: &str, snippet: &str, at: DateTime<Utc>) -> Result<Uuid, anyhow::Error> {
        self.threads.create(account_id, subject, snippet, at).await
    }

    async fn message(&self, id: Uuid) -> Result<Option<Message>, anyhow::Error> {
        self.messages.get(id).await
    }

    async fn message_by_provider_id(&self, account_id: Uuid, message_id: &str) -> Result<Option<Message>, anyhow::Error> {
        self.messages.by_provider_id(account_id, message_id).await
    }

    async fn thread_of_provider_message(&self, account_id: Uuid, message_id: &str) -> Result<Option<Uuid>, anyhow::Error> {
        self.messages.thread_of(account_id, message_id).await
    }

    async fn messages_in_thread(&self, thread_id: Uuid) -> Result<Vec<Message>, anyhow::Error> {
        self.messages.in_thread(thread_id).await
    }

    async fn messages_page(&self, filter: &MessageFilter, limit: i64, offset: i64) -> Result<MessagePage, anyhow::Error> {
        self.messages.page(filter, limit, offset).await
    }

    async fn record_message(&self, touch: ThreadTouch, message: NewMessage) -> Result<PersistOutcome, anyhow::Error> {
        self.messages.record(touch, message).await
    }

    async fn set_message_status(&self, id: Uuid, status: MessageStatus, provider_id: Option<&str>, sent_at: Option<DateTime<Utc>>) -> Result<(), anyhow::Error> {
        self.messages.set_status(id, status, provider_id, sent_at).await
    }

    async fn set_message_flags(&self, id: Uuid, is_read: Option<bool>, is_starred: Option<bool>) -> Result<Option<Message>, anyhow::Error> {
        self.messages.set_flags(id, is_read, is_starred).await
    }

    async fn apply_classification(&self, message_id: Uuid, thread_id: Option<Uuid>, classification: &Classification) -> Result<(), anyhow::Error> {
        self.messages.apply_classification(message_id, thread_id, classification).await
    }

    async fn session_user(&self, token: &str) -> Result<Option<String>, anyhow::Error> {
        self.sessions.user_for_token(token).await
    }
}
