use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{MessageFilter, MessagePage, Store, SubjectThread, ThreadPage};
use crate::email::classify::Classification;
use crate::email::{
    Account, Message, MessageStatus, NewAccount, NewMessage, PersistOutcome, Thread, ThreadTouch,
};

#[derive(Default)]
struct Inner {
    accounts: Vec<Account>,
    threads: Vec<Thread>,
    messages: Vec<Message>,
    sessions: HashMap<String, (String, DateTime<Utc>)>,
}

/// Process-local `Store`. Every operation takes the one lock, which also
/// gives `find_or_create_thread` its per-account atomicity.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_writes: AtomicBool,
    fail_inserts: AtomicBool,
    stall: std::sync::Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_session(&self, token: &str, user_id: &str, expires_at: DateTime<Utc>) {
        self.inner.write().await
            .sessions
            .insert(token.to_string(), (user_id.to_string(), expires_at));
    }

    /// Makes every subsequent write fail, to exercise storage outages.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes `record_message` fail while thread creation keeps working, to
    /// exercise a crash between resolving a thread and storing the message.
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Delays every `record_message` call, to exercise slow storage.
    pub fn stall_inserts(&self, delay: Option<Duration>) {
        if let Ok(mut stall) = self.stall.lock() {
            *stall = delay;
        }
    }

    pub async fn thread_count(&self) -> usize {
        self.inner.read().await.threads.len()
    }

    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    fn check_writable(&self) -> Result<(), anyhow::Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("store is unavailable");
        }
        Ok(())
    }
}

fn new_thread(account_id: Uuid, subject: &str, snippet: &str, at: DateTime<Utc>) -> Thread {
    Thread {
        id: Uuid::new_v4(),
        account_id,
        subject: subject.to_string(),
        last_message_at: at,
        message_count: 0,
        is_read: false,
        is_starred: false,
        snippet: Some(snippet.to_string()),
        ai_summary: None,
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn account_by_email(&self, email: &str) -> Result<Option<Account>, anyhow::Error> {
        let email = email.to_lowercase();
        let inner = self.inner.read().await;
        Ok(inner.accounts.iter().find(|a| a.email == email).cloned())
    }

    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>, anyhow::Error> {
        let inner = self.inner.read().await;
        Ok(inner.accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>, anyhow::Error> {
        let inner = self.inner.read().await;
        Ok(inner.accounts.iter().filter(|a| a.user_id == user_id).cloned().collect())
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account, anyhow::Error> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;

        let email = account.email.to_lowercase();
        if inner.accounts.iter().any(|a| a.email == email) {
            anyhow::bail!("account {} already exists", email);
        }

        let is_default = !inner.accounts.iter().any(|a| a.user_id == account.user_id);
        let account = Account {
            id: Uuid::new_v4(),
            user_id: account.user_id,
            email,
            name: account.name,
            api_key: account.api_key,
            is_default,
            created_at: Utc::now(),
        };
        inner.accounts.push(account.clone());
        Ok(account)
    }

    async fn set_default_account(&self, user_id: &str, id: Uuid) -> Result<Option<Account>, anyhow::Error> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;

        if !inner.accounts.iter().any(|a| a.id == id && a.user_id == user_id) {
            return Ok(None);
        }

        for account in inner.accounts.iter_mut().filter(|a| a.user_id == user_id) {
            account.is_default = account.id == id;
        }
        Ok(inner.accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn delete_account(&self, id: Uuid) -> Result<bool, anyhow::Error> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;

        let Some(index) = inner.accounts.iter().position(|a| a.id == id) else {
            return Ok(false);
        };
        let removed = inner.accounts.remove(index);
        inner.threads.retain(|t| t.account_id != id);
        inner.messages.retain(|m| m.account_id != id);

        if removed.is_default {
            let next = inner.accounts.iter_mut()
                .filter(|a| a.user_id == removed.user_id)
                .min_by_key(|a| a.created_at);
            if let Some(next) = next {
                next.is_default = true;
            }
        }
        Ok(true)
    }

    async fn thread(&self, id: Uuid) -> Result<Option<Thread>, anyhow::Error> {
        let inner = self.inner.read().await;
        Ok(inner.threads.iter().find(|t| t.id == id).cloned())
    }

    async fn threads_for_accounts(&self, account_ids: &[Uuid], limit: i64, offset: i64) -> Result<ThreadPage, anyhow::Error> {
        let inner = self.inner.read().await;

        let mut threads: Vec<Thread> = inner.threads.iter()
            .filter(|t| account_ids.contains(&t.account_id))
            .cloned()
            .collect();
        threads.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));

        let total = threads.len() as i64;
        let threads = threads.into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();

        Ok(ThreadPage { threads, total })
    }

    async fn find_or_create_thread(&self, account_id: Uuid, subject: &str, snippet: &str, at: DateTime<Utc>) -> Result<SubjectThread, anyhow::Error> {
        let mut inner = self.inner.write().await;

        let existing = inner.threads.iter()
            .filter(|t| t.account_id == account_id && t.subject == subject)
            .max_by_key(|t| t.last_message_at);

        if let Some(thread) = existing {
            return Ok(SubjectThread { thread_id: thread.id, created: false });
        }

        self.check_writable()?;
        let thread = new_thread(account_id, subject, snippet, at);
        let thread_id = thread.id;
        inner.threads.push(thread);

        Ok(SubjectThread { thread_id, created: true })
    }

    async fn create_thread(&self, account_id: Uuid, subject: &str, snippet: &str, at: DateTime<Utc>) -> Result<Uuid, anyhow::Error> {
        self.check_writable()?;
        let thread = new_thread(account_id, subject, snippet, at);
        let thread_id = thread.id;
        self.inner.write().await.threads.push(thread);
        Ok(thread_id)
    }

    async fn message(&self, id: Uuid) -> Result<Option<Message>, anyhow::Error> {
        let inner = self.inner.read().await;
        Ok(inner.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn message_by_provider_id(&self, account_id: Uuid, message_id: &str) -> Result<Option<Message>, anyhow::Error> {
        let inner = self.inner.read().await;
        Ok(inner.messages.iter()
            .find(|m| m.account_id == account_id && m.message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn thread_of_provider_message(&self, account_id: Uuid, message_id: &str) -> Result<Option<Uuid>, anyhow::Error> {
        let inner = self.inner.read().await;
        Ok(inner.messages.iter()
            .filter(|m| m.account_id == account_id && m.message_id.as_deref() == Some(message_id))
            .find_map(|m| m.thread_id))
    }

    async fn messages_in_thread(&self, thread_id: Uuid) -> Result<Vec<Message>, anyhow::Error> {
        let inner = self.inner.read().await;
        Ok(inner.messages.iter().filter(|m| m.thread_id == Some(thread_id)).cloned().collect())
    }

    async fn messages_page(&self, filter: &MessageFilter, limit: i64, offset: i64) -> Result<MessagePage, anyhow::Error> {
        let inner = self.inner.read().await;

        let mut messages: Vec<Message> = inner.messages.iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        messages.sort_by(|a, b| {
            b.received_at.is_some().cmp(&a.received_at.is_some())
                .then(b.received_at.cmp(&a.received_at))
                .then(b.created_at.cmp(&a.created_at))
        });

        let total = messages.len() as i64;
        let messages = messages.into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();

        Ok(MessagePage { messages, total })
    }

    async fn record_message(&self, touch: ThreadTouch, message: NewMessage) -> Result<PersistOutcome, anyhow::Error> {
        self.check_writable()?;
        if self.fail_inserts.load(Ordering::SeqCst) {
            anyhow::bail!("message insert failed");
        }
        let stall = self.stall.lock().ok().and_then(|stall| *stall);
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.write().await;

        if let Some(provider_id) = message.message_id.as_deref() {
            let existing = inner.messages.iter()
                .find(|m| m.account_id == message.account_id && m.message_id.as_deref() == Some(provider_id));
            if let Some(existing) = existing {
                return Ok(PersistOutcome::Duplicate(existing.id));
            }
        }

        let Some(thread) = inner.threads.iter_mut().find(|t| t.id == touch.thread_id) else {
            anyhow::bail!("thread {} does not exist", touch.thread_id);
        };
        thread.last_message_at = touch.at;
        thread.snippet = Some(touch.snippet);
        thread.is_read = touch.is_read;
        thread.message_count += 1;

        let id = Uuid::new_v4();
        inner.messages.push(Message {
            id,
            account_id: message.account_id,
            thread_id: Some(message.thread_id),
            message_id: message.message_id,
            direction: message.direction,
            from: message.from,
            to: message.to,
            cc: message.cc,
            bcc: message.bcc,
            subject: message.subject,
            body_html: message.body_html,
            body_text: message.body_text,
            snippet: message.snippet,
            is_read: message.is_read,
            is_starred: false,
            status: message.status,
            ai_summary: None,
            ai_category: None,
            ai_priority: None,
            headers: message.headers,
            sent_at: message.sent_at,
            received_at: message.received_at,
            created_at: Utc::now(),
        });

        Ok(PersistOutcome::Inserted(id))
    }

    async fn set_message_status(&self, id: Uuid, status: MessageStatus, provider_id: Option<&str>, sent_at: Option<DateTime<Utc>>) -> Result<(), anyhow::Error> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;

        if let Some(message) = inner.messages.iter_mut().find(|m| m.id == id) {
            message.status = status;
            if let Some(provider_id) = provider_id {
                message.message_id = Some(provider_id.to_string());
            }
            if sent_at.is_some() {
                message.sent_at = sent_at;
            }
        }
        Ok(())
    }

    async fn set_message_flags(&self, id: Uuid, is_read: Option<bool>, is_starred: Option<bool>) -> Result<Option<Message>, anyhow::Error> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;

        Ok(inner.messages.iter_mut().find(|m| m.id == id).map(|message| {
            if let Some(is_read) = is_read {
                message.is_read = is_read;
            }
            if let Some(is_starred) = is_starred {
                message.is_starred = is_starred;
            }
            message.clone()
        }))
    }

    async fn apply_classification(&self, message_id: Uuid, thread_id: Option<Uuid>, classification: &Classification) -> Result<(), anyhow::Error> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;

        if let Some(message) = inner.messages.iter_mut().find(|m| m.id == message_id) {
            message.ai_summary = Some(classification.summary.clone());
            message.ai_category = Some(classification.category.clone());
            message.ai_priority = Some(classification.priority);
        }
        if let Some(thread) = thread_id.and_then(|id| inner.threads.iter_mut().find(|t| t.id == id)) {
            thread.ai_summary = Some(classification.summary.clone());
        }
        Ok(())
    }

    async fn session_user(&self, token: &str) -> Result<Option<String>, anyhow::Error> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(token)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(user_id, _)| user_id.clone()))
    }
}
