use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::cache::ClientCache;
use crate::config::Config;
use crate::crypto::CredentialCipher;
use crate::db::Store;
use crate::email::parse::{normalize_subject, snippet, strip_brackets};
use crate::email::{
    Account, Direction, Message, MessageStatus, NewMessage, ThreadTouch,
};
use crate::error::AppError;

#[derive(Clone, Debug, Serialize)]
pub struct OutboundEmail {
    pub from: String,
    pub to: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_message_id: String,
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("{0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// The provider's send capability.
#[async_trait::async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, api_key: &str, email: &OutboundEmail) -> Result<SendReceipt, SendError>;
}

pub struct ResendClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ResendClient {
    pub fn new(api_key: &str, api_base: &str, timeout: Duration) -> Result<Self, SendError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| SendError::Rejected("API key is not a valid header value".to_string()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| SendError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}/emails", api_base.trim_end_matches('/')),
        })
    }

    pub async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, SendError> {
        #[derive(Deserialize)]
        struct Sent {
            id: String,
        }

        #[derive(Deserialize)]
        struct Failure {
            message: Option<String>,
        }

        let resp = self.http.post(&self.endpoint)
            .json(email)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let reason = resp.json::<Failure>().await
                .ok()
                .and_then(|f| f.message)
                .unwrap_or_else(|| format!("provider answered {}", status));
            return Err(SendError::Rejected(reason));
        }

        let sent: Sent = resp.json().await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        Ok(SendReceipt { provider_message_id: sent.id })
    }
}

/// Sends through the provider's HTTP API, one cached client per credential.
pub struct ResendSender {
    clients: ClientCache<ResendClient>,
    api_base: String,
    timeout: Duration,
}

impl ResendSender {
    pub fn new(config: &Config) -> Self {
        Self {
            clients: ClientCache::new(&config.provider.client_cache),
            api_base: config.provider.api_base.clone(),
            timeout: Duration::from_secs(config.provider.timeout_secs),
        }
    }
}

#[async_trait::async_trait]
impl MailSender for ResendSender {
    async fn send(&self, api_key: &str, email: &OutboundEmail) -> Result<SendReceipt, SendError> {
        let client = self.clients.get_or_try_insert(api_key, || {
            ResendClient::new(api_key, &self.api_base, self.timeout)
        })?;
        client.send(email).await
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub account_id: Uuid,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub reply_to: Option<String>,
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
    pub thread_id: Option<Uuid>,
}

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Thread not found")]
    ThreadNotFound,
    #[error("Message {message_id} failed: {reason}")]
    Failed { message_id: Uuid, reason: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<OutboxError> for AppError {
    fn from(e: OutboxError) -> Self {
        match e {
            OutboxError::ThreadNotFound => AppError::NotFound("Thread not found".to_string()),
            OutboxError::Failed { reason, .. } => AppError::Upstream(reason),
            OutboxError::Storage(e) => AppError::Database(e),
        }
    }
}

/// The outbound path: thread bookkeeping, a draft row, the provider call,
/// then `sent` or `failed`.
#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn Store>,
    sender: Arc<dyn MailSender>,
    cipher: CredentialCipher,
}

impl Outbox {
    pub fn new(store: Arc<dyn Store>, sender: Arc<dyn MailSender>, cipher: CredentialCipher) -> Self {
        Self { store, sender, cipher }
    }

    pub async fn send(&self, account: &Account, req: SendRequest) -> Result<Message, OutboxError> {
        let now = Utc::now();
        let snippet = snippet(req.text.as_deref().unwrap_or_default());

        let thread_id = match req.thread_id {
            Some(thread_id) => {
                self.store.thread(thread_id).await?
                    .filter(|t| t.account_id == account.id)
                    .ok_or(OutboxError::ThreadNotFound)?
                    .id
            }
            None => {
                let subject = normalize_subject(&req.subject);
                self.store.create_thread(account.id, &subject, &snippet, now).await?
            }
        };

        let mut headers = BTreeMap::new();
        if let Some(in_reply_to) = &req.in_reply_to {
            headers.insert("In-Reply-To".to_string(), in_reply_to.clone());
        }
        if !req.references.is_empty() {
            headers.insert("References".to_string(), req.references.join(" "));
        }

        let from = format!("{} <{}>", account.name, account.email);

        let touch = ThreadTouch {
            thread_id,
            at: now,
            snippet: snippet.clone(),
            is_read: true,
        };

        let draft = NewMessage {
            account_id: account.id,
            thread_id,
            message_id: None,
            direction: Direction::Outbound,
            from: from.clone(),
            to: req.to.clone(),
            cc: req.cc.clone(),
            bcc: req.bcc.clone(),
            subject: req.subject.clone(),
            body_html: req.html.clone(),
            body_text: req.text.clone(),
            snippet,
            is_read: true,
            status: MessageStatus::Draft,
            headers: headers.clone(),
            sent_at: None,
            received_at: None,
        };

        let message_id = self.store.record_message(touch, draft).await?.id();

        let email = OutboundEmail {
            from,
            to: req.to,
            cc: req.cc,
            bcc: req.bcc,
            subject: req.subject,
            text: match (&req.html, req.text) {
                (None, None) => Some(String::new()),
                (_, text) => text,
            },
            html: req.html,
            reply_to: req.reply_to,
            headers,
        };

        let outcome = match self.cipher.decrypt(&account.api_key) {
            Ok(api_key) => self.sender.send(&api_key, &email).await.map_err(|e| e.to_string()),
            Err(e) => {
                tracing::error!(account_id = %account.id, "Could not decrypt provider key: {}", e);
                Err("provider credential is unreadable".to_string())
            }
        };

        match outcome {
            Ok(receipt) => {
                let provider_id = strip_brackets(&receipt.provider_message_id);
                self.transition(message_id, MessageStatus::Sent, Some(&provider_id), Some(Utc::now())).await?;
                tracing::info!(%message_id, provider_id = %provider_id, "Message sent");
            }
            Err(reason) => {
                self.transition(message_id, MessageStatus::Failed, None, None).await?;
                tracing::warn!(%message_id, "Send failed: {}", reason);
                return Err(OutboxError::Failed { message_id, reason });
            }
        }

        self.store.message(message_id).await?
            .ok_or_else(|| OutboxError::Storage(anyhow::anyhow!("message {} vanished", message_id)))
    }

    async fn transition(
        &self,
        id: Uuid,
        next: MessageStatus,
        provider_id: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), anyhow::Error> {
        let current = self.store.message(id).await?
            .ok_or_else(|| anyhow::anyhow!("message {} not found", id))?
            .status;

        if !current.can_transition_to(next) {
            anyhow::bail!("illegal status change {} -> {} for message {}", current, next, id);
        }

        self.store.set_message_status(id, next, provider_id, sent_at).await
    }
}
