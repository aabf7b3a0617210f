use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::AppError;
use crate::email::Account;
use crate::email::classify::{ClassificationJob, ClassifyRequest};
use crate::email::parse::{bare_address, extract_refs, strip_brackets, HeaderBag};
use crate::email::persist::{persist_inbound, InboundEmail};
use crate::email::PersistOutcome;

pub const EMAIL_RECEIVED: &str = "email.received";

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Recipient fields arrive either as a single address or a list.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Every field is optional. A field that is missing, `null` or of the wrong
/// shape takes its default instead of failing the event.
#[derive(Clone, Debug, Deserialize)]
pub struct ReceivedEmail {
    #[serde(default, deserialize_with = "lenient")]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub to: Option<OneOrMany>,
    #[serde(default, deserialize_with = "lenient")]
    pub cc: Option<OneOrMany>,
    #[serde(default, deserialize_with = "lenient")]
    pub subject: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub html: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub headers: Option<BTreeMap<String, Value>>,
    #[serde(default, deserialize_with = "lenient")]
    pub message_id: Option<String>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

impl ReceivedEmail {
    /// Non-string header values are dropped.
    fn header_bag(&self) -> HeaderBag {
        HeaderBag::new(
            self.headers.iter()
                .flatten()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect(),
        )
    }

    fn into_inbound(self) -> InboundEmail {
        let headers = self.header_bag();

        let message_id = self.message_id
            .as_deref()
            .or_else(|| headers.get("Message-ID"))
            .map(strip_brackets)
            .filter(|id| !id.is_empty());

        InboundEmail {
            message_id,
            from: self.from.unwrap_or_default(),
            to: self.to.map(OneOrMany::into_vec).unwrap_or_default(),
            cc: self.cc.map(OneOrMany::into_vec).unwrap_or_default(),
            subject: InboundEmail::subject_or_default(self.subject),
            html: self.html,
            text: self.text,
            headers,
        }
    }
}

pub async fn resend_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {

    match tokio::time::timeout(state.config.webhook.timeout(), ingest(&state, &headers, &body)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Webhook processing timed out");
            Err(AppError::Timeout)
        }
    }
}

async fn ingest(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Json<Value>, AppError> {

    if !state.verifier.verify(headers, body).accepted() {
        warn!("Rejected webhook with invalid signature");
        return Err(AppError::InvalidSignature);
    }

    let event: WebhookEvent = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid payload: {}", e)))?;

    if event.event_type != EMAIL_RECEIVED {
        debug!(event_type = %event.event_type, "Ignoring webhook event");
        return Ok(Json(json!({ "ok": true })));
    }

    let received: ReceivedEmail = serde_json::from_value(event.data)
        .map_err(|e| AppError::BadRequest(format!("Invalid email data: {}", e)))?;

    let email = received.into_inbound();

    let account = route(state, &email.to).await?;

    if let Some(message_id) = &email.message_id {
        if let Some(existing) = state.store.message_by_provider_id(account.id, message_id).await? {
            info!(email_id = %existing.id, "Duplicate delivery, skipping");
            return Ok(duplicate(existing.id));
        }
    }

    let refs = extract_refs(&email.headers, &email.subject);
    let now = Utc::now();

    let resolution = state.resolver
        .resolve(account.id, &refs, &email.snippet(), now)
        .await?;

    debug!(thread_id = %resolution.thread_id, matched_by = ?resolution.matched_by, "Resolved thread");

    let request = ClassifyRequest::new(
        &email.from,
        &email.subject,
        email.text.as_deref(),
        email.html.as_deref(),
    );

    let email_id = match persist_inbound(state.store.as_ref(), account.id, &resolution, email, now).await? {
        PersistOutcome::Inserted(id) => id,
        PersistOutcome::Duplicate(id) => {
            info!(email_id = %id, "Duplicate delivery, skipping");
            return Ok(duplicate(id));
        }
    };

    info!(%email_id, thread_id = %resolution.thread_id, "Stored inbound email");

    match &state.classifier {
        Some(dispatcher) => {
            dispatcher.dispatch(ClassificationJob {
                message_id: email_id,
                thread_id: Some(resolution.thread_id),
                request,
            });
        }
        None => debug!(%email_id, "Classifier disabled, skipping"),
    }

    Ok(Json(json!({
        "ok": true,
        "emailId": email_id,
    })))
}

/// First recipient that belongs to an account wins.
async fn route(state: &AppState, recipients: &[String]) -> Result<Account, AppError> {
    for recipient in recipients {
        let address = bare_address(recipient);
        if let Some(account) = state.store.account_by_email(&address).await? {
            return Ok(account);
        }
    }

    warn!(?recipients, "No account for recipients");
    Err(AppError::NotFound("Account not found".to_string()))
}

fn duplicate(id: Uuid) -> Json<Value> {
    Json(json!({
        "ok": true,
        "emailId": id,
        "duplicate": true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipients_accept_string_or_list() {
        let one: ReceivedEmail = serde_json::from_value(json!({
            "from": "a@x.com", "to": "b@y.com"
        })).unwrap();
        assert_eq!(one.into_inbound().to, vec!["b@y.com"]);

        let many: ReceivedEmail = serde_json::from_value(json!({
            "from": "a@x.com", "to": ["b@y.com", "c@y.com"], "cc": "d@y.com"
        })).unwrap();
        let inbound = many.into_inbound();
        assert_eq!(inbound.to.len(), 2);
        assert_eq!(inbound.cc, vec!["d@y.com"]);
    }

    #[test]
    fn defaults_and_message_id_fallback() {
        let received: ReceivedEmail = serde_json::from_value(json!({
            "from": "a@x.com",
            "to": ["b@y.com"],
            "headers": { "message-id": "<m1@x.com>", "X-Spam-Score": 3 }
        })).unwrap();

        let inbound = received.into_inbound();
        assert_eq!(inbound.message_id.as_deref(), Some("m1@x.com"));
        assert_eq!(inbound.subject, "(no subject)");
        assert!(inbound.text.is_none());
        assert!(inbound.headers.get("x-spam-score").is_none());
    }

    #[test]
    fn null_and_misshapen_fields_default() {
        let received: ReceivedEmail = serde_json::from_value(json!({
            "from": null,
            "to": "b@y.com",
            "cc": 7,
            "subject": null,
            "text": ["not", "text"],
            "headers": ["In-Reply-To", "<m1>"],
            "message_id": null
        })).unwrap();

        let inbound = received.into_inbound();
        assert_eq!(inbound.from, "");
        assert_eq!(inbound.to, vec!["b@y.com"]);
        assert!(inbound.cc.is_empty());
        assert_eq!(inbound.subject, "(no subject)");
        assert!(inbound.text.is_none());
        assert!(inbound.message_id.is_none());
        assert!(inbound.headers.get("In-Reply-To").is_none());

        let received: ReceivedEmail = serde_json::from_value(json!({
            "to": "b@y.com",
            "headers": null
        })).unwrap();
        assert!(received.into_inbound().headers.get("Message-ID").is_none());
    }

    #[test]
    fn explicit_message_id_is_preferred() {
        let received: ReceivedEmail = serde_json::from_value(json!({
            "to": "b@y.com",
            "message_id": "<m2>",
            "headers": { "Message-ID": "<other>" }
        })).unwrap();
        assert_eq!(received.into_inbound().message_id.as_deref(), Some("m2"));
    }
}
