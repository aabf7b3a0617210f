#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::Value;
use tower::ServiceExt;

use threadmail::AppState;
use threadmail::config::{Config, ConfigBuilder, DB, Encryption, Webhook};
use threadmail::crypto::{sign_hex, CredentialCipher};
use threadmail::db::{MemoryStore, Store};
use threadmail::email::classify::{
    Classification, ClassificationDispatcher, Classifier, ClassifyError, ClassifyRequest,
};
use threadmail::email::send::{MailSender, OutboundEmail, SendError, SendReceipt};
use threadmail::email::{Account, NewAccount};
use threadmail::server::router;

pub const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
pub const SECRET: &str = "whsec_test";
pub const USER: &str = "user-1";
pub const TOKEN: &str = "session-1";
pub const OTHER_USER: &str = "user-2";
pub const OTHER_TOKEN: &str = "session-2";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeClassifier {
    Answers,
    Fails,
    Hangs,
}

#[async_trait::async_trait]
impl Classifier for FakeClassifier {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, ClassifyError> {
        match self {
            FakeClassifier::Answers => {}
            FakeClassifier::Fails => return Err(ClassifyError::Request("status 500".to_string())),
            FakeClassifier::Hangs => tokio::time::sleep(Duration::from_secs(60)).await,
        }
        Ok(Classification {
            summary: format!("About {}", request.subject),
            category: "primary".to_string(),
            priority: 3,
            suggested_labels: vec!["work".to_string()],
        })
    }
}

#[derive(Default)]
pub struct FakeSender {
    pub fail: bool,
    pub sent: Mutex<Vec<OutboundEmail>>,
}

#[async_trait::async_trait]
impl MailSender for FakeSender {
    async fn send(&self, _api_key: &str, email: &OutboundEmail) -> Result<SendReceipt, SendError> {
        if self.fail {
            return Err(SendError::Rejected("The domain is not verified".to_string()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(SendReceipt { provider_message_id: "<out-1@resend.dev>".to_string() })
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub sender: Arc<FakeSender>,
    pub account: Account,
    pub app: Router,
}

pub struct Options {
    pub secret: Option<&'static str>,
    pub mode: &'static str,
    pub classify: bool,
    pub classifier: FakeClassifier,
    pub classify_timeout: Duration,
    pub webhook_timeout_secs: u64,
    pub fail_sends: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            secret: Some(SECRET),
            mode: "production",
            classify: true,
            classifier: FakeClassifier::Answers,
            classify_timeout: Duration::from_secs(5),
            webhook_timeout_secs: 10,
            fail_sends: false,
        }
    }
}

pub fn config(options: &Options) -> Config {
    ConfigBuilder::new()
        .with_db(DB { url: "memory://".into(), max_connections: 1 })
        .with_encryption(Encryption { master_key: MASTER_KEY.into() })
        .with_mode(options.mode.into())
        .with_webhook(Webhook {
            secret: options.secret.map(str::to_string),
            timeout_secs: options.webhook_timeout_secs,
            ..Webhook::default()
        })
        .build()
        .unwrap()
}

pub async fn harness() -> Harness {
    harness_with(Options::default()).await
}

pub async fn harness_with(options: Options) -> Harness {
    let config = config(&options);
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(FakeSender { fail: options.fail_sends, ..Default::default() });

    let classifier = options.classify.then(|| {
        ClassificationDispatcher::spawn(
            Arc::new(options.classifier),
            store.clone(),
            16,
            2,
            options.classify_timeout,
        )
    });

    let cipher = CredentialCipher::from_hex(MASTER_KEY).unwrap();
    let account = store.create_account(NewAccount {
        user_id: USER.into(),
        email: "b@y.com".into(),
        name: "Bea".into(),
        api_key: cipher.encrypt("re_test_key").unwrap(),
    }).await.unwrap();

    let expires = Utc::now() + chrono::Duration::hours(1);
    store.insert_session(TOKEN, USER, expires).await;
    store.insert_session(OTHER_TOKEN, OTHER_USER, expires).await;

    let state = AppState::with_parts(config, store.clone(), sender.clone(), classifier).unwrap();
    let app = router(state.clone());

    Harness { state, store, sender, account, app }
}

pub async fn read_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

impl Harness {
    pub async fn webhook_raw(&self, body: &[u8], signature: Option<String>) -> (StatusCode, Value) {
        let mut req = Request::post("/webhooks/resend")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            req = req.header("resend-signature", signature);
        }
        let response = self.app.clone()
            .oneshot(req.body(Body::from(body.to_vec())).unwrap())
            .await
            .unwrap();
        read_json(response).await
    }

    pub async fn webhook(&self, payload: &Value) -> (StatusCode, Value) {
        let body = serde_json::to_vec(payload).unwrap();
        let signature = sign_hex(SECRET, &body);
        self.webhook_raw(&body, Some(signature)).await
    }

    pub async fn api(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {}", token));
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let response = self.app.clone().oneshot(req).await.unwrap();
        read_json(response).await
    }
}

pub fn received(message_id: &str, subject: &str, headers: Value) -> Value {
    serde_json::json!({
        "type": "email.received",
        "data": {
            "from": "Ada <a@x.com>",
            "to": ["b@y.com"],
            "subject": subject,
            "text": "Here's the update...",
            "headers": headers,
            "message_id": message_id,
        }
    })
}
