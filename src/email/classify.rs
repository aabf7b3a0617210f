use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Store;

const BODY_LIMIT: usize = 2000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub summary: String,
    pub category: String,
    #[serde(deserialize_with = "whole_priority")]
    pub priority: i32,
    #[serde(default)]
    pub suggested_labels: Vec<String>,
}

/// Models often answer `3.0` or `4.5` for an integer field.
fn whole_priority<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() {
        return Err(serde::de::Error::custom("priority is not a finite number"));
    }
    Ok(value.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
}

#[derive(Clone, Debug)]
pub struct ClassifyRequest {
    pub from: String,
    pub subject: String,
    pub body_text: String,
}

impl ClassifyRequest {
    /// Falls back to text rendered from the HTML part when there is no plain
    /// text body.
    pub fn new(from: &str, subject: &str, text: Option<&str>, html: Option<&str>) -> Self {
        let body = match (text, html) {
            (Some(text), _) if !text.trim().is_empty() => text.to_string(),
            (_, Some(html)) => html2text::from_read(html.as_bytes(), 80).unwrap_or_default(),
            _ => String::new(),
        };

        Self {
            from: from.to_string(),
            subject: subject.to_string(),
            body_text: body.chars().take(BODY_LIMIT).collect(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Classifier request failed: {0}")]
    Request(String),
    #[error("Classifier returned an unusable response: {0}")]
    Response(String),
    #[error("Classifier timed out")]
    Timeout,
}

#[async_trait::async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, ClassifyError>;
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

const SYSTEM_PROMPT: &str = "You classify emails. Reply with a JSON object with the keys \
\"category\" (one of primary, social, promotions, updates, forums, spam), \
\"priority\" (integer 1 lowest to 5 urgent), \"summary\" (one sentence) and \
\"suggestedLabels\" (array of short label names).";

/// Talks to an OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpClassifier {
    pub fn new(config: &Config) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.classifier.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1/chat/completions", config.classifier.endpoint.trim_end_matches('/')),
            model: config.classifier.model.clone(),
            api_key: config.classifier.api_key.clone(),
        })
    }
}

#[async_trait::async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, ClassifyError> {

        let prompt = format!(
            "Classify this email:\nFrom: {}\nSubject: {}\nBody: {}",
            request.from, request.subject, request.body_text
        );

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt }
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await
            .map_err(|e| ClassifyError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ClassifyError::Request(format!("status {}", resp.status())));
        }

        let parsed: ChatResponse = resp.json().await
            .map_err(|e| ClassifyError::Response(e.to_string()))?;

        let content = parsed.choices.first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ClassifyError::Response("no choices".to_string()))?;

        parse_classification(content)
    }
}

pub fn parse_classification(content: &str) -> Result<Classification, ClassifyError> {
    let mut classification: Classification = serde_json::from_str(content.trim())
        .map_err(|e| ClassifyError::Response(e.to_string()))?;
    classification.priority = classification.priority.clamp(1, 5);
    Ok(classification)
}

#[derive(Clone, Debug)]
pub struct ClassificationJob {
    pub message_id: Uuid,
    pub thread_id: Option<Uuid>,
    pub request: ClassifyRequest,
}

/// Runs classification off the request path.
///
/// Jobs go into a bounded queue drained by one worker task, which runs up to
/// `concurrency` of them at once, each under `timeout`. Callers never wait on
/// a job and never see its failure; results only show up as the AI columns
/// being filled in later.
#[derive(Clone)]
pub struct ClassificationDispatcher {
    tx: mpsc::Sender<ClassificationJob>,
}

impl ClassificationDispatcher {
    pub fn spawn(
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn Store>,
        queue_size: usize,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        tokio::spawn(run_worker(rx, classifier, store, concurrency.max(1), timeout));
        Self { tx }
    }

    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> Result<Option<Self>, anyhow::Error> {
        if !config.classifier.enabled {
            info!("Classification is disabled");
            return Ok(None);
        }

        let classifier = Arc::new(HttpClassifier::new(config)?);

        Ok(Some(Self::spawn(
            classifier,
            store,
            config.classifier.queue_size,
            config.classifier.concurrency,
            Duration::from_secs(config.classifier.timeout_secs),
        )))
    }

    /// Enqueues without waiting. Returns false when the job was dropped.
    pub fn dispatch(&self, job: ClassificationJob) -> bool {
        let message_id = job.message_id;
        match self.tx.try_send(job) {
            Ok(()) => {
                debug!(%message_id, "Classification queued");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%message_id, "Classification queue is full, skipping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(%message_id, "Classification worker has stopped, skipping");
                false
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<ClassificationJob>,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn Store>,
    concurrency: usize,
    timeout: Duration,
) {
    let permits = Arc::new(Semaphore::new(concurrency));

    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        let classifier = classifier.clone();
        let store = store.clone();

        tokio::spawn(async move {
            let _permit = permit;
            classify_and_store(classifier.as_ref(), store.as_ref(), job, timeout).await;
        });
    }

    debug!("Classification worker stopped");
}

async fn classify_and_store(
    classifier: &dyn Classifier,
    store: &dyn Store,
    job: ClassificationJob,
    timeout: Duration,
) {
    let message_id = job.message_id;

    let result = match tokio::time::timeout(timeout, classifier.classify(&job.request)).await {
        Ok(result) => result,
        Err(_) => Err(ClassifyError::Timeout),
    };

    let classification = match result {
        Ok(classification) => classification,
        Err(e) => {
            warn!(%message_id, "Classification failed: {}", e);
            return;
        }
    };

    debug!(%message_id, labels = ?classification.suggested_labels, "Suggested labels");

    match store.apply_classification(message_id, job.thread_id, &classification).await {
        Ok(()) => info!(%message_id, category = %classification.category, priority = classification.priority, "Message classified"),
        Err(e) => warn!(%message_id, "Failed to store classification: {:#}", e),
    }
}
