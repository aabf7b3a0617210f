use serde::{Serialize, Deserialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    general: Option<General>,
    server: Option<Server>,
    db: Option<DB>,
    webhook: Option<Webhook>,
    provider: Option<Provider>,
    classifier: Option<Classifier>,
    encryption: Option<Encryption>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();

        let config_content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => return Err(format!("Failed to read config file: {}", e)),
        };

        Self::from_toml(&config_content)
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        let config: RawConfig = match toml::from_str(content) {
            Ok(config) => config,
            Err(e) => return Err(format!("Failed to parse config file: {}", e)),
        };

        Ok(Self {
            general: config.general,
            server: config.server,
            db: config.db,
            webhook: config.webhook,
            provider: config.provider,
            classifier: config.classifier,
            encryption: config.encryption,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        let server = self.server.get_or_insert(Server::default());
        server.http.port = port;
        self
    }

    pub fn with_mode(mut self, mode: String) -> Self {
        let general = self.general.get_or_insert(General::default());
        general.mode = Some(mode);
        self
    }

    pub fn with_db(mut self, db: DB) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_webhook(mut self, webhook: Webhook) -> Self {
        self.webhook = Some(webhook);
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_encryption(mut self, encryption: Encryption) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn build(self) -> Result<Config, anyhow::Error> {

        let db = self.db
            .ok_or_else(|| anyhow::anyhow!("Database configuration is required"))?;

        let encryption = self.encryption
            .ok_or_else(|| anyhow::anyhow!("Encryption configuration is required"))?;

        if encryption.master_key.len() != 64 || hex::decode(&encryption.master_key).is_err() {
            anyhow::bail!("encryption.master_key must be 32 bytes of hex (64 characters)");
        }

        let classifier = self.classifier.unwrap_or_default();

        if classifier.enabled && classifier.endpoint.is_empty() {
            anyhow::bail!("classifier.endpoint is required when the classifier is enabled");
        }

        Ok(Config {
            general: self.general.unwrap_or_default(),
            server: self.server.unwrap_or_default(),
            db,
            webhook: self.webhook.unwrap_or_default(),
            provider: self.provider.unwrap_or_default(),
            classifier,
            encryption,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    general: Option<General>,
    server: Option<Server>,
    db: Option<DB>,
    webhook: Option<Webhook>,
    provider: Option<Provider>,
    classifier: Option<Classifier>,
    encryption: Option<Encryption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: General,
    pub server: Server,
    pub db: DB,
    pub webhook: Webhook,
    pub provider: Provider,
    pub classifier: Classifier,
    pub encryption: Encryption,
}

impl Config {
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.http.host, self.server.http.port)
    }

    pub fn development_mode(&self) -> bool {
        self.general.mode.as_deref() == Some("development")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct General {
    pub mode: Option<String>,
}

impl Default for General {
    fn default() -> Self {
        General {
            mode: Some("production".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Server {
    #[serde(default)]
    pub http: HTTP,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HTTP {
    pub host: String,
    pub port: u16,
    pub allow_origin: Option<Vec<String>>,
}

impl Default for HTTP {
    fn default() -> Self {
        HTTP {
            host: "0.0.0.0".to_string(),
            port: 8989,
            allow_origin: Some(vec!["".to_string()]),
        }
    }
}

/// `url = "memory://"` runs against the in-process store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DB {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl DB {
    pub fn in_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Webhook {
    pub secret: Option<String>,
    pub signature_headers: Vec<String>,
    pub timeout_secs: u64,
}

impl Webhook {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for Webhook {
    fn default() -> Self {
        Webhook {
            secret: None,
            signature_headers: vec![
                "resend-signature".to_string(),
                "svix-signature".to_string(),
            ],
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Provider {
    pub api_base: String,
    pub timeout_secs: u64,
    pub client_cache: ClientCacheRules,
}

impl Default for Provider {
    fn default() -> Self {
        Provider {
            api_base: "https://api.resend.com".to_string(),
            timeout_secs: 15,
            client_cache: ClientCacheRules::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientCacheRules {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for ClientCacheRules {
    fn default() -> Self {
        ClientCacheRules {
            capacity: 256,
            ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Classifier {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub queue_size: usize,
    pub concurrency: usize,
}

impl Default for Classifier {
    fn default() -> Self {
        Classifier {
            enabled: false,
            endpoint: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_secs: 30,
            queue_size: 1024,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encryption {
    pub master_key: String,
}

fn default_max_connections() -> u32 {
    10
}
