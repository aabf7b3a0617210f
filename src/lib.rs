pub mod config;
pub mod cache;
pub mod crypto;
pub mod db;
pub mod email;
pub mod error;
pub mod handlers;
pub mod hook;
pub mod server;

use std::sync::Arc;

use config::Config;
use crypto::{CredentialCipher, SignatureVerifier};
use db::Store;
use email::classify::ClassificationDispatcher;
use email::send::{MailSender, Outbox, ResendSender};
use email::thread::ThreadResolver;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub verifier: SignatureVerifier,
    pub resolver: ThreadResolver,
    pub classifier: Option<ClassificationDispatcher>,
    pub cipher: CredentialCipher,
    pub outbox: Outbox,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Arc<Self>, anyhow::Error> {

        let store = db::connect(&config).await?;

        let sender = Arc::new(ResendSender::new(&config));

        let classifier = ClassificationDispatcher::from_config(&config, store.clone())?;

        Self::with_parts(config, store, sender, classifier)
    }

    /// Assembles state around an existing store, sender and classifier.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn Store>,
        sender: Arc<dyn MailSender>,
        classifier: Option<ClassificationDispatcher>,
    ) -> Result<Arc<Self>, anyhow::Error> {

        let cipher = CredentialCipher::new(&config)?;

        if config.development_mode() {
            tracing::info!("Running in development mode");
        } else {
            tracing::info!("Running in production mode");
        }

        Ok(Arc::new(Self {
            verifier: SignatureVerifier::new(&config),
            resolver: ThreadResolver::new(store.clone()),
            outbox: Outbox::new(store.clone(), sender, cipher.clone()),
            classifier,
            cipher,
            store,
            config,
        }))
    }
}


use clap::{Parser, Subcommand};

#[derive(Parser)]
pub struct Args {
    #[arg(short, long, default_value = "config.toml")]
    pub config: std::path::PathBuf,
    #[arg(short, long)]
    pub port: Option<u16>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply the database schema
    Migrate,
}

impl Args {
    pub fn build() -> Self {
        Args::parse()
    }
}
