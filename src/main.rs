use threadmail::*;
use config::ConfigBuilder;
use db::Database;
use server::Server;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing_appender::non_blocking::WorkerGuard;


#[tokio::main]
async fn main() {

    let _logging_guard = setup_tracing();

    let args = Args::build();

    let mut builder = match ConfigBuilder::from_file(&args.config) {
        Ok(builder) => builder,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(port) = args.port {
        builder = builder.with_port(port);
    }

    let config = match builder.build() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error building configuration: {}", e);
            std::process::exit(1);
        }
    };

    match args.command {
        Some(Command::Migrate) => {
            info!("Applying database schema...");

            let result = match Database::new(&config).await {
                Ok(db) => db.migrate().await,
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                eprintln!("Migration failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            let state = AppState::new(config)
                .await
                .unwrap_or_else(|e| {
                    eprintln!("Failed to initialize state: {:#}", e);
                    std::process::exit(1);
                });

            info!("Starting threadmail server...");

            Server::new(state)
            .run()
            .await
            .unwrap_or_else(|e| {
                eprintln!("Server error: {}", e);
                std::process::exit(1);
            });
        }
    }
}

pub fn setup_tracing() -> WorkerGuard {
    let env_filter = if cfg!(debug_assertions) {
        "debug,hyper=off,hyper_util=off,tower_http=off,reqwest=off,html2text=off"
    } else {
        "info"
    };

    let file_appender = tracing_appender::rolling::daily("./logs", "threadmail.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer().pretty();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!("Tracing initialized with file logging");

    guard
}
