pub mod middleware;

use axum::{
    middleware::{self as axum_middleware},
    routing::{get, patch, post},
    http::{HeaderValue, Method},
    extract::Request,
    response::IntoResponse,
    Json,
    Router,
    ServiceExt
};

use serde_json::json;

use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tower_http::normalize_path::NormalizePathLayer;
use tower::Layer;

use http::header::{AUTHORIZATION, CONTENT_TYPE};

use crate::config::Config;

use middleware::authenticate_user;

use crate::hook::resend_webhook;

use crate::handlers::accounts::{create_account, delete_account, list_accounts, update_account};
use crate::handlers::threads::{get_thread, list_threads};
use crate::handlers::emails::{classify_email, get_email, list_emails, send_email, update_email};

pub use crate::AppState;

pub struct Server {
    state: Arc<AppState>,
}

impl Server {

    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state
        }
    }

    pub async fn run(&self) -> Result<(), anyhow::Error> {

        let addr = self.state.config.http_addr();

        let app = NormalizePathLayer::trim_trailing_slash()
            .layer(router(self.state.clone()));

        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => anyhow::bail!("Failed to bind to address {}: {}", addr, e),
        };

        tracing::info!("Listening on {}", addr);
        axum::serve(listener, ServiceExt::<Request>::into_make_service(app)).await?;

        Ok(())
    }
}

pub fn setup_cors(config: &Config) -> CorsLayer {

    let mut layer = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(vec![CONTENT_TYPE, AUTHORIZATION]);

    layer = match &config.server.http.allow_origin {
        Some(origins) if !origins.is_empty() &&
        !origins.contains(&"".to_string()) &&
        !origins.contains(&"*".to_string()) => {
            let origins = origins.iter().filter_map(|s| s.parse::<HeaderValue>().ok()).collect::<Vec<_>>();
            layer.allow_origin(origins)
        },
        _ => layer,
    };

    layer
}

/// The full application router. Trailing-slash normalization is applied
/// outside it by [`Server::run`].
pub fn router(state: Arc<AppState>) -> Router {

    let api_routes = Router::new()
        .route("/api/accounts", get(list_accounts).post(create_account))
        .route("/api/accounts/{id}", patch(update_account).delete(delete_account))
        .route("/api/threads", get(list_threads))
        .route("/api/threads/{id}", get(get_thread))
        .route("/api/emails", get(list_emails).post(send_email))
        .route("/api/emails/{id}", get(get_email).patch(update_email))
        .route("/api/emails/{id}/classify", post(classify_email))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), authenticate_user));

    let hook_routes = Router::new()
        .route("/webhooks/resend", post(resend_webhook));

    let base_routes = Router::new()
        .route("/health", get(health))
        .route("/version", get(version));

    Router::new()
        .merge(api_routes)
        .merge(hook_routes)
        .merge(base_routes)
        .layer(setup_cors(&state.config))
        .layer(TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                let path = request.uri().path().to_owned();
                let method = request.method().clone();
                tracing::info_span!("http-request", %path, %method)
            })
            .on_request(|_request: &hyper::Request<_>, _span: &tracing::Span| {
                tracing::event!(tracing::Level::INFO, "request received");
            })
            .on_response(|response: &hyper::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                let status = response.status().as_u16();
                tracing::event!(tracing::Level::INFO, status = status, latency = ?latency, "sent response");
            })
            .on_failure(|error, _latency, _span: &tracing::Span| {
                tracing::error!("request failed: {}", error);
            })
        )
        .with_state(state)
}

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "healthy": true,
    }))
}

pub async fn version() -> impl IntoResponse {

    let version = env!("CARGO_PKG_VERSION");
    let hash = env!("GIT_COMMIT_HASH");

    Json(json!({
        "version": version,
        "commit": hash,
    }))
}
