mod handlers;

use crate::auth::CredentialPool;
use crate::config::AppConfig;
use crate::registry::ModelRegistry;
use crate::telemetry::Telemetry;
use crate::upstream::{FeVersion, UpstreamClient};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Application state shared across handlers.
pub struct AppState {
    pub config: AppConfig,
    pub pool: Arc<CredentialPool>,
    pub registry: Arc<ModelRegistry>,
    pub fe_version: Arc<FeVersion>,
    pub upstream: Arc<UpstreamClient>,
    pub telemetry: Arc<Telemetry>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Arc<Self> {
        let fe_version = Arc::new(FeVersion::new());
        let upstream = Arc::new(UpstreamClient::new(
            config.upstream_base.clone(),
            fe_version.clone(),
        ));
        let pool = Arc::new(CredentialPool::new(
            config.token_file(),
            config.quarantine_file(),
        ));
        let registry = Arc::new(ModelRegistry::new(&config));
        Arc::new(Self {
            config,
            pool,
            registry,
            fe_version,
            upstream,
            telemetry: Arc::new(Telemetry::new()),
        })
    }
}

/// Client IP for access logs: first X-Forwarded-For hop, then X-Real-IP.
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !xri.is_empty() {
            return xri.to_string();
        }
    }
    "-".to_string()
}

async fn access_log_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let ip = client_ip(req.headers());
    let start = Instant::now();

    let response = next.run(req).await;

    info!(
        "{} {} {} {:?} [{}]",
        method,
        path,
        response.status().as_u16(),
        start.elapsed(),
        ip
    );
    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::handle_root))
        .route("/v1/models", get(handlers::handle_models))
        .route("/v1/chat/completions", post(handlers::handle_chat_completions))
        .layer(axum::middleware::from_fn(access_log_middleware))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the cancellation token fires.
pub async fn serve(state: Arc<AppState>, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("server listening on {}", addr);

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 5.6.7.8"));
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&headers), "1.2.3.4");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&headers), "9.9.9.9");
    }

    #[test]
    fn client_ip_defaults_to_dash() {
        assert_eq!(client_ip(&HeaderMap::new()), "-");
    }
}
