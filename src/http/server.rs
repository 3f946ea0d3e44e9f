//! HTTP server implementation.

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::middleware::{rate_limit, request_id, ErrorBody};
use crate::config::ServerConfig;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::RateLimiter;

/// State shared by the handlers and middleware.
#[derive(Debug, Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    version: &'static str,
    checks: BTreeMap<&'static str, String>,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    name: &'static str,
    version: &'static str,
}

/// HTTP front for the admission gate.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    pub fn new(config: &ServerConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr: config.http_addr,
            state: AppState {
                limiter,
                trust_proxy_headers: config.trust_proxy_headers,
            },
        }
    }

    /// Wrap `api` in the rate limiter.
    ///
    /// `/health` and `/version` are mounted outside the rate limit layer so
    /// probes are never throttled. Unmatched paths answer with a JSON 404,
    /// still rate limited.
    pub fn router(&self, api: Router) -> Router {
        let gated = api
            .fallback(not_found)
            .layer(middleware::from_fn_with_state(self.state.clone(), rate_limit));

        Router::new()
            .route("/health", get(health))
            .route("/version", get(version))
            .with_state(self.state.clone())
            .merge(gated)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(middleware::from_fn(request_id)),
            )
    }

    /// Serve `api` until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, api: Router, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router(api);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GatekeeperError::Io(e)
            })
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut checks = BTreeMap::new();
    checks.insert("rate_limiter", "healthy".to_string());
    checks.insert("tracked_visitors", state.limiter.visitor_count().to_string());

    Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
        checks,
    })
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "Not found",
            message: "The requested resource does not exist.",
            retry_after: None,
        }),
    )
}
