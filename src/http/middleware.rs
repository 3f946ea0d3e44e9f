//! Request middleware: admission control and request IDs.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::net::SocketAddr;
use tracing::{debug, warn};

use super::client_ip;
use super::server::AppState;
use crate::ratelimit::{Decision, Outcome};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// JSON body of a rejected request.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Gate every request through the rate limiter.
///
/// Admitted requests continue down the stack and get rate limit headers on
/// the way out; denied ones are answered here with 429.
pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let Some(ip) = client_ip::resolve(req.headers(), peer, state.trust_proxy_headers) else {
        warn!(path = %req.uri().path(), "Unable to determine client address");
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "Bad request",
                message: "Unable to determine client address.",
                retry_after: None,
            }),
        )
            .into_response();
    };

    let identity = ip.to_string();
    let decision = state.limiter.check(&identity);

    if decision.allowed() {
        let mut response = next.run(req).await;
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    debug!(
        identity = %identity,
        path = %req.uri().path(),
        retry_after = decision.retry_after,
        "Request rate limited"
    );

    too_many_requests(&decision)
}

/// Render a denial as a 429 response.
pub fn too_many_requests(decision: &Decision) -> Response {
    let message = match decision.outcome {
        Outcome::Blocked => "Too many requests. You have been temporarily blocked.",
        _ => "Too many requests. Please try again later.",
    };

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorBody {
            error: "Rate limit exceeded",
            message,
            retry_after: Some(decision.retry_after),
        }),
    )
        .into_response();

    let headers = response.headers_mut();
    apply_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after));
    response
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    let reset_at = chrono::Utc::now().timestamp() + decision.reset_after as i64;

    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at));
}

/// Propagate the caller's `X-Request-ID`, or assign a fresh one, on both the
/// request and the response.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(&X_REQUEST_ID)
        .filter(|value| !value.is_empty())
        .cloned()
        .or_else(|| HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok());

    let Some(id) = id else {
        return next.run(req).await;
    };

    req.headers_mut().insert(X_REQUEST_ID, id.clone());
    let mut response = next.run(req).await;
    response.headers_mut().insert(X_REQUEST_ID, id);
    response
}
