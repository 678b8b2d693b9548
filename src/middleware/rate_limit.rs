//! Per-client admission throttle for routes that create drops.

use crate::{errors::AppError, services::rate_limiter::UNKNOWN_CLIENT, state::AppState};
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Resolve the client identity from proxy headers.
///
/// Uses the first `X-Forwarded-For` entry, then `X-Real-IP`. Requests with
/// neither share the `unknown` bucket.
pub fn client_identity(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let identity = client_identity(request.headers());
    if !state.limiter.check(&identity) {
        tracing::debug!(client = %identity, "rate limit exceeded");
        return AppError::rate_limited().into_response();
    }
    next.run(request).await
}
