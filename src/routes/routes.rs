//! Defines routes for the ephemeral drop API.
//!
//! ## Structure
//! - **Drop endpoints**
//!   - `POST /api/file`        -> upload ciphertext (rate limited)
//!   - `GET  /api/file/{id}`   -> download; consumes burn-after-read drops
//!   - `HEAD /api/file/{id}`   -> metadata probe, never consumes
//!   - `GET  /delete/{id}`     -> owner deletion with `?token=`
//!
//! - **Health endpoints**
//!   - `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        file_handlers::{delete_file, download_file, head_file, upload_file},
        health_handlers::{healthz, readyz},
    },
    middleware::rate_limit::rate_limit,
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

/// Room for multipart boundaries and the small text fields on top of the
/// file itself. The exact file ceiling is enforced while streaming.
pub const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the application router with its shared state attached.
pub fn routes(state: AppState) -> Router {
    let body_limit = usize::try_from(state.admission.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    let upload = post(upload_file)
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // drop endpoints
        .route("/api/file", upload)
        .route("/api/file/{id}", get(download_file).head(head_file))
        .route("/delete/{id}", get(delete_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
