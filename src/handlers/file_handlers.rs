//! HTTP handlers for drop upload, download, probe and owner deletion.
//! Blob bodies are streamed in both directions; lifecycle decisions are
//! delegated to `ObjectStore`.

use crate::{
    errors::AppError,
    models::drop_record::DropRecord,
    services::object_store::{ObjectStore, StagedBlob, unix_now},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

const X_EXPIRES_AT: HeaderName = HeaderName::from_static("x-expires-at");
const X_BURN_AFTER_READ: HeaderName = HeaderName::from_static("x-burn-after-read");

/// Body returned by a successful upload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub id: String,
    pub delete_token: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub token: Option<String>,
}

#[derive(Default)]
struct UploadForm {
    file: Option<StagedBlob>,
    expires_in: Option<String>,
    burn_after_read: bool,
}

impl UploadForm {
    async fn discard(self, store: &ObjectStore) {
        if let Some(staged) = self.file {
            store.discard(staged).await;
        }
    }
}

/// `POST /api/file`: multipart fields `file`, `expiresIn`, `burnAfterRead`.
///
/// The file is staged while the form is read; nothing becomes visible
/// until every check has passed.
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut form = UploadForm::default();
    if let Err(err) = read_upload_form(&state, &mut multipart, &mut form).await {
        form.discard(&state.store).await;
        return Err(err);
    }

    let Some(staged) = form.file.take() else {
        return Err(AppError::bad_request(
            "missing_file",
            "file field is required",
        ));
    };

    let expires_in = form.expires_in.as_deref().unwrap_or_default();
    let expires_at = match state.admission.expires_at(expires_in, unix_now()) {
        Ok(expires_at) => expires_at,
        Err(err) => {
            state.store.discard(staged).await;
            return Err(err.into());
        }
    };

    let size = staged.size;
    let created = state
        .store
        .commit_upload(staged, expires_at, form.burn_after_read)
        .await?;

    tracing::info!(
        id = %created.id,
        size,
        expires_at = created.expires_at,
        burn_after_read = created.burn_after_read,
        "stored drop"
    );

    Ok(Json(UploadResponse {
        id: created.id,
        delete_token: created.delete_token,
    }))
}

async fn read_upload_form(
    state: &AppState,
    multipart: &mut Multipart,
    form: &mut UploadForm,
) -> Result<(), AppError> {
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") if form.file.is_none() => {
                let stream = field.map(|chunk| chunk.map_err(io::Error::other));
                let staged = state
                    .store
                    .stage_blob(stream, state.admission.max_file_size)
                    .await?;
                form.file = Some(staged);
            }
            Some("expiresIn") => form.expires_in = Some(field.text().await?),
            Some("burnAfterRead") => form.burn_after_read = field.text().await? == "true",
            // Unknown fields are skipped by the next `next_field` call.
            _ => {}
        }
    }
    Ok(())
}

/// `GET /api/file/{id}`: stream the ciphertext. Burn-after-read drops are
/// consumed by this call.
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = drop_id(&id).ok_or_else(AppError::not_found)?;
    let retrieved = state
        .store
        .consume_blob(&id)
        .await?
        .ok_or_else(AppError::not_found)?;

    if retrieved.record.burn_after_read {
        tracing::info!(id = %id, "serving burn-after-read drop");
    }

    let body = Body::from_stream(ReaderStream::new(retrieved.file));
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_drop_headers(response.headers_mut(), &retrieved.record, retrieved.len);
    Ok(response)
}

/// `HEAD /api/file/{id}`: same headers as GET, never consumes.
pub async fn head_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = drop_id(&id).ok_or_else(AppError::not_found)?;
    let (record, len) = state
        .store
        .peek_blob(&id)
        .await?
        .ok_or_else(AppError::not_found)?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_drop_headers(response.headers_mut(), &record, len);
    Ok(response)
}

/// `GET /delete/{id}?token=...`: owner deletion.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>, AppError> {
    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "missing_token",
            "Missing token",
        ));
    };

    let deleted = match drop_id(&id) {
        Some(id) => state.store.delete_with_token(&id, &token).await?,
        None => false,
    };
    if !deleted {
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            "Invalid token or file not found",
        ));
    }

    tracing::info!(id = %id, "drop deleted by owner");
    Ok(Json(json!({ "ok": true })))
}

/// Canonical form of a path id, or `None` when it cannot be one of ours.
fn drop_id(raw: &str) -> Option<String> {
    Uuid::parse_str(raw).ok().map(|id| id.to_string())
}

fn set_drop_headers(headers: &mut HeaderMap, record: &DropRecord, len: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(X_EXPIRES_AT, HeaderValue::from(record.expires_at));
    headers.insert(
        X_BURN_AFTER_READ,
        HeaderValue::from_static(if record.burn_after_read { "1" } else { "0" }),
    );
}
