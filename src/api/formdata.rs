//! Form-encoded uploads: small files posted as `multipart/form-data`.
//!
//! A thin wrapper over the same staged-write layout the streaming path
//! uses; bodies are buffered per field, which is acceptable for the form
//! use case.

use crate::api::{ApiError, AppState};
use crate::auth;
use crate::pathguard::check_filename;
use crate::staging::StagedFile;
use crate::tenant;
use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio::io::AsyncWriteExt;

pub async fn form_upload_head() -> StatusCode {
    StatusCode::CREATED
}

pub async fn form_upload(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    method: Method,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let config = &state.config;
    tenant::validate_tenant(&tenant, &state.tenant_re)?;
    let identity = auth::authorize(&headers, &tenant, config)?;
    let backend_cfg = config
        .disk_backend("form_data")
        .or_else(|| config.disk_backend("files"))
        .ok_or_else(|| ApiError::NotFound("no form upload backend configured".into()))?;
    let tenant_dir = tenant::import_dir(backend_cfg, &tenant, config)?;
    let truncate = method == Method::PUT;

    let mut written = 0usize;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed form data: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .ok_or_else(|| ApiError::BadRequest("file field has no filename".into()))?
            .to_string();
        let filename = check_filename(&filename, &config.disallowed_start_chars)?.to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("could not read form field: {}", e)))?;
        if bytes.is_empty() {
            return Err(ApiError::BadRequest(
                "empty file bodies are not accepted".into(),
            ));
        }

        let staged = StagedFile::begin(tenant_dir.join(&filename)).await?;
        let mut file = staged.open(truncate).await.map_err(ApiError::from)?;
        if let Err(e) = file.write_all(&bytes).await {
            drop(file);
            staged.destroy().await;
            return Err(ApiError::Internal(e.into()));
        }
        if let Err(e) = file.flush().await {
            drop(file);
            staged.destroy().await;
            return Err(ApiError::Internal(e.into()));
        }
        drop(file);
        let settled = staged.promote().await?;
        tracing::info!(
            target: "api::formdata",
            path = %settled.display(),
            requestor = %identity.requestor,
            size = bytes.len(),
            "Form upload written"
        );
        written += 1;
    }

    if written == 0 {
        return Err(ApiError::BadRequest("no file supplied with upload".into()));
    }
    Ok((StatusCode::CREATED, Json(json!({"message": "data uploaded"}))).into_response())
}
