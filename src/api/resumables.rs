//! Resumable management endpoints: report resume information, delete
//! abandoned uploads.
//!
//! Clients that know their upload id ask for it directly; clients that only
//! remember the target filename get every matching candidate they own and
//! are expected to resume the most complete one and delete the rest.

use crate::api::{ApiError, AppState};
use crate::auth;
use crate::pathguard::check_filename;
use crate::resumables::ResumableStore;
use crate::tenant;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct ResumableParams {
    pub id: Option<String>,
}

fn store_for(
    state: &AppState,
    tenant: &str,
    backend: &str,
    headers: &HeaderMap,
) -> Result<(ResumableStore, String), ApiError> {
    let config = &state.config;
    tenant::validate_tenant(tenant, &state.tenant_re)?;
    let identity = auth::authorize(headers, tenant, config)?;
    let backend_cfg = config
        .disk_backend(backend)
        .ok_or_else(|| ApiError::NotFound(format!("unknown backend: {}", backend)))?;
    let tenant_dir = tenant::import_dir(backend_cfg, tenant, config)?;
    Ok((
        ResumableStore::new(tenant_dir, identity.requestor.clone()),
        identity.requestor,
    ))
}

/// GET without a filename: every resumable owned by the requestor.
pub async fn list_resumables(
    State(state): State<AppState>,
    Path((tenant, backend)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (store, requestor) = store_for(&state, &tenant, &backend, &headers)?;
    let resumables = store.list_matching(None).await?;
    tracing::debug!(
        target: "api::resumables",
        requestor = %requestor,
        count = resumables.len(),
        "Listed resumables"
    );
    Ok(Json(json!({ "resumables": resumables })))
}

/// GET with a filename: resume information, either for a known upload id
/// or for every candidate matching the filename.
pub async fn resumable_info(
    State(state): State<AppState>,
    Path((tenant, backend, filename)): Path<(String, String, String)>,
    Query(params): Query<ResumableParams>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (store, _requestor) = store_for(&state, &tenant, &backend, &headers)?;
    let filename = check_filename(&filename, &state.config.disallowed_start_chars)?;
    match params.id.as_deref() {
        Some(upload_id) => {
            let info = store.info(filename, upload_id).await?;
            Ok(Json(serde_json::to_value(info).map_err(anyhow::Error::from)?))
        }
        None => {
            let candidates = store.list_matching(Some(filename)).await?;
            Ok(Json(json!({ "resumables": candidates })))
        }
    }
}

/// DELETE: drop one resumable and all its on-disk state.
pub async fn delete_resumable(
    State(state): State<AppState>,
    Path((tenant, backend, filename)): Path<(String, String, String)>,
    Query(params): Query<ResumableParams>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (store, requestor) = store_for(&state, &tenant, &backend, &headers)?;
    let filename = check_filename(&filename, &state.config.disallowed_start_chars)?;
    let upload_id = params
        .id
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("upload id required to delete resumable".into()))?;
    store.delete(filename, upload_id).await?;
    tracing::info!(
        target: "api::resumables",
        requestor = %requestor,
        upload_id,
        filename,
        "Deleted resumable"
    );
    Ok(Json(json!({ "message": "resumable deleted" })))
}
