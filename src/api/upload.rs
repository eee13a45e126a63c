//! Streaming ingestion: PUT/POST/PATCH request bodies written to disk as
//! they arrive.
//!
//! Each request runs in three phases: prepare (validation, staging
//! acquisition, pipeline spawn), body streaming (bytes forwarded to the
//! open file, the resumable engine, or the head of a transform pipeline),
//! and completion (children reaped, staged file promoted, resumable merged
//! or finalized, request hook fired). Failure in any phase destroys the
//! staged file so observers never see partial data under the visible path.

use crate::api::{ApiError, AppState};
use crate::auth::{self, RequestIdentity};
use crate::config::DiskBackend;
use crate::hooks::call_request_hook;
use crate::pathguard::check_filename;
use crate::pipeline::{ContentFlow, PipelineSpec, TransformPipeline, unwrap_aes_key};
use crate::resumables::ResumableStore;
use crate::staging::{StagedFile, StagingError};
use crate::tenant;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Deserialize)]
pub struct IngestParams {
    pub group: Option<String>,
    pub chunk: Option<String>,
    pub id: Option<String>,
}

pub async fn upload_stream(
    State(state): State<AppState>,
    Path((tenant, backend)): Path<(String, String)>,
    Query(params): Query<IngestParams>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    handle_upload(state, tenant, backend, None, params, method, headers, body).await
}

pub async fn upload_stream_named(
    State(state): State<AppState>,
    Path((tenant, backend, filename)): Path<(String, String, String)>,
    Query(params): Query<IngestParams>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    handle_upload(
        state,
        tenant,
        backend,
        Some(filename),
        params,
        method,
        headers,
        body,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn handle_upload(
    state: AppState,
    tenant: String,
    backend: String,
    filename: Option<String>,
    params: IngestParams,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let config = state.config.clone();
    tenant::validate_tenant(&tenant, &state.tenant_re)?;
    let identity = auth::authorize(&headers, &tenant, &config)?;
    let backend_cfg = config
        .disk_backend(&backend)
        .ok_or_else(|| ApiError::NotFound(format!("unknown backend: {}", backend)))?;
    let group_name = params
        .group
        .clone()
        .unwrap_or_else(|| format!("{}-member-group", tenant));
    let tenant_dir = tenant::import_dir(backend_cfg, &tenant, &config)?;

    let filename = match &filename {
        Some(name) => Some(check_filename(name, &config.disallowed_start_chars)?.to_string()),
        None => None,
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::BadRequest("no content-type: do not know what to do with the data".into())
        })?;
    let flow = ContentFlow::from_content_type(content_type);

    tracing::info!(
        target: "api::upload",
        method = %method,
        tenant = %tenant,
        backend = %backend,
        requestor = %identity.requestor,
        filename = filename.as_deref().unwrap_or("-"),
        content_type,
        "Ingestion request"
    );

    if method == Method::PATCH {
        handle_resumable_chunk(
            &state, backend_cfg, &tenant, tenant_dir, &identity, filename, &params, &group_name,
            flow, body,
        )
        .await
    } else {
        handle_whole_body(
            &state,
            backend_cfg,
            &tenant,
            tenant_dir,
            &identity,
            filename,
            &group_name,
            flow,
            method == Method::PUT,
            &headers,
            body,
        )
        .await
    }
}

/// PATCH: one numbered chunk of a resumable upload, or its finalization.
#[allow(clippy::too_many_arguments)]
async fn handle_resumable_chunk(
    state: &AppState,
    backend_cfg: &DiskBackend,
    tenant: &str,
    tenant_dir: PathBuf,
    identity: &RequestIdentity,
    filename: Option<String>,
    params: &IngestParams,
    group_name: &str,
    flow: ContentFlow,
    body: Body,
) -> Result<Response, ApiError> {
    // chunks are raw bytes: decoding AES/tar/gzip per chunk across
    // independent requests cannot compose into one coherent output
    if flow != ContentFlow::Direct {
        return Err(ApiError::BadRequest(
            "resumable chunks cannot use transform content types".into(),
        ));
    }
    let filename =
        filename.ok_or_else(|| ApiError::BadRequest("filename required for resumables".into()))?;
    let chunk_param = params
        .chunk
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("chunk parameter required".into()))?;

    let store = ResumableStore::new(tenant_dir, identity.requestor.clone());
    let prep = store
        .prepare(&filename, chunk_param, params.id.as_deref(), group_name)
        .await?;
    if !prep.order_ok {
        return Err(ApiError::ChunkOrderIncorrect);
    }

    if prep.is_final {
        drain(body).await;
        let settled = store.finalize(&filename, &prep.upload_id).await?;
        call_request_hook(
            &backend_cfg.request_hook,
            tenant,
            &settled,
            &identity.requestor,
            &state.config.api_user,
            group_name,
        )
        .await;
        let name = settled
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&filename)
            .to_string();
        return Ok((
            StatusCode::CREATED,
            Json(json!({
                "filename": name,
                "id": prep.upload_id,
                "max_chunk": prep.chunk.to_string(),
            })),
        )
            .into_response());
    }

    let chunk_path = prep.chunk_path.clone().expect("ordered chunk has a path");
    // a concurrent writer on the same chunk loses here, not later
    let staged = match StagedFile::begin(chunk_path).await {
        Ok(staged) => staged,
        Err(StagingError::ActiveWriter) => return Err(ApiError::ChunkOrderIncorrect),
        Err(e) => return Err(e.into()),
    };
    let mut file = match staged.open(true).await {
        Ok(file) => file,
        Err(e) => {
            staged.destroy().await;
            return Err(e.into());
        }
    };

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let result = match chunk {
            Ok(bytes) => file
                .write_all(&bytes)
                .await
                .map_err(|e| ApiError::from(StagingError::from(e))),
            Err(e) => Err(ApiError::BadRequest(format!("body stream interrupted: {}", e))),
        };
        if let Err(e) = result {
            drop(file);
            staged.destroy().await;
            return Err(e);
        }
    }
    if let Err(e) = file.flush().await {
        drop(file);
        staged.destroy().await;
        return Err(ApiError::from(StagingError::from(e)));
    }
    drop(file);

    // the rename is the serialization point for duplicate chunks
    let settled_chunk = staged.promote_new().await?;
    let merged = store.merge_chunk(&settled_chunk, &prep.upload_id).await?;
    let chunk_name = settled_chunk
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&filename)
        .to_string();
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "filename": chunk_name,
            "id": prep.upload_id,
            "max_chunk": merged.to_string(),
        })),
    )
        .into_response())
}

/// PUT/POST: the whole body lands in one file, optionally through a
/// transform pipeline.
#[allow(clippy::too_many_arguments)]
async fn handle_whole_body(
    state: &AppState,
    backend_cfg: &DiskBackend,
    tenant: &str,
    tenant_dir: PathBuf,
    identity: &RequestIdentity,
    filename: Option<String>,
    group_name: &str,
    flow: ContentFlow,
    truncate: bool,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let config = &state.config;

    match flow {
        ContentFlow::Direct => {
            let filename =
                filename.ok_or_else(|| ApiError::BadRequest("filename required".into()))?;
            let staged = StagedFile::begin(tenant_dir.join(&filename)).await?;
            let mut file = match staged.open(truncate).await {
                Ok(file) => file,
                Err(e) => {
                    staged.destroy().await;
                    return Err(e.into());
                }
            };

            let mut stream = body.into_data_stream();
            while let Some(chunk) = stream.next().await {
                let result = match chunk {
                    Ok(bytes) => file
                        .write_all(&bytes)
                        .await
                        .map_err(|e| ApiError::from(StagingError::from(e))),
                    Err(e) => {
                        Err(ApiError::BadRequest(format!("body stream interrupted: {}", e)))
                    }
                };
                if let Err(e) = result {
                    drop(file);
                    staged.destroy().await;
                    return Err(e);
                }
            }
            if let Err(e) = file.flush().await {
                drop(file);
                staged.destroy().await;
                return Err(ApiError::Internal(e.into()));
            }
            drop(file);
            let settled = staged.promote().await?;
            call_request_hook(
                &backend_cfg.request_hook,
                tenant,
                &settled,
                &identity.requestor,
                &config.api_user,
                group_name,
            )
            .await;
            tracing::info!(
                target: "api::upload",
                path = %settled.display(),
                requestor = %identity.requestor,
                "Data streamed to file"
            );
            Ok(streamed_response())
        }
        _ => {
            let aes = if flow.needs_aes() {
                let wrapped = headers
                    .get("aes-key")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| ApiError::BadRequest("Aes-Key header required".into()))?;
                let mut aes = unwrap_aes_key(&config.pgp, wrapped).await?;
                aes.iv = headers
                    .get("aes-iv")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Some(aes)
            } else {
                None
            };

            let staged = if flow.writes_target() {
                let filename = filename
                    .clone()
                    .ok_or_else(|| ApiError::BadRequest("filename required".into()))?;
                Some(StagedFile::begin(tenant_dir.join(filename)).await?)
            } else {
                None
            };
            let output_file = if matches!(flow, ContentFlow::Gz | ContentFlow::GzAes) {
                let target = staged.as_ref().expect("gz flows write a target file");
                match target.open(truncate).await {
                    Ok(file) => Some(file.into_std().await),
                    Err(e) => {
                        if let Some(staged) = staged {
                            staged.destroy().await;
                        }
                        return Err(e.into());
                    }
                }
            } else {
                None
            };

            let spec = PipelineSpec {
                aes,
                staged_path: staged.as_ref().map(|s| s.staged_path()),
                tenant_dir: &tenant_dir,
                output_file,
            };
            let mut pipeline = match TransformPipeline::spawn(flow, spec) {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    if let Some(staged) = staged {
                        staged.destroy().await;
                    }
                    return Err(e.into());
                }
            };

            let mut stream = body.into_data_stream();
            while let Some(chunk) = stream.next().await {
                let result = match chunk {
                    Ok(bytes) => pipeline.write(&bytes).await.map_err(ApiError::from),
                    Err(e) => {
                        Err(ApiError::BadRequest(format!("body stream interrupted: {}", e)))
                    }
                };
                if let Err(e) = result {
                    pipeline.abort().await;
                    if let Some(staged) = staged {
                        staged.destroy().await;
                    }
                    return Err(e);
                }
            }

            if let Err(e) = pipeline.finish().await {
                if let Some(staged) = staged {
                    staged.destroy().await;
                }
                return Err(e.into());
            }
            let settled = match staged {
                Some(staged) => staged.promote().await?,
                // tar extracted into the tenant directory itself
                None => tenant_dir.clone(),
            };
            call_request_hook(
                &backend_cfg.request_hook,
                tenant,
                &settled,
                &identity.requestor,
                &config.api_user,
                group_name,
            )
            .await;
            tracing::info!(
                target: "api::upload",
                path = %settled.display(),
                requestor = %identity.requestor,
                "Transformed data streamed"
            );
            Ok(streamed_response())
        }
    }
}

fn streamed_response() -> Response {
    (StatusCode::CREATED, Json(json!({"message": "data streamed"}))).into_response()
}

async fn drain(body: Body) {
    let mut stream = body.into_data_stream();
    while let Some(_chunk) = stream.next().await {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backends, DiskBackend, RequestHookConfig, ServerConfig};
    use bytes::Bytes;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    const SECRET: &str = "upload-test-secret";

    struct TestEnv {
        _root: TempDir,
        state: AppState,
        tenant_dir: std::path::PathBuf,
        /// Written by the hook script; absent means the hook never ran.
        marker: std::path::PathBuf,
    }

    fn test_env() -> TestEnv {
        let root = tempfile::tempdir().unwrap();
        let tenant_dir = root.path().join("p11");
        std::fs::create_dir(&tenant_dir).unwrap();

        let marker = root.path().join("hook-marker");
        let script = root.path().join("hook.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$1\" >> {}\n", marker.display()),
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = DiskBackend {
            import_path: format!("{}/pXX", root.path().display()),
            request_hook: RequestHookConfig {
                enabled: true,
                path: Some(script.display().to_string()),
                sudo: false,
                skip_tenants: vec![],
            },
            ..DiskBackend::default()
        };
        let config = ServerConfig {
            jwt_secret: SECRET.to_string(),
            valid_tenant_regex: "^p[0-9]+$".to_string(),
            backends: Backends {
                disk: HashMap::from([("files".to_string(), backend)]),
            },
            ..ServerConfig::default()
        };
        let state = AppState::new(Arc::new(config)).unwrap();
        TestEnv {
            _root: root,
            state,
            tenant_dir,
            marker,
        }
    }

    fn auth_headers() -> HeaderMap {
        let claims = serde_json::json!({
            "user": "p11-anna",
            "proj": "p11",
            "groups": ["p11-member-group"],
            "exp": chrono::Utc::now().timestamp() + 3600,
        });
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {}", token).parse().unwrap(),
        );
        headers.insert("content-type", "application/octet-stream".parse().unwrap());
        headers
    }

    fn no_params() -> IngestParams {
        IngestParams {
            group: None,
            chunk: None,
            id: None,
        }
    }

    /// A body whose stream fails partway, like a client disconnecting.
    fn interrupted_body() -> Body {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("client went away")),
        ];
        Body::from_stream(futures::stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_successful_upload_fires_hook() {
        let env = test_env();
        let response = handle_upload(
            env.state.clone(),
            "p11".to_string(),
            "files".to_string(),
            Some("data.bin".to_string()),
            no_params(),
            Method::PUT,
            auth_headers(),
            Body::from("payload"),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let settled = env.tenant_dir.join("data.bin");
        assert_eq!(std::fs::read(&settled).unwrap(), b"payload");
        let recorded = std::fs::read_to_string(&env.marker).unwrap();
        assert_eq!(recorded.trim(), settled.display().to_string());
    }

    #[tokio::test]
    async fn test_aborted_upload_leaves_nothing_and_fires_no_hook() {
        let env = test_env();
        let result = handle_upload(
            env.state.clone(),
            "p11".to_string(),
            "files".to_string(),
            Some("data.bin".to_string()),
            no_params(),
            Method::PUT,
            auth_headers(),
            interrupted_body(),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        // no settled file, no staged leftovers, and the hook never ran
        assert_eq!(std::fs::read_dir(&env.tenant_dir).unwrap().count(), 0);
        assert!(!env.marker.exists());
    }

    #[tokio::test]
    async fn test_aborted_transform_upload_fires_no_hook() {
        let env = test_env();
        let mut headers = auth_headers();
        headers.insert("content-type", "application/gz".parse().unwrap());
        let result = handle_upload(
            env.state.clone(),
            "p11".to_string(),
            "files".to_string(),
            Some("data.bin".to_string()),
            no_params(),
            Method::PUT,
            headers,
            interrupted_body(),
        )
        .await;
        assert!(result.is_err());
        assert!(!env.tenant_dir.join("data.bin").exists());
        assert!(!env.marker.exists());
    }

    #[tokio::test]
    async fn test_resumable_chunk_rejects_transform_content_types() {
        let env = test_env();
        let mut headers = auth_headers();
        headers.insert("content-type", "application/gz".parse().unwrap());
        let result = handle_upload(
            env.state.clone(),
            "p11".to_string(),
            "files".to_string(),
            Some("big.bin".to_string()),
            IngestParams {
                group: None,
                chunk: Some("1".to_string()),
                id: None,
            },
            Method::PATCH,
            headers,
            Body::from("AAAA"),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        // no resumable state was created
        assert_eq!(std::fs::read_dir(&env.tenant_dir).unwrap().count(), 0);
    }
}
