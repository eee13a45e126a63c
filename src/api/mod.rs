mod error;
mod export;
mod formdata;
mod proxy;
mod resumables;
mod upload;

pub use error::ApiError;

use crate::config::ServerConfig;
use axum::{
    Router,
    http::StatusCode,
    routing::{get, head},
};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across handlers. The configuration is
/// immutable for the process lifetime; all mutable state lives on disk.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub tenant_re: Arc<Regex>,
    pub group_re: Arc<Regex>,
    /// Client for the proxy handlers' internal re-dispatch.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Arc<ServerConfig>) -> anyhow::Result<Self> {
        let tenant_re = Arc::new(config.tenant_regex());
        let group_re = Arc::new(config.group_regex());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.proxy_timeout_seconds))
            .build()?;
        Ok(Self {
            config,
            tenant_re,
            group_re,
            http,
        })
    }
}

/// Liveness probe.
async fn health_check() -> StatusCode {
    tracing::trace!(target: "api::health", "Health check");
    StatusCode::OK
}

/// Create the API router.
///
/// The backend segment (`files`, `cluster`, `store`, ...) is matched
/// dynamically and validated against the configured disk backends by each
/// handler.
pub fn create_router(state: AppState) -> Router {
    tracing::debug!(target: "api", "Creating API router");

    let ingest = axum::routing::put(upload::upload_stream)
        .post(upload::upload_stream)
        .patch(upload::upload_stream);
    let ingest_named = axum::routing::put(upload::upload_stream_named)
        .post(upload::upload_stream_named)
        .patch(upload::upload_stream_named);
    let relay = axum::routing::put(proxy::proxy_stream)
        .post(proxy::proxy_stream)
        .patch(proxy::proxy_stream)
        .head(proxy::proxy_head);
    let relay_named = axum::routing::put(proxy::proxy_stream_named)
        .post(proxy::proxy_stream_named)
        .patch(proxy::proxy_stream_named)
        .head(proxy::proxy_head_named);
    let form_upload = axum::routing::post(formdata::form_upload)
        .put(formdata::form_upload)
        .patch(formdata::form_upload)
        .head(formdata::form_upload_head);

    Router::new()
        // liveness
        .route("/v1/:tenant/files/health", head(health_check))
        // streaming ingestion
        .route("/v1/:tenant/:backend/upload_stream", ingest)
        .route("/v1/:tenant/:backend/upload_stream/:filename", ingest_named)
        // proxying relays (two URL spellings, one handler)
        .route("/v1/:tenant/:backend/stream", relay.clone())
        .route("/v1/:tenant/:backend/stream/:filename", relay_named.clone())
        .route("/v1/:tenant/:backend/import", relay)
        .route("/v1/:tenant/:backend/import/:filename", relay_named)
        // resumable management
        .route("/v1/:tenant/:backend/resumables", get(resumables::list_resumables))
        .route(
            "/v1/:tenant/:backend/resumables/:filename",
            get(resumables::resumable_info).delete(resumables::delete_resumable),
        )
        // export
        .route("/v1/:tenant/:backend/export", get(export::export_list))
        .route(
            "/v1/:tenant/:backend/export/:filename",
            get(export::export_file).head(export::export_head),
        )
        // form-encoded upload
        .route("/v1/:tenant/files/upload", form_upload)
        .with_state(state)
}
