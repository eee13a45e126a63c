//! Proxying relay: accept a client upload and forward it, unbuffered, to
//! the co-hosted streaming ingestion endpoint.
//!
//! The body is relayed through a bounded single-slot channel, which keeps
//! memory flat and lets the inner request apply natural backpressure on
//! the client connection.

use crate::api::{ApiError, AppState};
use crate::auth::{self, RequestIdentity};
use crate::pathguard::check_filename;
use crate::tenant;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use regex::Regex;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Deserialize)]
pub struct ProxyParams {
    pub group: Option<String>,
    pub chunk: Option<String>,
    pub id: Option<String>,
}

pub async fn proxy_stream(
    State(state): State<AppState>,
    Path((tenant, backend)): Path<(String, String)>,
    Query(params): Query<ProxyParams>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    handle_proxy(state, tenant, backend, None, params, method, headers, body).await
}

pub async fn proxy_stream_named(
    State(state): State<AppState>,
    Path((tenant, backend, filename)): Path<(String, String, String)>,
    Query(params): Query<ProxyParams>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    handle_proxy(
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

pub async fn proxy_head() -> StatusCode {
    StatusCode::CREATED
}

pub async fn proxy_head_named() -> StatusCode {
    StatusCode::CREATED
}

/// Group policy: the target group must be well-formed, belong to the URL
/// tenant, and appear in the caller's group memberships.
fn validate_group(
    group_name: &str,
    tenant: &str,
    identity: &RequestIdentity,
    group_re: &Regex,
) -> Result<(), ApiError> {
    if !group_re.is_match(group_name) {
        return Err(ApiError::InvalidToken(format!(
            "invalid group name: {}",
            group_name
        )));
    }
    if group_name.split('-').next() != Some(tenant) {
        return Err(ApiError::InvalidToken(
            "tenant and group name do not match".into(),
        ));
    }
    // tokens without a groups claim only grant the default member group
    let default_group = format!("{}-member-group", tenant);
    let member = if identity.groups.is_empty() {
        group_name == default_group
    } else {
        identity.groups.iter().any(|g| g == group_name)
    };
    if !member {
        return Err(ApiError::InvalidToken("user not member of group".into()));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_proxy(
    state: AppState,
    tenant: String,
    backend: String,
    filename: Option<String>,
    params: ProxyParams,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let config = &state.config;
    tenant::validate_tenant(&tenant, &state.tenant_re)?;
    let identity = auth::authorize(&headers, &tenant, config)?;
    if config.disk_backend(&backend).is_none() {
        return Err(ApiError::NotFound(format!("unknown backend: {}", backend)));
    }

    let filename = match filename {
        Some(name) => check_filename(&name, &config.disallowed_start_chars)?.to_string(),
        // nameless uploads land under a timestamp, matching older clients
        None => format!("{}.txt", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f")),
    };
    let group_name = params
        .group
        .clone()
        .unwrap_or_else(|| format!("{}-member-group", tenant));
    validate_group(&group_name, &tenant, &identity, &state.group_re)?;

    let mut internal_url = format!(
        "http://localhost:{}/v1/{}/{}/upload_stream/{}?group={}",
        config.port,
        tenant,
        backend,
        urlencoding::encode(&filename),
        urlencoding::encode(&group_name),
    );
    if let Some(chunk) = &params.chunk {
        internal_url.push_str(&format!("&chunk={}", urlencoding::encode(chunk)));
    }
    if let Some(id) = &params.id {
        internal_url.push_str(&format!("&id={}", urlencoding::encode(id)));
    }

    // single-slot relay: data_received -> queue -> internal request body
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(1);
    let mut stream = body.into_data_stream();
    tokio::spawn(async move {
        while let Some(chunk) = stream.next().await {
            let item = chunk.map_err(std::io::Error::other);
            if tx.send(item).await.is_err() {
                break;
            }
        }
        // dropping the sender terminates the inner request body
    });

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");
    let inner_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| ApiError::BadRequest("unsupported method".into()))?;
    let mut request = state
        .http
        .request(inner_method, &internal_url)
        .header("Authorization", format!("Bearer {}", identity.jwt))
        .header("Content-Type", content_type);
    for name in ["aes-key", "aes-iv", "pragma"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            request = request.header(name, value);
        }
    }

    tracing::info!(
        target: "api::proxy",
        method = %method,
        requestor = %identity.requestor,
        url = %internal_url,
        "Relaying upload to internal endpoint"
    );
    let response = request
        .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
        .send()
        .await
        .map_err(|e| ApiError::BackendUnavailable(format!("internal request failed: {}", e)))?;

    let mut status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::BackendUnavailable(format!("internal response failed: {}", e)))?;

    // clients of the relay get a real error status for order violations
    if method == Method::PATCH {
        if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&bytes) {
            if parsed.get("message").and_then(|m| m.as_str()) == Some("chunk_order_incorrect") {
                status = StatusCode::BAD_REQUEST;
            }
        }
    }

    Ok((
        status,
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn identity(groups: &[&str]) -> RequestIdentity {
        RequestIdentity {
            jwt: "jwt".to_string(),
            tenant: "p11".to_string(),
            requestor: "p11-anna".to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            claims: Value::Null,
        }
    }

    fn group_re() -> Regex {
        Regex::new("^[a-z0-9]+-[a-z0-9-]+-group$").unwrap()
    }

    #[test]
    fn test_group_must_be_well_formed() {
        let id = identity(&["p11-member-group"]);
        let err = validate_group("p11 member group", "p11", &id, &group_re());
        assert!(err.is_err());
    }

    #[test]
    fn test_group_prefix_must_match_tenant() {
        let id = identity(&["p12-member-group"]);
        let err = validate_group("p12-member-group", "p11", &id, &group_re());
        assert!(err.is_err());
    }

    #[test]
    fn test_caller_must_be_member() {
        let id = identity(&["p11-other-group"]);
        assert!(validate_group("p11-member-group", "p11", &id, &group_re()).is_err());
        assert!(validate_group("p11-other-group", "p11", &id, &group_re()).is_ok());
    }

    #[test]
    fn test_missing_groups_claim_grants_default_group_only() {
        let id = identity(&[]);
        assert!(validate_group("p11-member-group", "p11", &id, &group_re()).is_ok());
        assert!(validate_group("p11-special-group", "p11", &id, &group_re()).is_err());
    }
}
