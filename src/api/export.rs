//! Export: directory listing with per-entry policy evaluation, and
//! byte-range downloads with `If-Range` revalidation.

use crate::api::{ApiError, AppState};
use crate::auth;
use crate::config::ExportRule;
use crate::pathguard::check_filename;
use crate::tenant;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use serde::Serialize;
use std::os::unix::fs::MetadataExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

#[derive(Debug, Serialize)]
struct ListedFile {
    filename: String,
    size: Option<u64>,
    modified_date: String,
    href: String,
    exportable: bool,
    reason: Option<String>,
    #[serde(rename = "mime-type")]
    mime_type: Option<String>,
    owner: String,
}

/// The Etag is the md5 of the file's mtime as a decimal string: cheap to
/// compute, and all a client needs to detect that a resource changed
/// between ranged requests. Proxies configured with response compression
/// may strip strong validators like this one.
fn compute_etag(meta: &std::fs::Metadata) -> String {
    format!("{:x}", md5::compute(meta.mtime().to_string().as_bytes()))
}

fn resolve_owner(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_else(|| uid.to_string())
}

/// Evaluate the export policy for one file. `Err` carries the reason the
/// file is not exportable.
fn evaluate_export_policy(
    rule: &ExportRule,
    filename: &str,
    size: u64,
    mime_type: &str,
    disallowed_start_chars: &str,
) -> Result<(), String> {
    if check_filename(filename, disallowed_start_chars).is_err() {
        return Err(format!("Illegal export filename: {}", filename));
    }
    if !rule.enabled {
        return Ok(());
    }
    let mime_ok = rule
        .allowed_mime_types
        .iter()
        .any(|allowed| allowed == "*" || allowed == mime_type);
    if !mime_ok {
        return Err(format!(
            "not allowed to export file with MIME type: {}",
            mime_type
        ));
    }
    if let Some(max_size) = rule.max_size {
        if size > max_size {
            return Err("File size exceeds maximum allowed for export".to_string());
        }
    }
    Ok(())
}

/// Parse a single `bytes=<start>-<end?>` range against the file size.
/// Clients use 0-based inclusive indices.
fn parse_range(range: &str, size: u64) -> Result<(u64, u64), ApiError> {
    let spec = range
        .strip_prefix("bytes=")
        .ok_or_else(|| ApiError::BadRequest("malformed Range header".into()))?;
    if spec.contains(',') {
        return Err(ApiError::RangeMultipart);
    }
    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| ApiError::BadRequest("malformed Range header".into()))?;
    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest("malformed Range header".into()))?;
    let end: u64 = match end.trim() {
        "" => size.saturating_sub(1),
        explicit => explicit
            .parse()
            .map_err(|_| ApiError::BadRequest("malformed Range header".into()))?,
    };
    if end > size {
        return Err(ApiError::RangeUnsatisfiable(
            "Range request exceeds byte range of resource".into(),
        ));
    }
    if start > end {
        return Err(ApiError::RangeUnsatisfiable("empty byte range".into()));
    }
    Ok((start, end))
}

/// GET on the export directory: list entries with policy verdicts.
pub async fn export_list(
    State(state): State<AppState>,
    Path((tenant, backend)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = &state.config;
    tenant::validate_tenant(&tenant, &state.tenant_re)?;
    let identity = auth::authorize(&headers, &tenant, config)?;
    let backend_cfg = config
        .disk_backend(&backend)
        .ok_or_else(|| ApiError::NotFound(format!("unknown backend: {}", backend)))?;
    let export_dir = tenant::export_dir(backend_cfg, &tenant, config)?;
    let rule = backend_cfg.export_rule(&tenant);

    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(&export_dir)
        .await
        .map_err(|e| ApiError::BackendUnavailable(format!("cannot list export dir: {}", e)))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ApiError::BackendUnavailable(e.to_string()))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    if names.len() > config.export_max_num_list {
        return Err(ApiError::BadRequest(
            "too many files, create a zip archive".into(),
        ));
    }
    names.sort();

    let mut files = Vec::with_capacity(names.len());
    for name in names {
        let path = export_dir.join(&name);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ApiError::BackendUnavailable(e.to_string()))?;
        let modified: chrono::DateTime<chrono::Utc> = meta
            .modified()
            .map_err(|e| ApiError::BackendUnavailable(e.to_string()))?
            .into();
        let owner = resolve_owner(meta.uid());
        let href = format!(
            "/v1/{}/{}/export/{}",
            tenant,
            backend,
            urlencoding::encode(&name)
        );

        let (size, mime_type, verdict) = if meta.is_dir() {
            (
                None,
                None,
                Err("exporting from directories not supported".to_string()),
            )
        } else {
            let mime = mime_guess::from_path(&path)
                .first_or_octet_stream()
                .essence_str()
                .to_string();
            let verdict = evaluate_export_policy(
                &rule,
                &name,
                meta.len(),
                &mime,
                &config.disallowed_start_chars,
            );
            (Some(meta.len()), Some(mime), verdict)
        };
        files.push(ListedFile {
            filename: name,
            size,
            modified_date: modified.to_rfc3339(),
            href,
            exportable: verdict.is_ok(),
            reason: verdict.err(),
            mime_type,
            owner,
        });
    }
    tracing::info!(
        target: "api::export",
        requestor = %identity.requestor,
        dir = %export_dir.display(),
        entries = files.len(),
        "Listed export directory"
    );
    Ok(Json(serde_json::json!({ "files": files })))
}

/// Validate the request and resolve the on-disk file for serving.
async fn resolve_export_file(
    state: &AppState,
    tenant: &str,
    backend: &str,
    filename: &str,
    headers: &HeaderMap,
) -> Result<(std::path::PathBuf, std::fs::Metadata, String, String), ApiError> {
    let config = &state.config;
    tenant::validate_tenant(tenant, &state.tenant_re)?;
    auth::authorize(headers, tenant, config)?;
    let backend_cfg = config
        .disk_backend(backend)
        .ok_or_else(|| ApiError::NotFound(format!("unknown backend: {}", backend)))?;
    let export_dir = tenant::export_dir(backend_cfg, tenant, config)?;

    let secured = check_filename(filename, &config.disallowed_start_chars).map_err(|_| {
        ApiError::ExportForbidden(
            "Not allowed to access files in sub-directories, create a zip archive".into(),
        )
    })?;
    let path = export_dir.join(secured);
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|_| ApiError::NotFound("File does not exist".into()))?;
    if meta.is_dir() {
        return Err(ApiError::PolicyDenied(
            "exporting from directories not supported".into(),
        ));
    }
    let mime_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    let rule = backend_cfg.export_rule(tenant);
    evaluate_export_policy(
        &rule,
        secured,
        meta.len(),
        &mime_type,
        &config.disallowed_start_chars,
    )
    .map_err(ApiError::PolicyDenied)?;
    let etag = compute_etag(&meta);
    Ok((path, meta, mime_type, etag))
}

/// GET a file: whole-file or single-range chunked streaming.
pub async fn export_file(
    State(state): State<AppState>,
    Path((tenant, backend, filename)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (path, meta, mime_type, etag) =
        resolve_export_file(&state, &tenant, &backend, &filename, &headers).await?;
    let size = meta.len();
    let chunk_size = state.config.export_chunk_size;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let response = match range {
        None => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| ApiError::BackendUnavailable(e.to_string()))?;
            let stream = ReaderStream::with_capacity(file, chunk_size);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, mime_type.as_str())
                .header(header::CONTENT_LENGTH, size)
                .header(header::ETAG, etag.as_str())
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::from_stream(stream))
                .map_err(|e| ApiError::Internal(e.into()))?
        }
        Some(range) => {
            if let Some(if_range) = headers.get(header::IF_RANGE).and_then(|v| v.to_str().ok()) {
                if if_range != etag {
                    return Err(ApiError::PreconditionFailed(
                        "The resource has changed, get everything from the start again".into(),
                    ));
                }
            }
            let (start, end) = parse_range(&range, size)?;
            let bytes_to_read = end - start + 1;
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| ApiError::BackendUnavailable(e.to_string()))?;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| ApiError::BackendUnavailable(e.to_string()))?;
            let stream = ReaderStream::with_capacity(file.take(bytes_to_read), chunk_size);
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, mime_type.as_str())
                .header(header::CONTENT_LENGTH, bytes_to_read)
                .header(header::ETAG, etag.as_str())
                .body(Body::from_stream(stream))
                .map_err(|e| ApiError::Internal(e.into()))?
        }
    };
    tracing::info!(
        target: "api::export",
        path = %path.display(),
        mime_type = %mime_type,
        "Exported file"
    );
    Ok(response)
}

/// HEAD a file: size and range capability without a body.
pub async fn export_head(
    State(state): State<AppState>,
    Path((tenant, backend, filename)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (_path, meta, mime_type, etag) =
        resolve_export_file(&state, &tenant, &backend, &filename, &headers).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime_type.as_str())
        .header(header::CONTENT_LENGTH, meta.len())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, etag.as_str())
        .body(Body::empty())
        .map_err(|e| ApiError::Internal(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rule(enabled: bool, mimes: &[&str], max_size: Option<u64>) -> ExportRule {
        ExportRule {
            enabled,
            allowed_mime_types: mimes.iter().map(|m| m.to_string()).collect(),
            max_size,
        }
    }

    #[test]
    fn test_disabled_policy_allows_everything() {
        let rule = rule(false, &[], None);
        assert!(evaluate_export_policy(&rule, "x.bin", u64::MAX, "application/zip", ".").is_ok());
    }

    #[test]
    fn test_policy_mime_allow_list() {
        let rule = rule(true, &["text/plain"], None);
        assert!(evaluate_export_policy(&rule, "a.txt", 10, "text/plain", ".").is_ok());
        let denied = evaluate_export_policy(&rule, "a.zip", 10, "application/zip", ".");
        assert!(denied.unwrap_err().contains("MIME type"));
    }

    #[test]
    fn test_policy_wildcard_mime() {
        let rule = rule(true, &["*"], None);
        assert!(evaluate_export_policy(&rule, "a.zip", 10, "application/zip", ".").is_ok());
    }

    #[test]
    fn test_policy_max_size() {
        let rule = rule(true, &["*"], Some(100));
        assert!(evaluate_export_policy(&rule, "a.bin", 100, "application/zip", ".").is_ok());
        assert!(evaluate_export_policy(&rule, "a.bin", 101, "application/zip", ".").is_err());
    }

    #[test]
    fn test_policy_rejects_illegal_filename() {
        let rule = rule(false, &[], None);
        let denied = evaluate_export_policy(&rule, ".hidden", 10, "text/plain", ".");
        assert!(denied.unwrap_err().contains("Illegal export filename"));
    }

    #[test]
    fn test_parse_range_explicit() {
        assert_eq!(parse_range("bytes=2-5", 10).unwrap(), (2, 5));
        assert_eq!(parse_range("bytes=0-0", 10).unwrap(), (0, 0));
    }

    #[test]
    fn test_parse_range_open_ended() {
        assert_eq!(parse_range("bytes=4-", 10).unwrap(), (4, 9));
    }

    #[test]
    fn test_parse_range_rejects_multipart() {
        assert!(matches!(
            parse_range("bytes=0-1,3-4", 10),
            Err(ApiError::RangeMultipart)
        ));
    }

    #[test]
    fn test_parse_range_rejects_overlong_end() {
        assert!(matches!(
            parse_range("bytes=0-11", 10),
            Err(ApiError::RangeUnsatisfiable(_))
        ));
        // the inclusive end may not exceed the size itself
        assert!(parse_range("bytes=0-10", 10).is_ok());
    }

    #[test]
    fn test_parse_range_rejects_inverted() {
        assert!(matches!(
            parse_range("bytes=5-2", 10),
            Err(ApiError::RangeUnsatisfiable(_))
        ));
    }

    #[test]
    fn test_parse_range_rejects_garbage() {
        assert!(matches!(
            parse_range("bytes=abc-def", 10),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(parse_range("0-5", 10), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_etag_tracks_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"x").unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        let etag = compute_etag(&meta);
        assert_eq!(etag.len(), 32);
        assert_eq!(etag, compute_etag(&meta));
        let expected = format!("{:x}", md5::compute(meta.mtime().to_string().as_bytes()));
        assert_eq!(etag, expected);
    }
}
