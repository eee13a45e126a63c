//! Tenant resolution: identifier validation and per-tenant backend paths.
//!
//! Every resource the API touches is scoped by the tenant segment of the
//! URL. Backend path patterns from the configuration carry a token
//! (`tenant_string_pattern`) that is substituted with the validated tenant.

use crate::config::{DiskBackend, ServerConfig};
use regex::Regex;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("invalid tenant identifier")]
    BadTenant,
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Validate the tenant segment extracted from the URL.
pub fn validate_tenant<'a>(tenant: &'a str, pattern: &Regex) -> Result<&'a str, TenantError> {
    if pattern.is_match(tenant) {
        Ok(tenant)
    } else {
        Err(TenantError::BadTenant)
    }
}

/// Substitute the tenant into a configured path pattern.
pub fn resolve_pattern(pattern: &str, tenant: &str, config: &ServerConfig) -> PathBuf {
    PathBuf::from(pattern.replace(&config.tenant_string_pattern, tenant))
}

/// Resolve the import directory for a tenant on one backend.
///
/// Admin tenants resolve to the backend's `admin_path` and never trigger
/// directory creation. For backends with `create_tenant_dir` set, the
/// per-tenant directory is created with restricted permissions on first
/// use; failure to create it means the backend cannot serve the tenant.
pub fn import_dir(
    backend: &DiskBackend,
    tenant: &str,
    config: &ServerConfig,
) -> Result<PathBuf, TenantError> {
    let is_admin = backend.admin_tenants.iter().any(|t| t == tenant);
    let pattern = if is_admin {
        backend.admin_path.as_deref().unwrap_or(&backend.import_path)
    } else {
        &backend.import_path
    };
    let dir = resolve_pattern(pattern, tenant, config);
    if backend.create_tenant_dir && !is_admin && !dir.is_dir() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|e| {
                tracing::error!(
                    target: "tenant",
                    tenant = %tenant,
                    dir = %dir.display(),
                    error = %e,
                    "Failed to create tenant directory"
                );
                TenantError::BackendUnavailable(format!("cannot create {}", dir.display()))
            })?;
    }
    Ok(dir)
}

/// Resolve the export directory for a tenant on one backend.
pub fn export_dir(
    backend: &DiskBackend,
    tenant: &str,
    config: &ServerConfig,
) -> Result<PathBuf, TenantError> {
    let pattern = backend
        .export_path
        .as_deref()
        .ok_or_else(|| TenantError::BackendUnavailable("no export path configured".into()))?;
    Ok(resolve_pattern(pattern, tenant, config))
}
