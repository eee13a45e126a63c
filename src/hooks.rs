//! Post-ingestion request hook.
//!
//! After data has been accepted, a configured external command may be run
//! to set POSIX ownership and permissions on the settled file. The file is
//! already accepted by the time the hook runs, so hook failures are logged
//! and never alter the HTTP response.

use crate::config::RequestHookConfig;
use std::path::Path;
use tokio::process::Command;

/// Run the backend's request hook as `hook path requestor api_user group`,
/// optionally via sudo. Suppressed for tenants listed in `skip_tenants`.
pub async fn call_request_hook(
    hook: &RequestHookConfig,
    tenant: &str,
    path: &Path,
    requestor: &str,
    api_user: &str,
    group_name: &str,
) {
    if !hook.enabled {
        return;
    }
    if hook.skip_tenants.iter().any(|t| t == tenant) {
        tracing::debug!(
            target: "hooks",
            tenant = %tenant,
            "Request hook suppressed for tenant"
        );
        return;
    }
    let Some(hook_path) = hook.path.as_deref() else {
        tracing::warn!(target: "hooks", "Request hook enabled but no path configured");
        return;
    };

    let mut cmd = if hook.sudo {
        let mut c = Command::new("sudo");
        c.arg(hook_path);
        c
    } else {
        Command::new(hook_path)
    };
    cmd.arg(path).args([requestor, api_user, group_name]);

    match cmd.status().await {
        Ok(status) if status.success() => {
            tracing::debug!(
                target: "hooks",
                path = %path.display(),
                requestor = %requestor,
                "Request hook completed"
            );
        }
        Ok(status) => {
            tracing::error!(
                target: "hooks",
                path = %path.display(),
                %status,
                "Request hook exited with failure"
            );
        }
        Err(e) => {
            tracing::error!(
                target: "hooks",
                path = %path.display(),
                error = %e,
                "Could not run request hook"
            );
        }
    }
}
