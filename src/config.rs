//! Startup configuration, loaded once from a YAML file.
//!
//! The parsed [`ServerConfig`] is immutable for the process lifetime and is
//! shared with handlers through the application state.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Export policy rule for one tenant (or the `default` fallback entry).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportRule {
    /// When disabled, every file in the export directory is exportable.
    pub enabled: bool,
    /// Allowed MIME types; the single entry `*` allows any type.
    pub allowed_mime_types: Vec<String>,
    /// Maximum exportable file size in bytes, unlimited when absent.
    pub max_size: Option<u64>,
}

impl Default for ExportRule {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_mime_types: Vec::new(),
            max_size: None,
        }
    }
}

/// External command fired after successful ingestion.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RequestHookConfig {
    pub enabled: bool,
    /// Absolute path of the hook executable.
    pub path: Option<String>,
    /// Run the hook through sudo.
    pub sudo: bool,
    /// Tenants for which the hook is suppressed.
    pub skip_tenants: Vec<String>,
}

/// One disk storage backend (`files`, `cluster`, `store`, ...).
///
/// Path patterns contain the `tenant_string_pattern` token, which is
/// substituted with the request tenant at resolution time.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiskBackend {
    pub import_path: String,
    /// Alternative import path used for tenants listed in `admin_tenants`.
    pub admin_path: Option<String>,
    pub export_path: Option<String>,
    /// Tenants that resolve to `admin_path` and skip directory creation.
    pub admin_tenants: Vec<String>,
    /// Create the per-tenant import directory on first use (mode 0700).
    pub create_tenant_dir: bool,
    /// Keyed by tenant, with a `default` fallback entry.
    pub export_policy: HashMap<String, ExportRule>,
    pub request_hook: RequestHookConfig,
}

impl Default for DiskBackend {
    fn default() -> Self {
        Self {
            import_path: String::new(),
            admin_path: None,
            export_path: None,
            admin_tenants: Vec::new(),
            create_tenant_dir: false,
            export_policy: HashMap::new(),
            request_hook: RequestHookConfig::default(),
        }
    }
}

impl DiskBackend {
    /// Export rule for a tenant, falling back to the `default` entry.
    ///
    /// An absent policy section behaves as a disabled rule, which makes
    /// every file exportable.
    pub fn export_rule(&self, tenant: &str) -> ExportRule {
        self.export_policy
            .get(tenant)
            .or_else(|| self.export_policy.get("default"))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Backends {
    pub disk: HashMap<String, DiskBackend>,
}

/// Keyring used to unwrap the PGP-encrypted AES key from the `Aes-Key`
/// header. Key management itself lives outside this service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PgpConfig {
    pub binary: String,
    pub homedir: Option<String>,
}

impl Default for PgpConfig {
    fn default() -> Self {
        Self {
            binary: "gpg".to_string(),
            homedir: None,
        }
    }
}

/// Process-wide configuration, deserialized from the YAML file named on the
/// command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub debug: bool,
    /// Service account passed to the request hook.
    pub api_user: String,
    /// HS256 secret for bearer-token validation.
    pub jwt_secret: String,
    /// Check that the URL tenant matches the tenant claim.
    pub token_check_tenant: bool,
    /// Validate token expiry.
    pub token_check_exp: bool,
    /// Filenames may not begin with any of these characters.
    pub disallowed_start_chars: String,
    pub requestor_claim_name: String,
    pub tenant_claim_name: String,
    /// Token substituted with the tenant in backend path patterns.
    pub tenant_string_pattern: String,
    pub valid_tenant_regex: String,
    pub valid_group_regex: String,
    /// Chunk size for export streaming, in bytes.
    pub export_chunk_size: usize,
    /// Maximum number of entries an export listing may return.
    pub export_max_num_list: usize,
    /// Timeout for the proxy's internal upload request, in seconds.
    pub proxy_timeout_seconds: u64,
    /// Log file directory; stdout-only logging when absent.
    pub log_dir: Option<PathBuf>,
    pub pgp: PgpConfig,
    pub backends: Backends,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3003,
            debug: false,
            api_user: "fileapi".to_string(),
            jwt_secret: String::new(),
            token_check_tenant: true,
            token_check_exp: true,
            disallowed_start_chars: String::new(),
            requestor_claim_name: "user".to_string(),
            tenant_claim_name: "proj".to_string(),
            tenant_string_pattern: "pXX".to_string(),
            valid_tenant_regex: "^[0-9a-z]+$".to_string(),
            valid_group_regex: "^[a-z0-9]+-[a-z0-9-]+-group$".to_string(),
            export_chunk_size: 512 * 1024,
            export_max_num_list: 100,
            proxy_timeout_seconds: 12000,
            log_dir: None,
            pgp: PgpConfig::default(),
            backends: Backends::default(),
        }
    }
}

impl ServerConfig {
    /// Load and validate the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ServerConfig =
            serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        Regex::new(&self.valid_tenant_regex).context("invalid valid_tenant_regex")?;
        Regex::new(&self.valid_group_regex).context("invalid valid_group_regex")?;
        if self.backends.disk.is_empty() {
            anyhow::bail!("no disk backends configured");
        }
        Ok(())
    }

    /// Compiled tenant validator. `load` guarantees the pattern compiles.
    pub fn tenant_regex(&self) -> Regex {
        Regex::new(&self.valid_tenant_regex).expect("validated at load time")
    }

    /// Compiled group-name validator.
    pub fn group_regex(&self) -> Regex {
        Regex::new(&self.valid_group_regex).expect("validated at load time")
    }

    /// Look up a disk backend by the URL segment naming it.
    pub fn disk_backend(&self, name: &str) -> Option<&DiskBackend> {
        self.backends.disk.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
port: 4001
jwt_secret: testsecret
valid_tenant_regex: "^p[0-9]+$"
backends:
  disk:
    files:
      import_path: /data/pXX/import
      export_path: /data/pXX/export
"#;

    #[test]
    fn test_load_minimal_config() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(MINIMAL.as_bytes()).unwrap();
        let config = ServerConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 4001);
        assert!(config.token_check_tenant); // default
        assert!(config.disk_backend("files").is_some());
        assert!(config.disk_backend("cluster").is_none());
    }

    #[test]
    fn test_load_rejects_bad_yaml() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"port: [not a port").unwrap();
        assert!(ServerConfig::load(f.path()).is_err());
    }

    #[test]
    fn test_load_rejects_missing_backends() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"port: 4001\n").unwrap();
        assert!(ServerConfig::load(f.path()).is_err());
    }

    #[test]
    fn test_export_rule_fallback() {
        let yaml = r#"
import_path: /data/pXX/import
export_policy:
  default:
    enabled: true
    allowed_mime_types: ["*"]
  p11:
    enabled: true
    allowed_mime_types: ["text/plain"]
    max_size: 1000
"#;
        let backend: DiskBackend = serde_yaml::from_str(yaml).unwrap();
        let rule = backend.export_rule("p11");
        assert_eq!(rule.allowed_mime_types, vec!["text/plain"]);
        assert_eq!(rule.max_size, Some(1000));
        let fallback = backend.export_rule("p99");
        assert_eq!(fallback.allowed_mime_types, vec!["*"]);
        assert_eq!(fallback.max_size, None);
    }

    #[test]
    fn test_export_rule_absent_policy_is_disabled() {
        let backend = DiskBackend::default();
        assert!(!backend.export_rule("p11").enabled);
    }
}
