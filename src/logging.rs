use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Configuration for the logging system
pub struct LogConfig {
    /// Directory where log files will be stored; stdout-only when absent
    pub log_dir: Option<PathBuf>,
    /// Prefix for log file names
    pub file_prefix: String,
    /// Maximum number of log files to keep (rotation)
    pub max_files: usize,
    /// Default level when RUST_LOG is unset
    pub default_level: &'static str,
}

impl LogConfig {
    pub fn new(log_dir: Option<PathBuf>, debug: bool) -> Self {
        Self {
            log_dir,
            file_prefix: "filevault".to_string(),
            max_files: 5,
            default_level: if debug { "debug" } else { "info" },
        }
    }
}

/// Initialize the logging system with stdout output and optional file output
///
/// This sets up:
/// - Stdout logging (compact, with targets)
/// - File logging with daily rotation when a log directory is configured
/// - Component-specific log targets (api::upload, api::export, resumables, ...)
/// - Configurable log levels via the RUST_LOG environment variable
pub fn init_logging(config: LogConfig) -> Result<LogGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level));

    let stdout_layer = fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true)
        .with_filter(env_filter);

    let mut worker_guard = None;
    let file_layer = match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).context("Failed to create log directory")?;
            let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(&config.file_prefix)
                .filename_suffix("log")
                .max_log_files(config.max_files)
                .build(log_dir)
                .context("Failed to create file appender")?;
            // The guard MUST be kept alive for the entire application lifetime
            let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);
            worker_guard = Some(guard);
            let file_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.default_level));
            Some(
                fmt::layer()
                    .json()
                    .with_writer(non_blocking_file)
                    .with_target(true)
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                    .with_filter(file_filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    if let Some(dir) = &config.log_dir {
        tracing::info!(
            target: "main",
            log_dir = %dir.display(),
            max_files = config.max_files,
            "Logging system initialized"
        );
    }

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}

/// Guard that ensures file logs are flushed before exit
pub struct LogGuard {
    _worker_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}
