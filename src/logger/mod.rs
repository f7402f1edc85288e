//! Logging with daily rotation and retention cleanup
//!
//! Console output goes to stderr (stdout carries query results and JSON),
//! and every run also appends to `<db>/logs/studysearch.log`. Structured
//! ingestion/query events are emitted under the `studysearch::events` target
//! and end up in the same sinks.

use anyhow::Result;
use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::constants::{
    DEFAULT_LOG_MAX_FILES, DEFAULT_LOG_RETENTION_DAYS, LOG_DIR_NAME, LOG_FILE_NAME,
};

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_tracing_level(&self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log rotation configuration
#[derive(Debug, Clone)]
pub struct LogRotationConfig {
    /// Maximum number of log files to retain, newest first
    pub max_files: usize,
    /// Logs older than this are removed by cleanup
    pub retention_days: u64,
}

impl Default for LogRotationConfig {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_LOG_MAX_FILES,
            retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }
}

impl LogRotationConfig {
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        }

        Self {
            max_files: var("STUDYSEARCH_LOG_MAX_FILES", DEFAULT_LOG_MAX_FILES),
            retention_days: var("STUDYSEARCH_LOG_RETENTION_DAYS", DEFAULT_LOG_RETENTION_DAYS),
        }
    }
}

/// `<db>/logs/`
pub fn get_log_dir(db_path: &Path) -> PathBuf {
    db_path.join(LOG_DIR_NAME)
}

/// `<db>/logs/studysearch.log`
pub fn get_log_file(db_path: &Path) -> PathBuf {
    get_log_dir(db_path).join(LOG_FILE_NAME)
}

pub fn ensure_log_dir(db_path: &Path) -> Result<()> {
    let log_dir = get_log_dir(db_path);
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    Ok(())
}

fn env_filter(log_level: LogLevel) -> EnvFilter {
    // RUST_LOG wins when set; otherwise keep engine crates quiet
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "studysearch={},tantivy=info,tantivy::directory::mmap_directory=warn,arroy=info,ort=warn",
            log_level.as_str()
        ))
    })
}

/// Initialize the logging system for a database
///
/// # Arguments
/// * `db_path` - Path to the database directory (.studysearch.db)
/// * `log_level` - Level for studysearch's own targets
/// * `quiet` - Suppress console output (logs go to the file only)
pub fn init_logger(
    db_path: &Path,
    log_level: LogLevel,
    quiet: bool,
) -> Result<(PathBuf, LogRotationConfig)> {
    let rotation_config = LogRotationConfig::from_env();

    ensure_log_dir(db_path)?;
    let log_dir = get_log_dir(db_path);

    // tracing-appender rotates by time only; file count and age are handled by cleanup
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir.clone(), LOG_FILE_NAME);

    if quiet {
        tracing_subscriber::registry()
            .with(env_filter(log_level))
            .with(fmt::layer().with_ansi(false).with_writer(file_appender))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter(log_level))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(fmt::layer().with_ansi(false).with_writer(file_appender))
            .try_init()?;
    }

    tracing::debug!(
        "Logger initialized: level={}, dir={:?}, rotation={:?}",
        log_level.as_str(),
        log_dir,
        rotation_config
    );

    Ok((get_log_file(db_path), rotation_config))
}

/// Remove log files past the retention period or beyond the newest `max_files`
pub fn cleanup_old_logs(db_path: &Path, rotation_config: &LogRotationConfig) -> Result<usize> {
    let log_dir = get_log_dir(db_path);
    if !log_dir.exists() {
        return Ok(0);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(&log_dir)? {
        let entry = entry?;
        let path = entry.path();

        if !path.is_file() || path.file_name() == Some(std::ffi::OsStr::new(LOG_FILE_NAME)) {
            continue;
        }

        match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => files.push((path, chrono::DateTime::<Utc>::from(modified))),
            Err(_) => continue,
        }
    }

    // Newest first; ties broken by name so dated files order deterministically
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let cutoff = Utc::now() - Duration::days(rotation_config.retention_days as i64);
    let mut removed_count = 0;

    for (index, (path, modified)) in files.iter().enumerate() {
        if index < rotation_config.max_files && *modified >= cutoff {
            continue;
        }
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::debug!("Removed old log file: {:?}", path);
                removed_count += 1;
            }
            Err(e) => tracing::warn!("Failed to remove old log file {:?}: {}", path, e),
        }
    }

    if removed_count > 0 {
        tracing::info!("Cleaned up {} old log files from {:?}", removed_count, log_dir);
    }

    Ok(removed_count)
}
