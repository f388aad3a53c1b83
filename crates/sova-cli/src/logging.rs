//! Daily log files with a one-week retention window

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_RETENTION_DAYS: u64 = 7;
const LOG_PREFIX: &str = "sova";

pub struct LogManager {
    log_dir: PathBuf,
}

impl LogManager {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn current_log_path(&self) -> PathBuf {
        let today = chrono::Local::now().format("%Y-%m-%d");
        self.log_dir.join(format!("{}.{}.log", LOG_PREFIX, today))
    }

    fn is_log_file(path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(LOG_PREFIX) && n.ends_with(".log"))
                .unwrap_or(false)
    }

    /// Delete log files last modified before the retention window.
    /// Returns how many were removed.
    pub fn cleanup_old_logs(&self, retention_days: u64) -> Result<usize> {
        if !self.log_dir.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now() - Duration::from_secs(retention_days * 24 * 60 * 60);
        let mut deleted = 0;
        for entry in fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if !Self::is_log_file(&path) {
                continue;
            }
            if fs::metadata(&path)?.modified()? < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => deleted += 1,
                    Err(e) => eprintln!("Failed to delete old log {}: {}", path.display(), e),
                }
            }
        }
        if deleted > 0 {
            tracing::info!("Cleaned up {} old log file(s)", deleted);
        }
        Ok(deleted)
    }

    /// Log files, newest first.
    pub fn log_files(&self) -> Result<Vec<PathBuf>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if Self::is_log_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        files.reverse();
        Ok(files)
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self
            .log_files()?
            .iter()
            .filter_map(|file| fs::metadata(file).ok())
            .map(|metadata| metadata.len())
            .sum())
    }

    pub fn format_size(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;
        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}

pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// stderr plus an append-only file for today. `RUST_LOG` wins over `log_level`.
pub fn init_logging(log_dir: &Path, log_level: &str) -> Result<LoggingGuard> {
    fs::create_dir_all(log_dir)?;
    let manager = LogManager::new(log_dir.to_path_buf());
    manager.cleanup_old_logs(LOG_RETENTION_DAYS)?;

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(manager.current_log_path())?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_filter(env_filter(log_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_filter(env_filter(log_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    Ok(LoggingGuard { _guard: guard })
}

/// Console-only logging for short-lived commands.
pub fn init_console(log_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter(log_level))
        .try_init();
}
