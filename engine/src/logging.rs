//! Tracing setup shared by all front ends.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_subscriber::prelude::*;

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// File name prefix of the daily rolling log
pub const LOG_FILE_NAME: &str = "samlabel.log";

/// Platform log directory (`<data dir>/samlabel/logs`), falling back to `.logs`
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("samlabel").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".logs"))
}

/// Installs the global subscriber: env-filtered stderr output plus a daily
/// rolling file under `log_dir` when one is given.
///
/// Calling it twice is harmless; the first subscriber wins.
pub fn init_logging(log_dir: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(cfg!(debug_assertions));

    let file_layer = log_dir.and_then(|dir| {
        // Best effort
        std::fs::create_dir_all(dir).ok()?;
        let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let _ = LOG_GUARD.set(guard);

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);

    // Already initialized (tests, embedding hosts)
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_logging_creates_log_dir() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("logs");
        init_logging(Some(&log_dir));
        init_logging(None);
        assert!(log_dir.is_dir());
    }
}
