//! Logging setup for the runner binary
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to whoever embeds it.

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rotated daily inside the log directory
pub const LOG_FILE_NAME: &str = "bastion_core.log";

/// Filter from `RUST_LOG`, falling back to `default_level`
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install stdout logging plus a daily-rolling file when `log_dir` is usable
///
/// Returns false if a global subscriber was already installed.
pub fn init_logging(log_dir: Option<&Path>, default_level: &str) -> bool {
    let file_layer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Cannot create log directory {}: {}", dir.display(), e);
            return None;
        }
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_NAME)
            .build(dir)
            .map_err(|e| eprintln!("Cannot open log file in {}: {}", dir.display(), e))
            .ok()?;
        Some(
            fmt::layer()
                .with_writer(appender)
                .with_target(true)
                .with_ansi(false)
                .compact(),
        )
    });

    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()
        .is_ok()
}
