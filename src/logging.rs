use std::path::Path;

use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{QmsError, Result};

/// Initialize the structured logging subscriber (console + rolling file).
///
/// This is an observability side-channel only — the system of record for
/// compliance is the checksum-chained audit log in [`crate::audit`], which
/// persists to SQLite independently of whatever this subscriber does.
pub fn init_tracing(config: &LoggingConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_path = Path::new(&config.file);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| QmsError::FileSystem {
            path: parent.display().to_string(),
            message: format!("failed to create log directory: {e}"),
        })?;
    }

    let file_appender = rolling::daily(
        log_path.parent().unwrap_or_else(|| Path::new(".")),
        log_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("qms-core.log"),
    );
    let (non_blocking_writer, guard) = non_blocking(file_appender);

    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    use tracing_subscriber::Layer;

    let file_layer: Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> =
        if config.json_format {
            Box::new(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking_writer)
                    .with_target(true)
                    .with_line_number(true),
            )
        } else {
            Box::new(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking_writer)
                    .with_target(true)
                    .with_line_number(true),
            )
        };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .with(file_layer)
        .init();

    tracing::info!(
        component = "logging",
        action = "initialized",
        level = %config.level,
        "structured logging initialized"
    );

    Ok(guard)
}
