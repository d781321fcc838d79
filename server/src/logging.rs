//! Structured logging initialization.
//!
//! Log lines go to a non-blocking file appender under the configured
//! directory. The `RUST_LOG` environment variable takes precedence over the
//! default `info` level.

use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::Config;

/// Initialize the logging subsystem. The returned guard must be kept alive
/// for the lifetime of the process; dropping it flushes and stops the
/// writer thread.
pub fn init(config: &Config) -> io::Result<WorkerGuard> {
    if !config.log_file_dir.is_dir() {
        std::fs::create_dir_all(&config.log_file_dir)?;
    }

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("info")
    };

    let appender = tracing_appender::rolling::never(&config.log_file_dir, &config.log_file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer),
        )
        .init();

    Ok(guard)
}
