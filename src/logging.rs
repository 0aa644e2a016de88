//! Logging initialisation for kubevm-bootstrap.
//!
//! Stderr output is always on, filtered by `RUST_LOG` (default `info`).
//! When `KUBEVM_LOG=1` a second, ANSI-free layer also writes to
//! `kubevm-bootstrap.log` in the application log directory.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "KUBEVM_LOG";
const LOG_FILE: &str = "kubevm-bootstrap.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process. `log_dir` is only used when file
/// logging is enabled.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> LogGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_guard = if std::env::var(LOG_ENV).as_deref() == Ok("1") {
        let dir = log_dir.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard { _file_guard: file_guard }
}
