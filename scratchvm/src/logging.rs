//! Tracing setup: stderr plus a non-blocking file under `<home>/logs/`.

use crate::runtime::layout::FilesystemLayout;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const LOG_FILE: &str = "scratchvm.log";

/// Keeps the file writer flushing. Drop it last.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber. `RUST_LOG` wins over the `info` default.
///
/// A second call in the same process leaves the first subscriber in place
/// and returns a guard without a file writer.
pub fn init_logging_for(layout: &FilesystemLayout) -> ScratchResult<LogGuard> {
    let dir = layout.logs_dir();
    std::fs::create_dir_all(&dir).map_err(|e| {
        ScratchError::Storage(format!("Failed to create log dir {}: {}", dir.display(), e))
    })?;

    let file_appender = tracing_appender::rolling::never(&dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    let installed = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .is_ok();

    Ok(LogGuard {
        _file_guard: installed.then_some(guard),
    })
}
