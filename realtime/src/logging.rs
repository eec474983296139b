use std::path::Path;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

static TRACING_GUARDS: OnceCell<Mutex<Vec<WorkerGuard>>> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Install stdout + daily-rolling file logging. Later calls are no-ops.
///
/// Falls back to stdout only when the log directory cannot be used.
pub fn init_tracing(logs_dir: &Path) {
    TRACING_INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("classroom-realtime")
            .filename_suffix("log")
            .build(logs_dir);

        match file_appender {
            Ok(file_appender) => {
                let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
                TRACING_GUARDS
                    .set(Mutex::new(vec![file_guard, stdout_guard]))
                    .ok();

                let file_layer = Layer::new()
                    .with_writer(non_blocking_file)
                    .with_ansi(false)
                    .with_target(true);

                let _ = Registry::default()
                    .with(filter)
                    .with(stdout_layer)
                    .with(file_layer)
                    .try_init();
            }
            Err(e) => {
                TRACING_GUARDS.set(Mutex::new(vec![stdout_guard])).ok();
                let _ = Registry::default().with(filter).with(stdout_layer).try_init();
                tracing::warn!(error = %e, dir = %logs_dir.display(), "File logging disabled");
            }
        }
    });
}

/// Flush and drop the logging workers. Call once before process exit.
pub fn shutdown_tracing() {
    if let Some(guards) = TRACING_GUARDS.get() {
        if let Ok(mut guards) = guards.lock() {
            guards.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init_tracing(dir.path());
        init_tracing(dir.path());
        tracing::info!("logging initialised");
        assert!(TRACING_INIT.get().is_some());
    }
}
