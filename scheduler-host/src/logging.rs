//! Tracing setup, grounded on the teacher's `subscribe_log`: an `EnvFilter`
//! driven stdout layer, plus an optional rolling file layer for the
//! scheduler's own operational log (`scheduler_log`).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. The returned guard must be held for the
/// lifetime of the process if a file layer was installed, or its
/// non-blocking writer stops flushing.
pub fn init(log_level: &str, scheduler_log: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_ansi(true);

    match scheduler_log {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("failed to create log dir {}: {e}", dir.display());
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(stdout_layer)
                    .init();
                return None;
            }
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "scheduler.log".to_string());
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().json().with_writer(non_blocking).with_ansi(false);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .init();
            None
        }
    }
}
