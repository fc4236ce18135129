//! provides logging helpers

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// When set, logs go to a daily rotated file under this path instead of stderr.
pub const LOG_PATH_ENV_VAR: &str = "GPU_ALLOCATOR_LOG_PATH";

const DEFAULT_LOG_PREFIX: &str = "gpu-allocator.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Splits a log path into the rotation directory and the file prefix.
fn rotation_target(path: &Path) -> (&Path, &str) {
    if path.is_dir() {
        return (path, DEFAULT_LOG_PREFIX);
    }
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_PREFIX);
    (parent, prefix)
}

/// initiate the global tracing subscriber
///
/// The returned guard must be held for the lifetime of the process when file
/// logging is active, otherwise buffered lines are lost on exit.
pub fn init() -> Option<WorkerGuard> {
    let Some(log_path) = env::var(LOG_PATH_ENV_VAR).ok().filter(|p| !p.is_empty()) else {
        let fmt_layer = layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(env_filter());
        registry().with(fmt_layer).init();
        return None;
    };

    let (rotation_dir, prefix) = rotation_target(Path::new(&log_path));
    let (writer, guard) = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(rotation_dir)
    {
        Ok(appender) => tracing_appender::non_blocking(appender),
        Err(err) => {
            eprintln!(
                "failed to create rolling log appender at {}: {err}; falling back to stderr",
                rotation_dir.display()
            );
            tracing_appender::non_blocking(std::io::stderr())
        }
    };

    let fmt_layer = layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(env_filter());
    registry().with(fmt_layer).init();
    Some(guard)
}
