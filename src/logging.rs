//! Tracing configuration and log routing.
//!
//! Pipeline events go to stdout through a compact formatter and, unless disabled, to a log
//! file as well. `RUSTY_RAG_LOG_FILE` picks the file (appended to); the value `off` disables
//! file output entirely. Without the variable, logs land in `logs/rusty-rag.log`. File output
//! goes through a non-blocking writer so job workers never wait on disk.
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE_VAR: &str = "RUSTY_RAG_LOG_FILE";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_NAME: &str = "rusty-rag.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where file logs should be written.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogTarget {
    Disabled,
    Explicit(PathBuf),
    Default,
}

fn resolve_log_target(value: Option<&str>) -> LogTarget {
    match value.map(str::trim) {
        None | Some("") => LogTarget::Default,
        Some(value) if value.eq_ignore_ascii_case("off") => LogTarget::Disabled,
        Some(path) => LogTarget::Explicit(PathBuf::from(path)),
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` (or `info`) applies to every target.
pub fn init_tracing(default_level: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.unwrap_or("info")));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    let target = resolve_log_target(std::env::var(LOG_FILE_VAR).ok().as_deref());
    match file_writer(target) {
        Some(writer) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact();
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

fn file_writer(target: LogTarget) -> Option<NonBlocking> {
    let (non_blocking, guard) = match target {
        LogTarget::Disabled => return None,
        LogTarget::Explicit(path) => {
            let file = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) => {
                    eprintln!("Failed to open log file {}: {err}", path.display());
                    return None;
                }
            };
            tracing_appender::non_blocking(file)
        }
        LogTarget::Default => {
            if let Err(err) = std::fs::create_dir_all(DEFAULT_LOG_DIR) {
                eprintln!("Failed to create logs directory: {err}");
                return None;
            }
            let appender = tracing_appender::rolling::never(DEFAULT_LOG_DIR, DEFAULT_LOG_NAME);
            tracing_appender::non_blocking(appender)
        }
    };
    let _ = LOG_GUARD.set(guard);
    Some(non_blocking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_target_resolution() {
        assert_eq!(resolve_log_target(None), LogTarget::Default);
        assert_eq!(resolve_log_target(Some("  ")), LogTarget::Default);
        assert_eq!(resolve_log_target(Some("OFF")), LogTarget::Disabled);
        assert_eq!(
            resolve_log_target(Some("/tmp/pipeline.log")),
            LogTarget::Explicit(PathBuf::from("/tmp/pipeline.log"))
        );
    }
}
