use std::fs;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::core::config::AppPaths;

/// Default directives when `RUST_LOG` is unset. The engine and sidecar log
/// per-token and per-branch detail at debug; the pool, HTTP client, and
/// server stacks would drown that out, so they stay at warn.
const DEFAULT_DIRECTIVES: &str =
    "info,hearth_backend=debug,sqlx=warn,hyper=warn,reqwest=warn,tower_http=info";

/// Install the global subscriber: compact stdout plus a daily-rolling file
/// under the data directory's `logs/`.
///
/// Returns the file writer's flush guard; the caller keeps it alive for the
/// life of the process. `None` means the log directory was unusable and
/// only stdout logging is active.
pub fn init(paths: &AppPaths) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false);

    match fs::create_dir_all(&paths.log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&paths.log_dir, "hearth.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // The file keeps targets so a log bundle attached to a bug
            // report still says which subsystem spoke.
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(err) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .init();
            tracing::warn!("file logging disabled ({}): {err}", paths.log_dir.display());
            None
        }
    }
}
