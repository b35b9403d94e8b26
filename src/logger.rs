use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::LogConfig;

/// Initializes the global logger.
///
/// This function should be called once at the very beginning of the application's `main`
/// function. `log` records are bridged into `tracing`, so both macro families end up in the same
/// sinks: the console and, when `config.dir` is set, a daily rolling file.
///
/// The filter comes from `RUST_LOG` and falls back to `config.level`.
/// Example: `RUST_LOG=workflow_orchestrator=debug,rpc_metrics=off`
///
/// The returned guard flushes the file writer on drop and must be kept alive by the caller.
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr).with_filter(filter());

    let (file_layer, guard) = match &config.dir {
        Some(dir) => match fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                (Some(fmt::layer().with_ansi(false).with_target(true).with_writer(writer).with_filter(filter())), Some(guard))
            }
            Err(e) => {
                eprintln!("Failed to create log directory at '{}': {}", dir.display(), e);
                (None, None)
            }
        },
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry().with(console_layer).with(file_layer);

    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to bridge log records into tracing: {}", e);
    }
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to apply logger configuration: {}", e);
        return None;
    }

    match &config.dir {
        Some(dir) => log::info!("Logger initialized. Logging to console and '{}/{}.*'.", dir.display(), config.file_prefix),
        None => log::info!("Logger initialized. Logging to console."),
    }
    guard
}
