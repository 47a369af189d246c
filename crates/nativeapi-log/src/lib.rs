//! Structured logging for the native API device.
//!
//! Console output with uptime timestamps and module paths, optional JSON file
//! logging for post-mortem analysis, and a [`LogTap`] layer that captures
//! formatted lines so the server can forward them to subscribed API clients.
//! Filtering honours `RUST_LOG` and falls back to the configured level.

mod tap;

use std::path::Path;

use nativeapi_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use tap::{LogTap, TapLine};

const DEFAULT_FILTER: &str = "info";
const LOG_FILE_NAME: &str = "nativeapi.log";

/// Build the subscriber without installing it.
///
/// * `log_dir` - Directory for the JSON log file
/// * `json_file` - Whether to write the JSON log file at all
/// * `config` - Optional configuration providing the fallback filter
/// * `tap` - Optional tap receiving a copy of every event
pub fn build_subscriber(
    log_dir: Option<&Path>,
    json_file: bool,
    config: Option<&Config>,
    tap: Option<LogTap>,
) -> impl tracing::Subscriber + Send + Sync {
    let filter_str = match config {
        Some(config) if !config.logger.level.is_empty() => config.logger.level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    };

    // RUST_LOG wins over the configured level.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let file_layer = if json_file
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        Some(
            fmt::layer()
                .with_writer(log_file)
                .with_ansi(false)
                .with_target(true)
                .with_timer(fmt::time::uptime())
                .json(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .with(tap)
}

/// Install the global tracing subscriber. See [`build_subscriber`].
///
/// ```no_run
/// use nativeapi_config::Config;
/// use nativeapi_log::{LogTap, init_logging};
///
/// let config = Config::default();
/// let tap = LogTap::new(config.logger.tap_capacity);
/// init_logging(None, false, Some(&config), Some(tap.clone()));
/// ```
pub fn init_logging(
    log_dir: Option<&Path>,
    json_file: bool,
    config: Option<&Config>,
    tap: Option<LogTap>,
) {
    build_subscriber(log_dir, json_file, config, tap).init();
}

/// An `EnvFilter` with the default directive.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}
