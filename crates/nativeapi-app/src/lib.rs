//! Host binary support for the native API device.
//!
//! Wires the config file, logging, the demo entity set, the scheduler and
//! the API server together. `main.rs` only parses arguments and reports
//! startup errors.

pub mod device;
pub mod platform;

use std::sync::Arc;

use nativeapi_config::{CliArgs, Config, ConfigError};
use nativeapi_log::{LogTap, init_logging};
use nativeapi_net::create_listener;
use nativeapi_scheduler::{Clock, Scheduler, SystemClock};
use nativeapi_server::ApiServer;
use tokio::sync::watch;

pub use platform::{AppDirs, PlatformError};

/// Startup failures of the binary.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid bind address {0:?}")]
    InvalidBindAddress(String),
    #[error("failed to listen: {0}")]
    Listen(#[source] std::io::Error),
    #[error("server error: {0}")]
    Server(#[source] std::io::Error),
}

/// Run the device until Ctrl-C.
pub async fn run(args: CliArgs) -> Result<(), AppError> {
    let dirs = AppDirs::resolve(args.config.as_deref())?;
    dirs.create_dirs()?;

    let mut config = Config::load_or_create(&dirs.config_dir)?;
    config.apply_cli_overrides(&args);

    let tap = config
        .logger
        .forward_to_clients
        .then(|| LogTap::new(config.logger.tap_capacity));
    init_logging(
        Some(&dirs.log_dir),
        config.logger.json_file,
        Some(&config),
        tap.clone(),
    );
    tracing::info!(
        "Starting '{}' (v{})",
        config.friendly_name(),
        env!("CARGO_PKG_VERSION")
    );
    tracing::debug!("Config directory: {}", dirs.config_dir.display());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let (ctx, demo) = device::build_context(&config, &dirs.config_dir, Arc::clone(&clock), tap)?;
    if ctx.psk.has_psk() {
        tracing::info!("Encryption enabled");
    }

    let scheduler = Scheduler::new(Arc::clone(&clock));
    device::start_demo(&scheduler, &demo, clock);

    let addr = device::listen_addr(&config)?;
    let server_config = device::server_config(&config);
    let listener = create_listener(addr, &server_config.socket).map_err(AppError::Listen)?;
    let mut server = ApiServer::new(Arc::new(ctx), server_config).with_scheduler(scheduler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::error!("Failed to listen for Ctrl-C: {e}");
                // Keep the sender alive so the server is not stopped.
                std::future::pending::<()>().await;
            }
        }
    });

    server.run(listener, shutdown_rx).await.map_err(AppError::Server)?;
    tracing::info!("Stopped");
    Ok(())
}
