//! Device configuration for the native API server.
//!
//! Settings persist to disk as `config.ron`, can be overridden from the
//! command line, and are compared on reload so changes can be detected.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{ApiConfig, Config, DeviceConfig, ENCRYPTION_KEY_LEN, LoggerConfig};
pub use error::ConfigError;
