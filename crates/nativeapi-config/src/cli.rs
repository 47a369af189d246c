//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Native API device command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "nativeapi", about = "Native API device server")]
pub struct CliArgs {
    /// Device name.
    #[arg(long)]
    pub name: Option<String>,

    /// Listen port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Connection password.
    #[arg(long)]
    pub password: Option<String>,

    /// Base64 encryption key; enables the encrypted protocol.
    #[arg(long)]
    pub encryption_key: Option<String>,

    /// Log filter (error, warn, info, debug, trace, or RUST_LOG directives).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref name) = args.name {
            self.device.name = name.clone();
        }
        if let Some(port) = args.port {
            self.api.port = port;
        }
        if let Some(ref password) = args.password {
            self.api.password = password.clone();
        }
        if let Some(ref key) = args.encryption_key {
            self.api.encryption_key = Some(key.clone());
        }
        if let Some(ref level) = args.log_level {
            self.logger.level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            name: Some("kitchen".to_string()),
            port: Some(7000),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.device.name, "kitchen");
        assert_eq!(config.api.port, 7000);
        // Non-overridden fields retain defaults
        assert!(config.api.password.is_empty());
        assert_eq!(config.logger.level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "nativeapi",
            "--password",
            "secret",
            "--log-level",
            "debug",
            "--config",
            "/tmp/device",
        ]);
        assert_eq!(args.password.as_deref(), Some("secret"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/device")));
    }
}
