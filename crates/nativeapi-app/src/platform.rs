//! Directory resolution for the device's config and log files.

use std::io;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "nativeapi";

/// Errors that can occur while resolving or creating directories.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The OS did not provide a configuration directory.
    #[error("could not determine OS configuration directory")]
    NoConfigDir,
    /// Directory creation failed.
    #[error("platform I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Where the device keeps `config.ron` and its JSON log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirs {
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl AppDirs {
    /// `<os config dir>/nativeapi`, unless `override_dir` is given.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::NoConfigDir`] if no override is given and the
    /// OS does not expose a configuration directory.
    pub fn resolve(override_dir: Option<&Path>) -> Result<Self, PlatformError> {
        match override_dir {
            Some(dir) => Ok(Self::with_root(dir)),
            None => {
                let base = dirs::config_dir().ok_or(PlatformError::NoConfigDir)?;
                Ok(Self::with_root(&base.join(APP_NAME)))
            }
        }
    }

    /// Config files directly in `root`, logs under `root/logs`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            config_dir: root.to_path_buf(),
            log_dir: root.join("logs"),
        }
    }

    /// Create both directories on disk.
    pub fn create_dirs(&self) -> Result<(), PlatformError> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}
