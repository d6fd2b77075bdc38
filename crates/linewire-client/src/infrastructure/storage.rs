//! TOML configuration loading.
//!
//! A missing file is not an error: the client runs on defaults until one is
//! written.  Anything else (unreadable file, malformed TOML, out-of-range
//! values) is reported through [`ConfigError`].

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::domain::config::ClientConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The TOML parsed but a value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Parses and validates a TOML document.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] for malformed TOML and
/// [`ConfigError::Invalid`] for out-of-range values.
pub fn parse_config(content: &str) -> Result<ClientConfig, ConfigError> {
    let cfg: ClientConfig = toml::from_str(content)?;
    cfg.connection.validate().map_err(ConfigError::Invalid)?;
    Ok(cfg)
}

/// Loads [`ClientConfig`] from `path`, returning the defaults if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and the errors of [`parse_config`] for bad content.
pub fn load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no config at {}; using defaults", path.display());
            Ok(ClientConfig::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
