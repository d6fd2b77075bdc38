//! Client configuration types.
//!
//! [`ClientConfig`] is the single source of truth for runtime settings.  It
//! is a plain serde struct: reading it from disk is the job of
//! [`crate::infrastructure::storage`], and the CLI may override individual
//! fields afterwards.
//!
//! Every field has a serde default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! log_level = "info"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 6667
//!
//! [connection]
//! connect_timeout_secs = 10
//! read_buffer_size = 4096
//! max_line_length = 65536
//! read_timeout_secs = 0      # 0 disables the read timeout
//! nodelay = true
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use linewire_core::protocol::framing::DEFAULT_MAX_LINE_LENGTH;

/// Top-level configuration for the `linewire` binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Remote endpoint.
    #[serde(default)]
    pub server: ServerConfig,
    /// Socket and receive-loop tuning.
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Remote endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Host name or IP address.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Settings applied to every [`crate::Connection`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use linewire_client::ConnectionConfig;
///
/// let cfg = ConnectionConfig::default();
/// assert_eq!(cfg.read_buffer_size, 4096);
/// assert_eq!(cfg.connect_timeout(), Duration::from_secs(10));
/// assert_eq!(cfg.read_timeout(), None);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Seconds to wait for the TCP handshake.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Size of each `read()` buffer in the receive loop.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Longest accepted line, in bytes, before it is discarded.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Seconds of read inactivity after which the connection is dropped.
    /// `0` waits forever.
    #[serde(default)]
    pub read_timeout_secs: u64,
    /// Disable Nagle's algorithm on the socket.
    #[serde(default = "default_true")]
    pub nodelay: bool,
}

impl ConnectionConfig {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read timeout, or `None` when reads may block indefinitely.
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }

    /// Checks values serde cannot reject on its own.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.read_buffer_size == 0 {
            return Err("connection.read_buffer_size must be greater than zero".to_string());
        }
        if self.max_line_length == 0 {
            return Err("connection.max_line_length must be greater than zero".to_string());
        }
        Ok(())
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6667
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_read_buffer_size() -> usize {
    4096
}
fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}
fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            read_buffer_size: default_read_buffer_size(),
            max_line_length: default_max_line_length(),
            read_timeout_secs: 0,
            nodelay: default_true(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
