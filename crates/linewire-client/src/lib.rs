//! linewire-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does linewire-client do? (for beginners)
//!
//! It keeps one TCP connection to a line-oriented server (IRC, SMTP-style
//! text protocols, or anything else that ends messages with `\r\n`) and
//! turns the incoming byte stream into a sequence of messages:
//!
//! 1. [`Connection::connect`] opens the socket and spawns a background
//!    receive task.
//! 2. The task splits incoming bytes into lines, runs each line through the
//!    connection's decoder, and offers the result to every registered
//!    listener.
//! 3. The application writes with [`Connection::send_line`] (or a cloned
//!    [`ConnectionSender`]) and eventually calls [`Connection::disconnect`].

/// Domain layer: configuration types.
pub mod domain;

/// Infrastructure layer: the TCP connection and config file loading.
pub mod infrastructure;

pub use domain::config::{ClientConfig, ConnectionConfig, ServerConfig};
pub use infrastructure::connection::{Connection, ConnectionError, ConnectionSender};
pub use infrastructure::storage::{load_config, parse_config, ConfigError};
