//! Domain layer: plain configuration types with no I/O.

pub mod config;

pub use config::{ClientConfig, ConnectionConfig, ServerConfig};
