//! Infrastructure layer: sockets and configuration files.

pub mod connection;
pub mod storage;
