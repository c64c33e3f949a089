//! PhazeVPN client library.

pub mod config;
pub mod connection;

pub use config::ClientConfig;
pub use connection::{ClientError, Connection, ConnectionStats};
