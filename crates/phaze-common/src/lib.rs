//! Shared utilities for PhazeVPN: logging, error types, tunnel plumbing.
//!
//! This crate provides common infrastructure used by the server and client.

#![forbid(unsafe_code)]

pub mod error;
pub mod helpers;
pub mod tunnel;

pub use error::{Error, Result};

/// Initialize tracing with a specific default level.
///
/// `RUST_LOG` still takes precedence when it is set.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
