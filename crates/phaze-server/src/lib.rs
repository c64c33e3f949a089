//! PhazeVPN server.
//!
//! - [`registry`]: provisioned clients and their password verifiers
//! - [`session`]: the live session table
//! - [`dispatcher`]: routes datagrams to handshakes and sessions (sans-I/O)
//! - [`limiter`]: per-IP handshake and traffic abuse limiter
//! - [`telemetry`]: counters and snapshots for monitoring
//! - [`admin`]: provisioning and telemetry HTTP API
//! - [`server`]: the UDP loop

pub mod admin;
pub mod config;
pub mod dispatcher;
pub mod limiter;
pub mod registry;
pub mod server;
pub mod session;
pub mod telemetry;

pub use config::{AddressPolicy, ConfigError, ServerConfig};
pub use dispatcher::{Delivery, Dispatcher, DropReason, Outcome, Reply};
pub use registry::{ClientIdentity, ClientInfo, ClientRegistry, RegistryError};
pub use server::PhazeServer;
pub use telemetry::{Telemetry, TelemetrySnapshot};
