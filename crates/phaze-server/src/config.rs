//! Server configuration.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use phaze_core::CarrierError;
use phaze_crypto::{ChannelConfig, ReplayWindow};
use thiserror::Error;

/// How a session reacts to authenticated frames from a new source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressPolicy {
    /// The session id is authoritative; after a frame authenticates the
    /// session follows the new address (NAT rebinding, roaming).
    #[default]
    Rebind,
    /// Frames must come from the address that completed the handshake.
    Pin,
}

impl fmt::Display for AddressPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressPolicy::Rebind => f.write_str("rebind"),
            AddressPolicy::Pin => f.write_str("pin"),
        }
    }
}

impl FromStr for AddressPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rebind" => Ok(AddressPolicy::Rebind),
            "pin" => Ok(AddressPolicy::Pin),
            other => Err(format!("unknown address policy: {}", other)),
        }
    }
}

/// A configuration the server cannot run with.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("replay window must be within 1..={max}, got {0}", max = ReplayWindow::MAX_WINDOW_SIZE)]
    ReplayWindow(u64),

    #[error("replay forward tolerance must be non-zero")]
    ForwardTolerance,

    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("obfuscation secret: {0}")]
    Carrier(#[from] CarrierError),
}

/// Runtime configuration for [`crate::PhazeServer`] and the dispatcher.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP listen address.
    pub listen: SocketAddr,
    /// Maximum number of sessions (half-open included).
    pub max_sessions: usize,
    /// Maximum half-open handshakes per source IP.
    pub max_half_open_per_ip: usize,
    /// Maximum half-open handshakes overall.
    pub max_half_open: usize,
    /// Maximum established sessions per source IP.
    pub max_sessions_per_ip: usize,
    /// Authenticated inbound bytes per second an IP may sustain; twice this
    /// within one second bans the IP for `ban_duration`.
    pub max_bytes_per_sec: u64,
    /// Half-open handshakes older than this are discarded.
    pub handshake_timeout: Duration,
    /// Quiet time after which the server probes the client.
    pub keepalive_interval: Duration,
    /// Quiet time after which a session is torn down.
    pub idle_timeout: Duration,
    /// Period of the expiry sweep.
    pub sweep_interval: Duration,
    /// Handshake attempts allowed per IP within `handshake_window`.
    pub handshake_attempts: usize,
    pub handshake_window: Duration,
    /// Ban applied to an IP that exceeds `handshake_attempts` or floods.
    pub ban_duration: Duration,
    /// Rekey thresholds and replay window.
    pub channel: ChannelConfig,
    pub address_policy: AddressPolicy,
    /// Datagrams processed concurrently.
    pub workers: usize,
    /// Pre-shared secret for ghost-mode clients.
    pub obfuscation_secret: Option<Vec<u8>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 51820)),
            max_sessions: 4096,
            max_half_open_per_ip: 4,
            max_half_open: 256,
            max_sessions_per_ip: 3,
            max_bytes_per_sec: 25 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(5),
            handshake_attempts: 5,
            handshake_window: Duration::from_secs(60),
            ban_duration: Duration::from_secs(3600),
            channel: ChannelConfig::default(),
            address_policy: AddressPolicy::Rebind,
            workers: 64,
            obfuscation_secret: None,
        }
    }
}

impl ServerConfig {
    /// Reject values that would make the dispatcher misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let window = self.channel.window_size;
        if window == 0 || window > ReplayWindow::MAX_WINDOW_SIZE {
            return Err(ConfigError::ReplayWindow(window));
        }
        if self.channel.forward_tolerance == 0 {
            return Err(ConfigError::ForwardTolerance);
        }
        let limits = [
            ("max_sessions", self.max_sessions),
            ("max_half_open", self.max_half_open),
            ("max_half_open_per_ip", self.max_half_open_per_ip),
            ("max_sessions_per_ip", self.max_sessions_per_ip),
            ("workers", self.workers),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.max_bytes_per_sec == 0 {
            return Err(ConfigError::Zero("max_bytes_per_sec"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Zero("sweep_interval"));
        }
        Ok(())
    }
}
