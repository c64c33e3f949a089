use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use phaze_core::ClientMode;
use phaze_crypto::ChannelConfig;
use zeroize::Zeroizing;

#[derive(Clone)]
pub struct ClientConfig {
    /// Server UDP address.
    pub server: SocketAddr,
    /// Local bind address.
    pub bind: SocketAddr,
    pub name: String,
    pub password: Zeroizing<Vec<u8>>,
    pub mode: ClientMode,
    /// Pre-shared carrier secret, required for ghost modes.
    pub obfuscation_secret: Option<Zeroizing<Vec<u8>>>,
    pub channel: ChannelConfig,
    /// Handshake transmissions before giving up.
    pub handshake_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub keepalive_interval: Duration,
    /// Silence from the server after which the session is considered dead.
    pub peer_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server: SocketAddr, name: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        let bind = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        Self {
            server,
            bind,
            name: name.into(),
            password: Zeroizing::new(password.into()),
            mode: ClientMode::Standard,
            obfuscation_secret: None,
            channel: ChannelConfig::default(),
            handshake_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            keepalive_interval: Duration::from_secs(25),
            peer_timeout: Duration::from_secs(90),
        }
    }

    /// Wait after the `attempt`-th transmission (1-based): doubles each
    /// time up to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server)
            .field("bind", &self.bind)
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .field("mode", &self.mode)
            .field(
                "obfuscation_secret",
                &self.obfuscation_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("handshake_attempts", &self.handshake_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("peer_timeout", &self.peer_timeout)
            .finish()
    }
}
