//! Client side of a PhazeVPN session.
//!
//! [`Connection::connect`] runs the handshake with retransmission and
//! exponential backoff. Once established the connection moves tunnel
//! packets and answers the server's keepalive and rekey frames itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use phaze_core::{
    transport_for, CarrierError, ClientMode, Control, Datagram, KdfParams, ObfuscationKey, Packet,
    Transport, RECV_BUFFER_SIZE,
};
use phaze_crypto::{
    unix_millis, ChannelError, ClientHandshake, CryptoError, HandshakeError, HandshakeState,
    PasswordVerifier, SecureChannel,
};
use socket2::SockRef;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::ClientConfig;

const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// Upper bounds on the password hashing cost a server may ask for.
const MAX_KDF_MEMORY_KIB: u32 = 1024 * 1024;
const MAX_KDF_ITERATIONS: u32 = 16;
const MAX_KDF_LANES: u32 = 16;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("no handshake reply after {0} attempts (server unreachable or credentials rejected)")]
    HandshakeTimeout(u32),

    #[error("server requested password hashing parameters beyond local limits")]
    KdfTooExpensive,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Carrier(#[from] CarrierError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("session closed by server")]
    Closed,

    #[error("server silent for {0:?}")]
    PeerTimeout(Duration),

    #[error("background task failed: {0}")]
    Task(String),
}

impl ClientError {
    /// The error concerns one packet; the session is still usable.
    pub fn is_per_packet(&self) -> bool {
        matches!(self, ClientError::Channel(ChannelError::PayloadTooLarge(..)))
    }
}

/// Counters for an established connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub keepalives_sent: u64,
    /// Inbound frames that failed authentication or replay checks.
    pub rejected: u64,
    pub rekeys: u64,
    pub epoch: u64,
}

pub struct Connection {
    socket: UdpSocket,
    server: SocketAddr,
    transport: Arc<dyn Transport>,
    channel: SecureChannel,
    mode: ClientMode,
    config: ClientConfig,
    stats: ConnectionStats,
    established_at: Instant,
    last_received: Instant,
    closed: bool,
}

impl Connection {
    /// Authenticate to the server and open a secure channel.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let key = config
            .obfuscation_secret
            .as_ref()
            .map(|secret| ObfuscationKey::derive(secret))
            .transpose()?;
        let transport = transport_for(config.mode, key.as_ref())?;

        let socket = UdpSocket::bind(config.bind).await?;
        let sock = SockRef::from(&socket);
        if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
            debug!("failed to set receive buffer size: {}", e);
        }

        info!(
            "Connecting to {} as {} ({})",
            config.server, config.name, config.mode
        );
        let mut handshake = ClientHandshake::new(config.name.clone(), config.channel);
        let result = Self::handshake(&socket, transport.as_ref(), &config, &mut handshake).await;
        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                handshake.close();
                return Err(e);
            }
        };

        info!("Session {} established with {}", channel.session_id(), config.server);
        let now = Instant::now();
        Ok(Self {
            socket,
            server: config.server,
            transport,
            channel,
            mode: config.mode,
            config,
            stats: ConnectionStats::default(),
            established_at: now,
            last_received: now,
            closed: false,
        })
    }

    async fn handshake(
        socket: &UdpSocket,
        transport: &dyn Transport,
        config: &ClientConfig,
        handshake: &mut ClientHandshake,
    ) -> Result<SecureChannel, ClientError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        for attempt in 1..=config.handshake_attempts {
            let outbound = match handshake.confirm_datagram() {
                Some(confirm) => confirm.clone(),
                None => handshake.start(unix_millis())?,
            };
            send(socket, transport, config.server, &outbound).await?;
            debug!(
                "sent {:?} (attempt {}/{})",
                outbound.packet.packet_type(),
                attempt,
                config.handshake_attempts
            );

            let mut deadline = time::Instant::now() + config.backoff(attempt);
            loop {
                let (len, from) = match time::timeout_at(deadline, socket.recv_from(&mut buf)).await
                {
                    Ok(received) => received?,
                    Err(_) => break,
                };
                if from != config.server {
                    continue;
                }
                let Some(datagram) = decode(transport, &buf[..len]) else {
                    continue;
                };

                match &datagram.packet {
                    Packet::Response(body)
                        if handshake.state() == HandshakeState::AwaitingResponse =>
                    {
                        check_kdf(body.kdf)?;
                        let verifier =
                            derive_verifier(config.password.clone(), body.salt.clone(), body.kdf)
                                .await?;
                        let confirm =
                            handshake.on_response(datagram.header.session_id, body, &verifier)?;
                        send(socket, transport, config.server, &confirm).await?;
                        deadline = time::Instant::now() + config.backoff(attempt);
                    }
                    Packet::Response(_)
                        if handshake.session_id() == Some(datagram.header.session_id) =>
                    {
                        // Our confirm was lost; the server repeated its response.
                        if let Some(confirm) = handshake.confirm_datagram() {
                            send(socket, transport, config.server, confirm).await?;
                        }
                    }
                    Packet::Ack(body) => match handshake.on_ack(datagram.header.session_id, body) {
                        Ok(channel) => return Ok(channel),
                        Err(HandshakeError::AuthenticationFailed) => {
                            warn!("Server {} failed to prove our credentials", config.server);
                            return Err(HandshakeError::AuthenticationFailed.into());
                        }
                        Err(e) => debug!("ignoring ack: {}", e),
                    },
                    other => debug!("ignoring {:?} during handshake", other.packet_type()),
                }
            }
        }

        Err(ClientError::HandshakeTimeout(config.handshake_attempts))
    }

    pub fn session_id(&self) -> Uuid {
        self.channel.session_id()
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn mode(&self) -> ClientMode {
        self.mode
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            epoch: self.channel.epoch(),
            ..self.stats.clone()
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.config.keepalive_interval
    }

    /// Time since the session was established.
    pub fn uptime(&self) -> Duration {
        self.established_at.elapsed()
    }

    /// Encrypt and send one tunnel packet.
    pub async fn send(&mut self, packet: Vec<u8>) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.maybe_rekey().await?;
        let len = packet.len() as u64;
        self.seal_and_send(&Control::Payload(packet)).await?;
        self.stats.bytes_out += len;
        Ok(())
    }

    /// Wait for the next tunnel packet from the server.
    ///
    /// Keepalive and rekey frames are answered internally. Returns
    /// [`ClientError::Closed`] once the server tears the session down.
    /// Safe to use in `select!`: dropping the future can lose at most an
    /// automatic reply, which the server retransmits for.
    pub async fn recv(&mut self) -> Result<Vec<u8>, ClientError> {
        self.ensure_open()?;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.server {
                debug!("ignoring datagram from {}", from);
                continue;
            }
            let Some(datagram) = decode(self.transport.as_ref(), &buf[..len]) else {
                continue;
            };
            let Packet::Transport(frame) = &datagram.packet else {
                debug!("ignoring {:?} on established session", datagram.packet.packet_type());
                continue;
            };

            let received = match self.channel.open(&datagram.header, frame) {
                Ok(received) => received,
                Err(ChannelError::Rejected(reason)) => {
                    debug!("frame rejected: {:?}", reason);
                    self.stats.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.last_received = Instant::now();
            self.stats.frames_in += 1;
            if received.rekeyed {
                self.stats.rekeys += 1;
                info!("Session {} rekeyed to epoch {}", self.session_id(), self.channel.epoch());
            }
            if let Some(reply) = &received.reply {
                self.send_datagram(reply).await?;
            }

            match received.control {
                Control::Payload(packet) => {
                    self.stats.bytes_in += packet.len() as u64;
                    return Ok(packet);
                }
                Control::Teardown => {
                    info!("Session {} closed by server", self.session_id());
                    self.closed = true;
                    return Err(ClientError::Closed);
                }
                Control::Keepalive
                | Control::KeepaliveAck
                | Control::RekeyInit(_)
                | Control::RekeyResponse(_) => {}
            }
        }
    }

    /// Send a liveness probe, or fail if the server has gone quiet.
    ///
    /// Call every `keepalive_interval`; the ack is consumed by [`recv`](Self::recv).
    pub async fn keepalive(&mut self) -> Result<(), ClientError> {
        self.ensure_open()?;
        let silent = self.last_received.elapsed();
        if silent >= self.config.peer_timeout {
            warn!("No traffic from {} for {:?}", self.server, silent);
            return Err(ClientError::PeerTimeout(silent));
        }
        self.maybe_rekey().await?;
        self.seal_and_send(&Control::Keepalive).await?;
        self.stats.keepalives_sent += 1;
        Ok(())
    }

    /// Tell the server the session is over.
    pub async fn close(mut self) -> Result<ConnectionStats, ClientError> {
        if !self.closed {
            self.seal_and_send(&Control::Teardown).await?;
            self.closed = true;
            info!("Session {} closed", self.session_id());
        }
        Ok(self.stats())
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    async fn maybe_rekey(&mut self) -> Result<(), ClientError> {
        if self.channel.needs_rekey() {
            let init = self.channel.start_rekey();
            self.seal_and_send(&init).await?;
        }
        Ok(())
    }

    async fn seal_and_send(&mut self, control: &Control) -> Result<(), ClientError> {
        let datagram = self.channel.seal(control)?;
        self.send_datagram(&datagram).await
    }

    async fn send_datagram(&mut self, datagram: &Datagram) -> Result<(), ClientError> {
        let delay = self.transport.send_delay();
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        send(&self.socket, self.transport.as_ref(), self.server, datagram).await?;
        self.stats.frames_out += 1;
        Ok(())
    }
}

async fn send(
    socket: &UdpSocket,
    transport: &dyn Transport,
    server: SocketAddr,
    datagram: &Datagram,
) -> Result<(), ClientError> {
    let wire = transport.wrap(&datagram.encode())?;
    socket.send_to(&wire, server).await?;
    Ok(())
}

fn decode(transport: &dyn Transport, bytes: &[u8]) -> Option<Datagram> {
    let inner = match transport.unwrap(bytes) {
        Ok(inner) => inner,
        Err(e) => {
            debug!("carrier rejected datagram: {}", e);
            return None;
        }
    };
    match Datagram::decode(&inner) {
        Ok(datagram) => Some(datagram),
        Err(e) => {
            debug!("malformed datagram: {}", e);
            None
        }
    }
}

fn check_kdf(kdf: KdfParams) -> Result<(), ClientError> {
    if kdf.m_cost > MAX_KDF_MEMORY_KIB
        || kdf.t_cost > MAX_KDF_ITERATIONS
        || kdf.p_cost > MAX_KDF_LANES
    {
        return Err(ClientError::KdfTooExpensive);
    }
    Ok(())
}

/// Argon2 is deliberately slow; keep it off the runtime threads.
async fn derive_verifier(
    password: Zeroizing<Vec<u8>>,
    salt: Vec<u8>,
    kdf: KdfParams,
) -> Result<PasswordVerifier, ClientError> {
    tokio::task::spawn_blocking(move || PasswordVerifier::derive(&password, &salt, kdf))
        .await
        .map_err(|e| ClientError::Task(e.to_string()))?
        .map_err(ClientError::from)
}
