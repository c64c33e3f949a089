//! Datagram dispatcher.
//!
//! Sans-I/O core of the server: takes raw datagrams and tunnel packets in,
//! hands back what must be sent and what must be delivered to the tunnel
//! device. The UDP loop in [`crate::server`] only moves bytes.
//!
//! Inbound order of checks:
//! 1. Size, then plain decode; if that fails and an obfuscation secret is
//!    configured, carrier unwrap and decode of the inner datagram.
//! 2. `HandshakeInit` is routed by `(source IP, client ephemeral)` so a
//!    retransmission reaches the existing half-open session; otherwise it
//!    passes the per-IP limiter and the registry before any session state
//!    is created. Copies of one init racing on parallel workers all get
//!    the response of whichever copy was inserted first.
//! 3. `HandshakeConfirm` and transport frames are routed by session id.
//!    A confirm is checked against the client's current registry entry, so
//!    a revocation or password rotation since the init fails it. Under
//!    [`AddressPolicy::Rebind`] a frame from a new address moves the
//!    session once it authenticates; under [`AddressPolicy::Pin`] it is
//!    dropped before decryption. Frames from a banned IP are dropped before
//!    decryption, and authenticated bytes count toward the per-IP traffic
//!    ban.
//!
//! Every failure is a [`DropReason`]; nothing is ever sent back for one.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use phaze_core::ip::{packet_destination, packet_source};
use phaze_core::{
    transport_for, CarrierError, Control, Datagram, Header, HandshakeConfirm, HandshakeInit,
    ObfuscatedTransport, ObfuscationKey, ObfuscationProfile, Packet, PacketType, Transport,
    TransportFrame, RECV_BUFFER_SIZE,
};
use phaze_crypto::{unix_millis, ChannelError, HandshakeError, ServerHandshake};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AddressPolicy, ConfigError, ServerConfig};
use crate::limiter::AbuseLimiter;
use crate::registry::ClientRegistry;
use crate::session::{
    HalfOpenSlot, PeerSession, PeerState, SessionError, SessionHandle, SessionLimits,
    SessionTable,
};
use crate::telemetry::{Telemetry, TelemetrySnapshot};

/// A datagram to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub addr: SocketAddr,
    pub bytes: Vec<u8>,
    /// Send jitter required by the client's transport.
    pub delay: Duration,
}

/// A decrypted tunnel packet for the local device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub session_id: Uuid,
    pub client_name: String,
    pub packet: Vec<u8>,
}

/// Result of handling one inbound datagram.
#[derive(Debug, Default)]
pub struct Outcome {
    pub replies: Vec<Reply>,
    pub deliveries: Vec<Delivery>,
}

impl Outcome {
    fn reply(reply: Reply) -> Self {
        Self {
            replies: vec![reply],
            deliveries: Vec::new(),
        }
    }
}

/// Why a datagram was discarded. Logged and counted, never answered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DropReason {
    #[error("malformed datagram")]
    Malformed,
    #[error("carrier rejected")]
    Carrier,
    #[error("unexpected {0:?}")]
    Unexpected(PacketType),
    #[error("handshake rate limited")]
    RateLimited,
    #[error("unknown or revoked client")]
    UnknownClient,
    #[error("stale handshake timestamp")]
    StaleHandshake,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error(transparent)]
    Resource(#[from] SessionError),
    #[error("unknown session")]
    UnknownSession,
    #[error("frame rejected")]
    Rejected,
    #[error("transport does not match client policy")]
    WrongTransport,
    #[error("frame from unexpected address {0}")]
    AddressMismatch(SocketAddr),
    #[error("tunnel packet with foreign source address")]
    SpoofedSource,
    #[error("session expired")]
    SessionExpired,
    #[error("no session routes {0}")]
    NoRoute(IpAddr),
    #[error("payload too large")]
    PayloadTooLarge,
}

impl From<CarrierError> for DropReason {
    fn from(_: CarrierError) -> Self {
        DropReason::Carrier
    }
}

/// Routes datagrams to sessions. One per server.
pub struct Dispatcher {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    sessions: SessionTable,
    limiter: Mutex<AbuseLimiter>,
    telemetry: Arc<Telemetry>,
    obfuscation: Option<ObfuscationKey>,
    /// Used only to unwrap inbound carrier datagrams; the profile does not
    /// matter for unwrapping.
    carrier: Option<ObfuscatedTransport>,
}

impl Dispatcher {
    pub fn new(config: ServerConfig, registry: Arc<ClientRegistry>) -> Result<Self, ConfigError> {
        config.validate()?;
        let obfuscation = config
            .obfuscation_secret
            .as_deref()
            .map(ObfuscationKey::derive)
            .transpose()?;
        let carrier = obfuscation.as_ref().and_then(|key| {
            ObfuscationProfile::for_mode(phaze_core::ClientMode::SemiGhost)
                .map(|profile| ObfuscatedTransport::new(key, profile))
        });

        let sessions = SessionTable::new(SessionLimits {
            max_sessions: config.max_sessions,
            max_half_open: config.max_half_open,
            max_half_open_per_ip: config.max_half_open_per_ip,
            max_sessions_per_ip: config.max_sessions_per_ip,
        });
        let limiter = AbuseLimiter::new(
            config.handshake_attempts,
            config.handshake_window,
            config.ban_duration,
            config.max_bytes_per_sec,
        );

        Ok(Self {
            config,
            registry,
            sessions,
            limiter: Mutex::new(limiter),
            telemetry: Arc::new(Telemetry::new()),
            obfuscation,
            carrier,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// `(established, half_open)` session counts.
    pub async fn session_counts(&self) -> (usize, usize) {
        self.sessions.counts().await
    }

    pub async fn snapshot(&self) -> TelemetrySnapshot {
        let (_, half_open) = self.sessions.counts().await;
        let sessions = self.sessions.session_infos().await;
        self.telemetry.snapshot(half_open, sessions)
    }

    /// Process one datagram received from `src`.
    pub async fn handle_datagram(
        &self,
        datagram: &[u8],
        src: SocketAddr,
    ) -> Result<Outcome, DropReason> {
        let result = self.dispatch(datagram, src).await;
        if let Err(reason) = &result {
            self.account(reason);
        }
        result
    }

    async fn dispatch(&self, bytes: &[u8], src: SocketAddr) -> Result<Outcome, DropReason> {
        let (datagram, obfuscated) = self.decode(bytes)?;
        let Datagram { header, packet } = datagram;

        match packet {
            Packet::Init(init) => self.handle_init(&init, src, obfuscated).await,
            Packet::Confirm(confirm) => {
                self.handle_confirm(&header, &confirm, src, obfuscated)
                    .await
            }
            Packet::Transport(frame) => {
                self.handle_transport(&header, &frame, src, obfuscated)
                    .await
            }
            other => Err(DropReason::Unexpected(other.packet_type())),
        }
    }

    /// Plain framing first, then the carrier.
    fn decode(&self, bytes: &[u8]) -> Result<(Datagram, bool), DropReason> {
        if bytes.len() > RECV_BUFFER_SIZE {
            return Err(DropReason::Malformed);
        }
        if Header::quick_check(bytes) {
            if let Ok(datagram) = Datagram::decode(bytes) {
                return Ok((datagram, false));
            }
        }

        let Some(carrier) = &self.carrier else {
            return Err(DropReason::Malformed);
        };
        let inner = carrier.unwrap(bytes)?;
        let datagram = Datagram::decode(&inner).map_err(|_| DropReason::Carrier)?;
        Ok((datagram, true))
    }

    async fn handle_init(
        &self,
        init: &HandshakeInit,
        src: SocketAddr,
        obfuscated: bool,
    ) -> Result<Outcome, DropReason> {
        if let Some(handle) = self.sessions.find_half_open(src.ip(), &init.ephemeral).await {
            return resend_response(&handle, src, obfuscated).await;
        }

        if !self.limiter.lock().await.check(src.ip()) {
            return Err(DropReason::RateLimited);
        }

        let identity = self
            .registry
            .lookup(&init.client_name)
            .filter(|identity| identity.is_active())
            .ok_or(DropReason::UnknownClient)?;
        if identity.mode.is_ghost() != obfuscated {
            return Err(DropReason::WrongTransport);
        }
        let credentials = identity
            .credentials()
            .map_err(|_| DropReason::UnknownClient)?;
        let transport = transport_for(identity.mode, self.obfuscation.as_ref())
            .map_err(|_| DropReason::WrongTransport)?;

        let session_id = Uuid::new_v4();
        let (handshake, response) = ServerHandshake::respond(
            init,
            session_id,
            &credentials,
            unix_millis(),
            self.config.channel,
        )
        .map_err(|e| match e {
            HandshakeError::StaleTimestamp => DropReason::StaleHandshake,
            _ => DropReason::AuthenticationFailed,
        })?;

        let response = response.encode();
        let reply = wrap(transport.as_ref(), src, &response)?;
        let now = Instant::now();
        let session = PeerSession {
            session_id,
            client_name: identity.name.clone(),
            mode: identity.mode,
            transport,
            remote: src,
            state: PeerState::HalfOpen {
                handshake,
                response,
            },
            created_at: now,
            established_at: None,
            last_activity: now,
            last_probe: None,
            tunnel_address: None,
            counters: Arc::default(),
            client_counters: self.telemetry.client_counters(&identity.name),
        };

        match self.sessions.insert_half_open(session, init.ephemeral).await {
            Ok(HalfOpenSlot::Inserted(_)) => {}
            Ok(HalfOpenSlot::Existing(handle)) => {
                return resend_response(&handle, src, obfuscated).await;
            }
            Err(e) => {
                warn!("Dropping handshake from {}: {}", src, e);
                return Err(e.into());
            }
        }

        Telemetry::incr(&self.telemetry.handshakes_started);
        debug!(
            "Handshake {} started for {} from {}",
            session_id, identity.name, src
        );
        Ok(Outcome::reply(reply))
    }

    async fn handle_confirm(
        &self,
        header: &Header,
        confirm: &HandshakeConfirm,
        src: SocketAddr,
        obfuscated: bool,
    ) -> Result<Outcome, DropReason> {
        let session_id = header.session_id;
        let handle = self
            .sessions
            .get(&session_id)
            .await
            .ok_or(DropReason::UnknownSession)?;
        let mut session = handle.lock().await;

        if session.transport.is_obfuscated() != obfuscated {
            return Err(DropReason::WrongTransport);
        }

        let remote = session.remote;
        let transport = session.transport.clone();
        let client_name = session.client_name.clone();
        let expired = session.created_at.elapsed() >= self.config.handshake_timeout;

        let result = match &mut session.state {
            PeerState::Established {
                ack, confirm_proof, ..
            } => {
                if *confirm_proof == confirm.proof && remote == src {
                    debug!("Retransmitted confirm from {}, resending ack", src);
                    return Ok(Outcome::reply(wrap(transport.as_ref(), src, ack)?));
                }
                return Err(DropReason::Unexpected(PacketType::HandshakeConfirm));
            }
            PeerState::HalfOpen { handshake, .. } => {
                if src.ip() != remote.ip() {
                    return Err(DropReason::AddressMismatch(src));
                }
                if expired {
                    handshake.close();
                    Err(DropReason::HandshakeTimeout)
                } else if !self.registry.authenticate(&client_name, handshake) {
                    debug!("Credentials of {} changed during handshake", client_name);
                    handshake.close();
                    Err(DropReason::AuthenticationFailed)
                } else {
                    handshake.on_confirm(confirm).map_err(|e| {
                        debug!(
                            "Handshake {} for {} from {} failed: {}",
                            session_id, client_name, src, e
                        );
                        DropReason::AuthenticationFailed
                    })
                }
            }
        };

        let (channel, ack) = match result {
            Ok(established) => established,
            Err(reason) => {
                drop(session);
                self.sessions.remove(&session_id).await;
                return Err(reason);
            }
        };

        // The client may have been revoked while the proof was checked.
        let Some(identity) = self
            .registry
            .lookup(&client_name)
            .filter(|identity| identity.is_active())
        else {
            drop(session);
            self.sessions.remove(&session_id).await;
            return Err(DropReason::UnknownClient);
        };

        let ack = ack.encode();
        let reply = wrap(transport.as_ref(), src, &ack)?;
        let now = Instant::now();
        session.state = PeerState::Established {
            channel: Box::new(channel),
            ack,
            confirm_proof: confirm.proof,
        };
        session.remote = src;
        session.established_at = Some(now);
        session.last_activity = now;
        session.tunnel_address = identity.tunnel_address;
        let mode = session.mode;
        drop(session);

        // Superseded sessions go first so they do not count against the
        // per-IP cap.
        self.replace_older(&client_name, session_id, src).await;
        if let Err(e) = self
            .sessions
            .promote(session_id, src.ip(), identity.tunnel_address)
            .await
        {
            warn!("Refusing session for {} from {}: {}", client_name, src, e);
            self.sessions.remove(&session_id).await;
            return Err(e.into());
        }
        Telemetry::incr(&self.telemetry.handshakes_completed);
        info!(
            "Session {} established for {} from {} (mode {})",
            session_id, client_name, src, mode
        );
        Ok(Outcome::reply(reply))
    }

    /// A re-authenticated client supersedes its older sessions from the
    /// same address.
    async fn replace_older(&self, client_name: &str, current: Uuid, src: SocketAddr) {
        for (session_id, handle) in self.sessions.for_client(client_name).await {
            if session_id == current {
                continue;
            }
            let stale = {
                let session = handle.lock().await;
                session.is_established() && session.remote == src
            };
            if stale && self.sessions.remove(&session_id).await.is_some() {
                Telemetry::incr(&self.telemetry.sessions_closed);
                info!("Session {} replaced by {}", session_id, current);
            }
        }
    }

    async fn handle_transport(
        &self,
        header: &Header,
        frame: &TransportFrame,
        src: SocketAddr,
        obfuscated: bool,
    ) -> Result<Outcome, DropReason> {
        let session_id = header.session_id;
        if self.limiter.lock().await.is_banned(src.ip()) {
            return Err(DropReason::RateLimited);
        }
        let handle = self
            .sessions
            .get(&session_id)
            .await
            .ok_or(DropReason::UnknownSession)?;
        let mut session = handle.lock().await;

        if session.transport.is_obfuscated() != obfuscated {
            return Err(DropReason::WrongTransport);
        }
        if self.config.address_policy == AddressPolicy::Pin && session.remote != src {
            return Err(DropReason::AddressMismatch(src));
        }
        let Some(channel) = session.channel_mut() else {
            return Err(DropReason::Unexpected(PacketType::Transport));
        };

        let received = match channel.open(header, frame) {
            Ok(received) => received,
            Err(ChannelError::Rejected(reason)) => {
                self.telemetry.record_rejection(reason);
                return Err(DropReason::Rejected);
            }
            Err(e) if e.is_fatal() => {
                warn!("Session {} cannot continue: {}", session_id, e);
                drop(session);
                self.close(&session_id).await;
                return Err(DropReason::SessionExpired);
            }
            Err(_) => return Err(DropReason::Rejected),
        };
        let epoch = channel.epoch();

        session.last_activity = Instant::now();
        if session.remote != src {
            info!(
                "Session {} rebound from {} to {}",
                session_id, session.remote, src
            );
            session.remote = src;
        }
        session.record_in(frame.ciphertext.len());
        Telemetry::incr(&self.telemetry.frames_in);
        let bytes = frame.ciphertext.len() as u64;
        if !self.limiter.lock().await.record_traffic(src.ip(), bytes) {
            return Err(DropReason::RateLimited);
        }

        if received.rekeyed {
            Telemetry::incr(&self.telemetry.rekeys);
            info!("Session {} rekeyed (epoch {})", session_id, epoch);
        }

        let mut outcome = Outcome::default();
        if let Some(reply) = &received.reply {
            let reply = wrap(session.transport.as_ref(), src, &reply.encode())?;
            session.record_out(reply.bytes.len());
            Telemetry::incr(&self.telemetry.frames_out);
            outcome.replies.push(reply);
        }

        match received.control {
            Control::Payload(packet) if !packet.is_empty() => {
                if let Some(assigned) = session.tunnel_address {
                    if packet_source(&packet) != Some(assigned) {
                        return Err(DropReason::SpoofedSource);
                    }
                }
                outcome.deliveries.push(Delivery {
                    session_id,
                    client_name: session.client_name.clone(),
                    packet,
                });
            }
            Control::Teardown => {
                info!(
                    "Session {} closed by {} ({})",
                    session_id, session.client_name, src
                );
                drop(session);
                self.close(&session_id).await;
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Seal a tunnel packet for the session that owns its destination.
    pub async fn route_outbound(&self, packet: &[u8]) -> Result<Vec<Reply>, DropReason> {
        let destination = packet_destination(packet).ok_or(DropReason::Malformed)?;
        let handle = self
            .sessions
            .route(destination)
            .await
            .ok_or(DropReason::NoRoute(destination))?;
        let mut session = handle.lock().await;
        let session_id = session.session_id;
        let Some(channel) = session.channel_mut() else {
            return Err(DropReason::NoRoute(destination));
        };

        let mut datagrams = Vec::with_capacity(2);
        match channel.seal(&Control::Payload(packet.to_vec())) {
            Ok(datagram) => datagrams.push(datagram),
            Err(ChannelError::PayloadTooLarge(..)) => return Err(DropReason::PayloadTooLarge),
            Err(e) => {
                warn!("Session {} cannot continue: {}", session_id, e);
                drop(session);
                self.close(&session_id).await;
                return Err(DropReason::SessionExpired);
            }
        }
        if channel.needs_rekey() && !channel.rekey_pending() {
            let control = channel.start_rekey();
            if let Ok(datagram) = channel.seal(&control) {
                datagrams.push(datagram);
            }
        }

        let mut replies = Vec::with_capacity(datagrams.len());
        for datagram in datagrams {
            let reply = wrap(session.transport.as_ref(), session.remote, &datagram.encode())?;
            session.record_out(reply.bytes.len());
            Telemetry::incr(&self.telemetry.frames_out);
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Expire stale sessions, probe quiet ones and drive rekeys. Also
    /// reloads the registry if another process changed it and tears down
    /// sessions whose client was revoked or moved to another mode.
    pub async fn sweep(&self) -> Vec<Reply> {
        if let Err(e) = self.registry.refresh() {
            warn!("Registry reload failed: {}", e);
        }

        let now = Instant::now();
        let mut replies = Vec::new();
        let mut timed_out = Vec::new();
        let mut idle = Vec::new();
        let mut withdrawn = Vec::new();

        for (session_id, handle) in self.sessions.all().await {
            let mut session = handle.lock().await;

            if session.is_established()
                && !self.registry.permits(&session.client_name, session.mode)
            {
                withdrawn.push((session_id, session.client_name.clone()));
                drop(session);
                if let Some(reply) = teardown(&handle).await {
                    replies.push(reply);
                }
                continue;
            }

            if !session.is_established() {
                if now.saturating_duration_since(session.created_at)
                    >= self.config.handshake_timeout
                {
                    timed_out.push(session_id);
                }
                continue;
            }

            let quiet = now.saturating_duration_since(session.last_activity);
            if quiet >= self.config.idle_timeout {
                idle.push(session_id);
                continue;
            }

            let keepalive = self.config.keepalive_interval;
            let probe = quiet >= keepalive
                && session
                    .last_probe
                    .map_or(true, |last| now.saturating_duration_since(last) >= keepalive);
            if probe {
                session.last_probe = Some(now);
            }

            let Some(channel) = session.channel_mut() else {
                continue;
            };
            let mut controls = Vec::new();
            if probe {
                controls.push(Control::Keepalive);
            }
            if channel.needs_rekey_at(now) {
                controls.push(channel.start_rekey());
            }

            let mut sealed = Vec::with_capacity(controls.len());
            for control in &controls {
                match channel.seal(control) {
                    Ok(datagram) => sealed.push(datagram),
                    Err(e) => {
                        warn!("Session {} cannot continue: {}", session_id, e);
                        idle.push(session_id);
                        break;
                    }
                }
            }

            for datagram in sealed {
                if let Ok(reply) =
                    wrap(session.transport.as_ref(), session.remote, &datagram.encode())
                {
                    session.record_out(reply.bytes.len());
                    replies.push(reply);
                }
            }
        }

        for session_id in timed_out {
            if self.sessions.remove(&session_id).await.is_some() {
                Telemetry::incr(&self.telemetry.handshakes_timed_out);
                debug!("Half-open session {} timed out", session_id);
            }
        }
        for session_id in idle {
            if self.close(&session_id).await {
                info!("Session {} expired", session_id);
            }
        }
        for (session_id, client_name) in withdrawn {
            if self.close(&session_id).await {
                info!(
                    "Session {} of {} closed after a registry change",
                    session_id, client_name
                );
            }
        }

        let cleared = self.limiter.lock().await.cleanup();
        if cleared > 0 {
            debug!("Cleared {} limiter entries", cleared);
        }
        replies
    }

    /// Tear down every session of a client, e.g. after revocation.
    pub async fn disconnect_client(&self, client_name: &str) -> Vec<Reply> {
        let mut replies = Vec::new();
        for (session_id, handle) in self.sessions.for_client(client_name).await {
            if let Some(reply) = teardown(&handle).await {
                replies.push(reply);
            }
            if self.close(&session_id).await {
                info!("Session {} of {} disconnected", session_id, client_name);
            }
        }
        replies
    }

    /// Remove all sessions, returning a teardown frame for each established
    /// one. Key material is wiped as the sessions drop.
    pub async fn shutdown(&self) -> Vec<Reply> {
        let sessions = self.sessions.drain().await;
        let mut replies = Vec::with_capacity(sessions.len());
        for handle in &sessions {
            if let Some(reply) = teardown(handle).await {
                replies.push(reply);
            }
        }
        info!("Dropped {} sessions on shutdown", sessions.len());
        replies
    }

    async fn close(&self, session_id: &Uuid) -> bool {
        let removed = self.sessions.remove(session_id).await.is_some();
        if removed {
            Telemetry::incr(&self.telemetry.sessions_closed);
        }
        removed
    }

    fn account(&self, reason: &DropReason) {
        let telemetry = &self.telemetry;
        match reason {
            DropReason::Malformed | DropReason::Unexpected(_) | DropReason::PayloadTooLarge => {
                Telemetry::incr(&telemetry.malformed)
            }
            DropReason::Carrier | DropReason::WrongTransport => {
                Telemetry::incr(&telemetry.carrier_drops)
            }
            DropReason::RateLimited => Telemetry::incr(&telemetry.rate_limited),
            DropReason::UnknownClient
            | DropReason::StaleHandshake
            | DropReason::AuthenticationFailed => Telemetry::incr(&telemetry.handshakes_failed),
            DropReason::HandshakeTimeout => Telemetry::incr(&telemetry.handshakes_timed_out),
            DropReason::Resource(_) => Telemetry::incr(&telemetry.resource_drops),
            _ => {}
        }
    }
}

fn wrap(transport: &dyn Transport, addr: SocketAddr, frame: &[u8]) -> Result<Reply, DropReason> {
    Ok(Reply {
        addr,
        bytes: transport.wrap(frame)?,
        delay: transport.send_delay(),
    })
}

/// Cached `HandshakeResponse` for a repeated init from the same address and
/// framing.
async fn resend_response(
    handle: &SessionHandle,
    src: SocketAddr,
    obfuscated: bool,
) -> Result<Outcome, DropReason> {
    let session = handle.lock().await;
    match &session.state {
        PeerState::HalfOpen { response, .. }
            if session.remote == src && session.transport.is_obfuscated() == obfuscated =>
        {
            debug!("Retransmitted init from {}, resending response", src);
            Ok(Outcome::reply(wrap(
                session.transport.as_ref(),
                src,
                response,
            )?))
        }
        _ => Err(DropReason::Unexpected(PacketType::HandshakeInit)),
    }
}

async fn teardown(handle: &SessionHandle) -> Option<Reply> {
    let mut session = handle.lock().await;
    let transport = session.transport.clone();
    let remote = session.remote;
    let datagram = session.channel_mut()?.seal(&Control::Teardown).ok()?;
    wrap(transport.as_ref(), remote, &datagram.encode()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaze_core::{ClientMode, KdfParams};
    use phaze_crypto::{ChannelConfig, ClientHandshake, PasswordVerifier, SecureChannel};

    const CHEAP: KdfParams = KdfParams {
        m_cost: 8,
        t_cost: 1,
        p_cost: 1,
    };

    fn dispatcher(config: ServerConfig) -> Dispatcher {
        let registry = Arc::new(ClientRegistry::new(CHEAP));
        registry
            .register("alice", b"alice password", ClientMode::Standard)
            .unwrap();
        Dispatcher::new(config, registry).unwrap()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn single(outcome: Outcome) -> Datagram {
        assert_eq!(outcome.replies.len(), 1);
        Datagram::decode(&outcome.replies[0].bytes).unwrap()
    }

    async fn connect(dispatcher: &Dispatcher, src: SocketAddr) -> SecureChannel {
        let mut client = ClientHandshake::new("alice", ChannelConfig::default());
        let init = client.start(unix_millis()).unwrap();
        let response = single(dispatcher.handle_datagram(&init.encode(), src).await.unwrap());
        let Packet::Response(body) = &response.packet else {
            panic!("expected response");
        };
        let verifier = PasswordVerifier::derive(b"alice password", &body.salt, body.kdf).unwrap();
        let confirm = client
            .on_response(response.header.session_id, body, &verifier)
            .unwrap();
        let ack = single(dispatcher.handle_datagram(&confirm.encode(), src).await.unwrap());
        let Packet::Ack(body) = &ack.packet else {
            panic!("expected ack");
        };
        client.on_ack(ack.header.session_id, body).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_and_delivery() {
        let dispatcher = dispatcher(ServerConfig::default());
        let src = addr("192.0.2.10:40000");
        let mut channel = connect(&dispatcher, src).await;
        assert_eq!(dispatcher.session_counts().await, (1, 0));

        let frame = channel.seal(&Control::Payload(vec![0x45; 40])).unwrap();
        let outcome = dispatcher.handle_datagram(&frame.encode(), src).await.unwrap();
        assert!(outcome.replies.is_empty());
        assert_eq!(outcome.deliveries.len(), 1);
        assert_eq!(outcome.deliveries[0].client_name, "alice");

        // Replay of the same frame is dropped.
        assert_eq!(
            dispatcher.handle_datagram(&frame.encode(), src).await.unwrap_err(),
            DropReason::Rejected
        );
        assert_eq!(dispatcher.snapshot().await.replays, 1);
    }

    #[tokio::test]
    async fn test_unknown_client_gets_nothing() {
        let dispatcher = dispatcher(ServerConfig::default());
        let mut client = ClientHandshake::new("mallory", ChannelConfig::default());
        let init = client.start(unix_millis()).unwrap();
        assert_eq!(
            dispatcher
                .handle_datagram(&init.encode(), addr("192.0.2.11:1"))
                .await
                .unwrap_err(),
            DropReason::UnknownClient
        );
        assert_eq!(dispatcher.session_counts().await, (0, 0));
    }

    #[tokio::test]
    async fn test_init_retransmission_reuses_session() {
        let dispatcher = dispatcher(ServerConfig::default());
        let src = addr("192.0.2.12:5000");
        let mut client = ClientHandshake::new("alice", ChannelConfig::default());
        let init = client.start(unix_millis()).unwrap().encode();

        let first = single(dispatcher.handle_datagram(&init, src).await.unwrap());
        let second = single(dispatcher.handle_datagram(&init, src).await.unwrap());
        assert_eq!(first, second);
        assert_eq!(dispatcher.session_counts().await, (0, 1));
    }

    #[tokio::test]
    async fn test_forged_confirm_closes_half_open() {
        let dispatcher = dispatcher(ServerConfig::default());
        let src = addr("192.0.2.13:5000");
        let mut client = ClientHandshake::new("alice", ChannelConfig::default());
        let init = client.start(unix_millis()).unwrap();
        let response = single(dispatcher.handle_datagram(&init.encode(), src).await.unwrap());
        let Packet::Response(body) = &response.packet else {
            panic!("expected response");
        };

        let verifier = PasswordVerifier::derive(b"guess", &body.salt, body.kdf).unwrap();
        let confirm = client
            .on_response(response.header.session_id, body, &verifier)
            .unwrap();
        assert_eq!(
            dispatcher
                .handle_datagram(&confirm.encode(), src)
                .await
                .unwrap_err(),
            DropReason::AuthenticationFailed
        );
        assert_eq!(dispatcher.session_counts().await, (0, 0));
        assert_eq!(dispatcher.snapshot().await.handshakes_failed, 1);
    }

    #[tokio::test]
    async fn test_keepalive_answered() {
        let dispatcher = dispatcher(ServerConfig::default());
        let src = addr("192.0.2.14:5000");
        let mut channel = connect(&dispatcher, src).await;

        let keepalive = channel.seal(&Control::Keepalive).unwrap();
        let reply = single(dispatcher.handle_datagram(&keepalive.encode(), src).await.unwrap());
        let Packet::Transport(frame) = &reply.packet else {
            panic!("expected transport");
        };
        assert_eq!(
            channel.open(&reply.header, frame).unwrap().control,
            Control::KeepaliveAck
        );
    }

    #[tokio::test]
    async fn test_rebind_and_pin() {
        let dispatcher_rebind = dispatcher(ServerConfig::default());
        let src = addr("192.0.2.15:5000");
        let moved = addr("198.51.100.7:6000");
        let mut channel = connect(&dispatcher_rebind, src).await;

        let keepalive = channel.seal(&Control::Keepalive).unwrap();
        let outcome = dispatcher_rebind
            .handle_datagram(&keepalive.encode(), moved)
            .await
            .unwrap();
        assert_eq!(outcome.replies[0].addr, moved);

        let dispatcher_pin = dispatcher(ServerConfig {
            address_policy: AddressPolicy::Pin,
            ..ServerConfig::default()
        });
        let mut channel = connect(&dispatcher_pin, src).await;
        let keepalive = channel.seal(&Control::Keepalive).unwrap();
        assert_eq!(
            dispatcher_pin
                .handle_datagram(&keepalive.encode(), moved)
                .await
                .unwrap_err(),
            DropReason::AddressMismatch(moved)
        );
    }

    #[tokio::test]
    async fn test_teardown_removes_session() {
        let dispatcher = dispatcher(ServerConfig::default());
        let src = addr("192.0.2.16:5000");
        let mut channel = connect(&dispatcher, src).await;

        let bye = channel.seal(&Control::Teardown).unwrap();
        dispatcher.handle_datagram(&bye.encode(), src).await.unwrap();
        assert_eq!(dispatcher.session_counts().await, (0, 0));

        let late = channel.seal(&Control::Payload(vec![1])).unwrap();
        assert_eq!(
            dispatcher.handle_datagram(&late.encode(), src).await.unwrap_err(),
            DropReason::UnknownSession
        );
    }

    #[tokio::test]
    async fn test_reauth_replaces_older_session() {
        let dispatcher = dispatcher(ServerConfig::default());
        let src = addr("192.0.2.17:5000");
        let mut old = connect(&dispatcher, src).await;
        let _new = connect(&dispatcher, src).await;
        assert_eq!(dispatcher.session_counts().await, (1, 0));

        let frame = old.seal(&Control::Keepalive).unwrap();
        assert_eq!(
            dispatcher.handle_datagram(&frame.encode(), src).await.unwrap_err(),
            DropReason::UnknownSession
        );
    }

    #[tokio::test]
    async fn test_route_outbound_by_tunnel_address() {
        let dispatcher = dispatcher(ServerConfig::default());
        dispatcher
            .registry()
            .set_tunnel_address("alice", Some("10.8.0.2".parse().unwrap()))
            .unwrap();
        let src = addr("192.0.2.18:5000");
        let mut channel = connect(&dispatcher, src).await;

        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&[10, 8, 0, 2]);
        let replies = dispatcher.route_outbound(&packet).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].addr, src);

        let datagram = Datagram::decode(&replies[0].bytes).unwrap();
        let Packet::Transport(frame) = &datagram.packet else {
            panic!("expected transport");
        };
        assert_eq!(
            channel.open(&datagram.header, frame).unwrap().control,
            Control::Payload(packet.clone())
        );

        packet[16..20].copy_from_slice(&[10, 8, 0, 9]);
        assert_eq!(
            dispatcher.route_outbound(&packet).await.unwrap_err(),
            DropReason::NoRoute("10.8.0.9".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_spoofed_tunnel_source_dropped() {
        let dispatcher = dispatcher(ServerConfig::default());
        dispatcher
            .registry()
            .set_tunnel_address("alice", Some("10.8.0.2".parse().unwrap()))
            .unwrap();
        let src = addr("192.0.2.19:5000");
        let mut channel = connect(&dispatcher, src).await;

        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[12..16].copy_from_slice(&[10, 8, 0, 66]);
        let frame = channel.seal(&Control::Payload(packet)).unwrap();
        assert_eq!(
            dispatcher.handle_datagram(&frame.encode(), src).await.unwrap_err(),
            DropReason::SpoofedSource
        );
    }

    #[tokio::test]
    async fn test_sweep_expires_half_open() {
        let dispatcher = dispatcher(ServerConfig {
            handshake_timeout: Duration::ZERO,
            ..ServerConfig::default()
        });
        let mut client = ClientHandshake::new("alice", ChannelConfig::default());
        let init = client.start(unix_millis()).unwrap();
        dispatcher
            .handle_datagram(&init.encode(), addr("192.0.2.20:1"))
            .await
            .unwrap();
        assert_eq!(dispatcher.session_counts().await, (0, 1));

        dispatcher.sweep().await;
        assert_eq!(dispatcher.session_counts().await, (0, 0));
        assert_eq!(dispatcher.snapshot().await.handshakes_timed_out, 1);
    }

    #[tokio::test]
    async fn test_sweep_sends_keepalives_and_expires() {
        let dispatcher = dispatcher(ServerConfig {
            keepalive_interval: Duration::ZERO,
            ..ServerConfig::default()
        });
        let src = addr("192.0.2.21:5000");
        let mut channel = connect(&dispatcher, src).await;

        let replies = dispatcher.sweep().await;
        assert_eq!(replies.len(), 1);
        let datagram = Datagram::decode(&replies[0].bytes).unwrap();
        let Packet::Transport(frame) = &datagram.packet else {
            panic!("expected transport");
        };
        assert_eq!(
            channel.open(&datagram.header, frame).unwrap().control,
            Control::Keepalive
        );

        let idle = dispatcher_with_idle_zero().await;
        idle.sweep().await;
        assert_eq!(idle.session_counts().await, (0, 0));
    }

    async fn dispatcher_with_idle_zero() -> Dispatcher {
        let dispatcher = dispatcher(ServerConfig {
            idle_timeout: Duration::ZERO,
            ..ServerConfig::default()
        });
        connect(&dispatcher, addr("192.0.2.22:5000")).await;
        dispatcher
    }

    #[tokio::test]
    async fn test_rate_limit_bans_flooding_ip() {
        let dispatcher = dispatcher(ServerConfig {
            handshake_attempts: 2,
            max_half_open_per_ip: 16,
            ..ServerConfig::default()
        });
        let src = addr("192.0.2.23:5000");
        for _ in 0..2 {
            let init = ClientHandshake::new("alice", ChannelConfig::default())
                .start(unix_millis())
                .unwrap();
            dispatcher.handle_datagram(&init.encode(), src).await.unwrap();
        }
        let init = ClientHandshake::new("alice", ChannelConfig::default())
            .start(unix_millis())
            .unwrap();
        assert_eq!(
            dispatcher.handle_datagram(&init.encode(), src).await.unwrap_err(),
            DropReason::RateLimited
        );
    }

    #[tokio::test]
    async fn test_disconnect_and_shutdown_send_teardown() {
        let dispatcher = dispatcher(ServerConfig::default());
        let src = addr("192.0.2.24:5000");
        let mut channel = connect(&dispatcher, src).await;

        let replies = dispatcher.disconnect_client("alice").await;
        assert_eq!(replies.len(), 1);
        let datagram = Datagram::decode(&replies[0].bytes).unwrap();
        let Packet::Transport(frame) = &datagram.packet else {
            panic!("expected transport");
        };
        assert_eq!(
            channel.open(&datagram.header, frame).unwrap().control,
            Control::Teardown
        );
        assert_eq!(dispatcher.session_counts().await, (0, 0));

        connect(&dispatcher, src).await;
        assert_eq!(dispatcher.shutdown().await.len(), 1);
        assert_eq!(dispatcher.session_counts().await, (0, 0));
    }

    /// Runs the init leg and returns the confirm the client would send.
    async fn confirm_for(dispatcher: &Dispatcher, src: SocketAddr, password: &[u8]) -> Vec<u8> {
        let mut client = ClientHandshake::new("alice", ChannelConfig::default());
        let init = client.start(unix_millis()).unwrap();
        let response = single(dispatcher.handle_datagram(&init.encode(), src).await.unwrap());
        let Packet::Response(body) = &response.packet else {
            panic!("expected response");
        };
        let verifier = PasswordVerifier::derive(password, &body.salt, body.kdf).unwrap();
        client
            .on_response(response.header.session_id, body, &verifier)
            .unwrap()
            .encode()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_init_copies_share_one_session() {
        let dispatcher = Arc::new(dispatcher(ServerConfig {
            handshake_attempts: 64,
            ..ServerConfig::default()
        }));
        let src = addr("192.0.2.26:5000");
        let init = ClientHandshake::new("alice", ChannelConfig::default())
            .start(unix_millis())
            .unwrap()
            .encode();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let init = init.clone();
                tokio::spawn(async move { dispatcher.handle_datagram(&init, src).await })
            })
            .collect();
        let mut responses = Vec::new();
        for task in tasks {
            responses.push(single(task.await.unwrap().unwrap()));
        }
        assert!(responses.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(dispatcher.session_counts().await, (0, 1));
    }

    #[tokio::test]
    async fn test_late_confirm_is_rejected() {
        let dispatcher = dispatcher(ServerConfig {
            handshake_timeout: Duration::ZERO,
            ..ServerConfig::default()
        });
        let src = addr("192.0.2.27:5000");
        let confirm = confirm_for(&dispatcher, src, b"alice password").await;
        assert_eq!(
            dispatcher.handle_datagram(&confirm, src).await.unwrap_err(),
            DropReason::HandshakeTimeout
        );
        assert_eq!(dispatcher.session_counts().await, (0, 0));
        assert_eq!(dispatcher.snapshot().await.handshakes_timed_out, 1);
    }

    #[tokio::test]
    async fn test_full_table_refuses_new_handshakes() {
        let dispatcher = dispatcher(ServerConfig {
            max_sessions: 1,
            ..ServerConfig::default()
        });
        connect(&dispatcher, addr("192.0.2.28:5000")).await;

        let init = ClientHandshake::new("alice", ChannelConfig::default())
            .start(unix_millis())
            .unwrap();
        assert_eq!(
            dispatcher
                .handle_datagram(&init.encode(), addr("192.0.2.29:5000"))
                .await
                .unwrap_err(),
            DropReason::Resource(SessionError::SessionFull)
        );
        assert_eq!(dispatcher.snapshot().await.resource_drops, 1);
    }

    #[tokio::test]
    async fn test_established_sessions_capped_per_ip() {
        let dispatcher = dispatcher(ServerConfig {
            max_sessions_per_ip: 1,
            ..ServerConfig::default()
        });
        connect(&dispatcher, addr("192.0.2.30:5000")).await;

        let other_port = addr("192.0.2.30:5001");
        let confirm = confirm_for(&dispatcher, other_port, b"alice password").await;
        let ip = other_port.ip();
        assert_eq!(
            dispatcher.handle_datagram(&confirm, other_port).await.unwrap_err(),
            DropReason::Resource(SessionError::SessionsPerIp(ip))
        );
        assert_eq!(dispatcher.session_counts().await, (1, 0));

        // Another address is unaffected.
        connect(&dispatcher, addr("192.0.2.31:5000")).await;
        assert_eq!(dispatcher.session_counts().await, (2, 0));
    }

    #[tokio::test]
    async fn test_password_rotation_fails_pending_handshake() {
        let dispatcher = dispatcher(ServerConfig::default());
        let src = addr("192.0.2.32:5000");
        let confirm = confirm_for(&dispatcher, src, b"alice password").await;

        dispatcher
            .registry()
            .rotate_password("alice", b"fresh password")
            .unwrap();
        assert_eq!(
            dispatcher.handle_datagram(&confirm, src).await.unwrap_err(),
            DropReason::AuthenticationFailed
        );
        assert_eq!(dispatcher.session_counts().await, (0, 0));
    }

    #[tokio::test]
    async fn test_heavy_traffic_bans_ip() {
        let dispatcher = dispatcher(ServerConfig {
            max_bytes_per_sec: 100,
            ..ServerConfig::default()
        });
        let src = addr("192.0.2.33:5000");
        let mut channel = connect(&dispatcher, src).await;

        let frame = channel.seal(&Control::Payload(vec![0x45; 100])).unwrap();
        let outcome = dispatcher.handle_datagram(&frame.encode(), src).await.unwrap();
        assert_eq!(outcome.deliveries.len(), 1);

        for _ in 0..2 {
            let frame = channel.seal(&Control::Payload(vec![0x45; 100])).unwrap();
            assert_eq!(
                dispatcher.handle_datagram(&frame.encode(), src).await.unwrap_err(),
                DropReason::RateLimited
            );
        }
        assert_eq!(dispatcher.snapshot().await.rate_limited, 2);

        let other = addr("192.0.2.34:5000");
        let mut channel = connect(&dispatcher, other).await;
        let frame = channel.seal(&Control::Payload(vec![0x45; 40])).unwrap();
        assert!(dispatcher.handle_datagram(&frame.encode(), other).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_closes_withdrawn_clients() {
        let dispatcher = dispatcher(ServerConfig::default());
        let src = addr("192.0.2.35:5000");
        let mut channel = connect(&dispatcher, src).await;
        assert!(dispatcher.sweep().await.is_empty());

        assert!(dispatcher.registry().revoke("alice").unwrap());
        let replies = dispatcher.sweep().await;
        assert_eq!(replies.len(), 1);
        let datagram = Datagram::decode(&replies[0].bytes).unwrap();
        let Packet::Transport(frame) = &datagram.packet else {
            panic!("expected transport");
        };
        assert_eq!(
            channel.open(&datagram.header, frame).unwrap().control,
            Control::Teardown
        );
        assert_eq!(dispatcher.session_counts().await, (0, 0));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let registry = Arc::new(ClientRegistry::new(CHEAP));
        let config = ServerConfig {
            max_sessions_per_ip: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            Dispatcher::new(config, registry).err(),
            Some(ConfigError::Zero(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_dropped() {
        let dispatcher = dispatcher(ServerConfig::default());
        let src = addr("192.0.2.25:5000");
        for len in [0usize, 1, 19, 20, 64, 1500, 4000] {
            let junk = vec![0xA5; len];
            assert!(dispatcher.handle_datagram(&junk, src).await.is_err());
        }
        assert_eq!(dispatcher.session_counts().await, (0, 0));
    }
}
