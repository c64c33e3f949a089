//! Session table.
//!
//! Sessions are keyed by session id. The table also keeps secondary
//! indexes: half-open handshakes by `(source IP, client ephemeral)` so a
//! retransmitted `HandshakeInit` finds its session again, per-IP half-open
//! and established counts for the flood limits, and established sessions by
//! tunnel address for outbound routing. Every index update happens under
//! the one table write lock, so concurrent workers cannot leave an entry
//! counted but unindexed.
//!
//! Table methods never lock a session, so the table lock may be taken
//! while holding a session lock but not the other way around.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use phaze_core::{ClientMode, Transport, KEY_SIZE, PROOF_SIZE};
use phaze_crypto::{SecureChannel, ServerHandshake};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::telemetry::{SessionInfo, TrafficCounters};

/// Session lifecycle.
#[derive(Debug)]
pub enum PeerState {
    /// `HandshakeResponse` sent, waiting for the client's proof.
    HalfOpen {
        handshake: ServerHandshake,
        /// Wire bytes of the response, resent on `HandshakeInit` retransmission.
        response: Vec<u8>,
    },
    Established {
        channel: Box<SecureChannel>,
        /// Wire bytes of the ack and the proof it answered, for
        /// `HandshakeConfirm` retransmissions.
        ack: Vec<u8>,
        confirm_proof: [u8; PROOF_SIZE],
    },
}

/// One peer's session.
#[derive(Debug)]
pub struct PeerSession {
    pub session_id: Uuid,
    pub client_name: String,
    pub mode: ClientMode,
    pub transport: Arc<dyn Transport>,
    /// Address frames are sent to.
    pub remote: SocketAddr,
    pub state: PeerState,
    pub created_at: Instant,
    pub established_at: Option<Instant>,
    /// Last authenticated inbound frame.
    pub last_activity: Instant,
    /// Last keepalive probe we sent.
    pub last_probe: Option<Instant>,
    pub tunnel_address: Option<IpAddr>,
    pub counters: Arc<TrafficCounters>,
    pub client_counters: Arc<TrafficCounters>,
}

impl PeerSession {
    pub fn is_established(&self) -> bool {
        matches!(self.state, PeerState::Established { .. })
    }

    pub fn channel_mut(&mut self) -> Option<&mut SecureChannel> {
        match &mut self.state {
            PeerState::Established { channel, .. } => Some(channel.as_mut()),
            PeerState::HalfOpen { .. } => None,
        }
    }

    pub fn record_in(&self, bytes: usize) {
        self.counters.record_in(bytes);
        self.client_counters.record_in(bytes);
    }

    pub fn record_out(&self, bytes: usize) {
        self.counters.record_out(bytes);
        self.client_counters.record_out(bytes);
    }
}

/// Resource limits enforced on insertion.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_sessions: usize,
    pub max_half_open: usize,
    pub max_half_open_per_ip: usize,
    pub max_sessions_per_ip: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session table full")]
    SessionFull,
    #[error("too many half-open handshakes")]
    HalfOpenFull,
    #[error("too many half-open handshakes from {0}")]
    HalfOpenPerIp(IpAddr),
    #[error("too many sessions from {0}")]
    SessionsPerIp(IpAddr),
}

/// Result of [`SessionTable::insert_half_open`].
#[derive(Debug)]
pub enum HalfOpenSlot {
    Inserted(SessionHandle),
    /// Another worker already answered this `(IP, ephemeral)`; the new
    /// session was discarded.
    Existing(SessionHandle),
}

pub type SessionHandle = Arc<Mutex<PeerSession>>;

type HalfOpenKey = (IpAddr, [u8; KEY_SIZE]);

struct SessionEntry {
    session: SessionHandle,
    client_name: String,
    mode: ClientMode,
    half_open: Option<HalfOpenKey>,
    /// Source IP counted against `max_sessions_per_ip`.
    established_ip: Option<IpAddr>,
    route: Option<IpAddr>,
    established_at: Option<Instant>,
    counters: Arc<TrafficCounters>,
}

#[derive(Default)]
struct TableInner {
    sessions: HashMap<Uuid, SessionEntry>,
    half_open: HashMap<HalfOpenKey, Uuid>,
    half_open_per_ip: HashMap<IpAddr, usize>,
    established_per_ip: HashMap<IpAddr, usize>,
    routes: HashMap<IpAddr, Uuid>,
}

fn decrement(counts: &mut HashMap<IpAddr, usize>, ip: IpAddr) {
    if let Some(count) = counts.get_mut(&ip) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&ip);
        }
    }
}

impl TableInner {
    fn unindex(&mut self, id: Uuid, entry: &SessionEntry) {
        if let Some(key) = entry.half_open {
            if self.half_open.get(&key) == Some(&id) {
                self.half_open.remove(&key);
                decrement(&mut self.half_open_per_ip, key.0);
            }
        }
        if let Some(ip) = entry.established_ip {
            decrement(&mut self.established_per_ip, ip);
        }
        if let Some(address) = entry.route {
            if self.routes.get(&address) == Some(&id) {
                self.routes.remove(&address);
            }
        }
    }
}

/// Live sessions, owned by the dispatcher.
pub struct SessionTable {
    inner: RwLock<TableInner>,
    limits: SessionLimits,
}

impl SessionTable {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            inner: RwLock::new(TableInner::default()),
            limits,
        }
    }

    /// Insert a half-open session, enforcing the flood limits.
    ///
    /// If a session for the same `(IP, ephemeral)` already exists it is
    /// returned instead and `session` is dropped.
    pub async fn insert_half_open(
        &self,
        session: PeerSession,
        client_ephemeral: [u8; KEY_SIZE],
    ) -> Result<HalfOpenSlot, SessionError> {
        let ip = session.remote.ip();
        let key = (ip, client_ephemeral);
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner
            .half_open
            .get(&key)
            .and_then(|id| inner.sessions.get(id))
        {
            return Ok(HalfOpenSlot::Existing(existing.session.clone()));
        }
        if inner.sessions.len() >= self.limits.max_sessions {
            return Err(SessionError::SessionFull);
        }
        if inner.half_open.len() >= self.limits.max_half_open {
            return Err(SessionError::HalfOpenFull);
        }
        let per_ip = inner.half_open_per_ip.get(&ip).copied().unwrap_or(0);
        if per_ip >= self.limits.max_half_open_per_ip {
            return Err(SessionError::HalfOpenPerIp(ip));
        }

        let id = session.session_id;
        let entry = SessionEntry {
            client_name: session.client_name.clone(),
            mode: session.mode,
            half_open: Some(key),
            established_ip: None,
            route: None,
            established_at: None,
            counters: session.counters.clone(),
            session: Arc::new(Mutex::new(session)),
        };
        let handle = entry.session.clone();
        inner.half_open.insert(key, id);
        *inner.half_open_per_ip.entry(ip).or_insert(0) += 1;
        inner.sessions.insert(id, entry);
        Ok(HalfOpenSlot::Inserted(handle))
    }

    /// Half-open session for a retransmitted `HandshakeInit`.
    pub async fn find_half_open(
        &self,
        ip: IpAddr,
        client_ephemeral: &[u8; KEY_SIZE],
    ) -> Option<SessionHandle> {
        let inner = self.inner.read().await;
        let id = inner.half_open.get(&(ip, *client_ephemeral))?;
        inner.sessions.get(id).map(|e| e.session.clone())
    }

    pub async fn get(&self, id: &Uuid) -> Option<SessionHandle> {
        self.inner
            .read()
            .await
            .sessions
            .get(id)
            .map(|e| e.session.clone())
    }

    /// Move a session out of the half-open index, count it against `ip`
    /// and claim its route.
    ///
    /// Fails without touching the session when `ip` already holds
    /// `max_sessions_per_ip` established sessions.
    pub async fn promote(
        &self,
        id: Uuid,
        ip: IpAddr,
        tunnel_address: Option<IpAddr>,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let established = inner.established_per_ip.get(&ip).copied().unwrap_or(0);
        if established >= self.limits.max_sessions_per_ip {
            return Err(SessionError::SessionsPerIp(ip));
        }
        let Some(mut entry) = inner.sessions.remove(&id) else {
            return Ok(());
        };
        inner.unindex(id, &entry);
        entry.half_open = None;
        entry.established_ip = Some(ip);
        entry.route = tunnel_address;
        entry.established_at = Some(Instant::now());
        *inner.established_per_ip.entry(ip).or_insert(0) += 1;
        if let Some(address) = tunnel_address {
            inner.routes.insert(address, id);
        }
        inner.sessions.insert(id, entry);
        Ok(())
    }

    pub async fn remove(&self, id: &Uuid) -> Option<SessionHandle> {
        let mut inner = self.inner.write().await;
        let entry = inner.sessions.remove(id)?;
        inner.unindex(*id, &entry);
        Some(entry.session)
    }

    /// Established session owning a tunnel address.
    pub async fn route(&self, address: IpAddr) -> Option<SessionHandle> {
        let inner = self.inner.read().await;
        let id = inner.routes.get(&address)?;
        inner.sessions.get(id).map(|e| e.session.clone())
    }

    /// Sessions (half-open included) belonging to a client.
    pub async fn for_client(&self, name: &str) -> Vec<(Uuid, SessionHandle)> {
        self.inner
            .read()
            .await
            .sessions
            .iter()
            .filter(|(_, e)| e.client_name == name)
            .map(|(id, e)| (*id, e.session.clone()))
            .collect()
    }

    pub async fn all(&self) -> Vec<(Uuid, SessionHandle)> {
        self.inner
            .read()
            .await
            .sessions
            .iter()
            .map(|(id, e)| (*id, e.session.clone()))
            .collect()
    }

    /// Remove every session, returning them for a final teardown.
    pub async fn drain(&self) -> Vec<SessionHandle> {
        let mut inner = self.inner.write().await;
        inner.half_open.clear();
        inner.half_open_per_ip.clear();
        inner.established_per_ip.clear();
        inner.routes.clear();
        inner.sessions.drain().map(|(_, e)| e.session).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// `(established, half_open)`.
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        let half_open = inner.half_open.len();
        (inner.sessions.len() - half_open, half_open)
    }

    /// Established sessions for telemetry, without taking session locks.
    pub async fn session_infos(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        inner
            .sessions
            .iter()
            .filter_map(|(id, e)| {
                let established_at = e.established_at?;
                Some(SessionInfo {
                    session_id: *id,
                    client_name: e.client_name.clone(),
                    mode: e.mode,
                    duration_secs: now.saturating_duration_since(established_at).as_secs(),
                    bytes_in: e.counters.bytes_in(),
                    bytes_out: e.counters.bytes_out(),
                })
            })
            .collect()
    }
}
