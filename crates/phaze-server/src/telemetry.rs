//! Server telemetry.
//!
//! Counters are plain atomics so the data path never waits on a reader.
//! Per-session and per-client traffic counters are shared `Arc`s; client
//! totals outlive the sessions that fed them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use phaze_core::ClientMode;
use phaze_crypto::RejectReason;
use serde::Serialize;
use uuid::Uuid;

/// Byte and frame counters for one session or one client.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

impl TrafficCounters {
    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }
}

/// Server-wide counters.
#[derive(Debug, Default)]
pub struct Telemetry {
    pub handshakes_started: AtomicU64,
    pub handshakes_completed: AtomicU64,
    pub handshakes_failed: AtomicU64,
    pub handshakes_timed_out: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub integrity_failures: AtomicU64,
    pub replays: AtomicU64,
    pub resource_drops: AtomicU64,
    pub rate_limited: AtomicU64,
    pub carrier_drops: AtomicU64,
    pub malformed: AtomicU64,
    pub rekeys: AtomicU64,
    pub sessions_closed: AtomicU64,
    clients: RwLock<HashMap<String, Arc<TrafficCounters>>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Account an inbound frame the channel refused.
    pub fn record_rejection(&self, reason: RejectReason) {
        match reason {
            RejectReason::Replay => Self::incr(&self.replays),
            RejectReason::Integrity | RejectReason::UnknownKeyPhase => {
                Self::incr(&self.integrity_failures)
            }
            RejectReason::Malformed => Self::incr(&self.malformed),
        }
    }

    /// Totals for a client, created on first use.
    pub fn client_counters(&self, name: &str) -> Arc<TrafficCounters> {
        if let Ok(clients) = self.clients.read() {
            if let Some(counters) = clients.get(name) {
                return counters.clone();
            }
        }
        match self.clients.write() {
            Ok(mut clients) => clients.entry(name.to_string()).or_default().clone(),
            Err(_) => Arc::new(TrafficCounters::default()),
        }
    }

    fn client_totals(&self) -> Vec<(String, Arc<TrafficCounters>)> {
        self.clients
            .read()
            .map(|clients| {
                clients
                    .iter()
                    .map(|(name, counters)| (name.clone(), counters.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Assemble a snapshot from the counters and the live session list.
    pub fn snapshot(&self, half_open: usize, sessions: Vec<SessionInfo>) -> TelemetrySnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let mut clients: Vec<ClientTraffic> = self
            .client_totals()
            .into_iter()
            .map(|(name, counters)| ClientTraffic {
                active_sessions: sessions.iter().filter(|s| s.client_name == name).count(),
                name,
                bytes_in: counters.bytes_in(),
                bytes_out: counters.bytes_out(),
            })
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));

        TelemetrySnapshot {
            established_sessions: sessions.len(),
            half_open_sessions: half_open,
            handshakes_started: load(&self.handshakes_started),
            handshakes_completed: load(&self.handshakes_completed),
            handshakes_failed: load(&self.handshakes_failed),
            handshakes_timed_out: load(&self.handshakes_timed_out),
            frames_in: load(&self.frames_in),
            frames_out: load(&self.frames_out),
            integrity_failures: load(&self.integrity_failures),
            replays: load(&self.replays),
            resource_drops: load(&self.resource_drops),
            rate_limited: load(&self.rate_limited),
            carrier_drops: load(&self.carrier_drops),
            malformed: load(&self.malformed),
            rekeys: load(&self.rekeys),
            sessions_closed: load(&self.sessions_closed),
            clients,
            sessions,
        }
    }
}

/// One established session as reported to monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub client_name: String,
    pub mode: ClientMode,
    pub duration_secs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientTraffic {
    pub name: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub active_sessions: usize,
}

/// Read-only view served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub established_sessions: usize,
    pub half_open_sessions: usize,
    pub handshakes_started: u64,
    pub handshakes_completed: u64,
    pub handshakes_failed: u64,
    pub handshakes_timed_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub integrity_failures: u64,
    pub replays: u64,
    pub resource_drops: u64,
    pub rate_limited: u64,
    pub carrier_drops: u64,
    pub malformed: u64,
    pub rekeys: u64,
    pub sessions_closed: u64,
    pub clients: Vec<ClientTraffic>,
    pub sessions: Vec<SessionInfo>,
}
