//! Per-IP abuse limiter.
//!
//! Counts handshake attempts per source IP in a sliding window and
//! authenticated inbound bytes per one-second window. An IP that exceeds
//! the handshake allowance, or sends more than twice the byte allowance in
//! a second, is banned for a fixed period; datagrams from a banned IP never
//! reach the handshake or decryption code.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const TRAFFIC_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct TrafficWindow {
    started: Instant,
    bytes: u64,
}

#[derive(Debug, Default)]
struct IpRecord {
    /// Start times of attempts within the window, oldest first.
    attempts: VecDeque<Instant>,
    traffic: Option<TrafficWindow>,
    banned_until: Option<Instant>,
}

#[derive(Debug)]
pub struct AbuseLimiter {
    entries: HashMap<IpAddr, IpRecord>,
    max_attempts: usize,
    window: Duration,
    ban: Duration,
    max_bytes_per_sec: u64,
}

impl AbuseLimiter {
    pub fn new(
        max_attempts: usize,
        window: Duration,
        ban: Duration,
        max_bytes_per_sec: u64,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            max_attempts,
            window,
            ban,
            max_bytes_per_sec,
        }
    }

    /// Record an attempt from `ip`; `false` if it must be dropped.
    pub fn check(&mut self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        let entry = self.entries.entry(ip).or_default();

        if let Some(until) = entry.banned_until {
            if now < until {
                return false;
            }
            entry.banned_until = None;
            entry.attempts.clear();
            entry.traffic = None;
        }

        while let Some(&oldest) = entry.attempts.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                entry.attempts.pop_front();
            } else {
                break;
            }
        }

        entry.attempts.push_back(now);
        if entry.attempts.len() > self.max_attempts {
            warn!(
                "Handshake rate exceeded by {}, banning for {}s",
                ip,
                self.ban.as_secs()
            );
            entry.banned_until = Some(now + self.ban);
            entry.attempts.clear();
            return false;
        }
        true
    }

    /// Account `bytes` of authenticated traffic from `ip`; `false` if the
    /// IP is banned, including by this call.
    pub fn record_traffic(&mut self, ip: IpAddr, bytes: u64) -> bool {
        self.record_traffic_at(ip, bytes, Instant::now())
    }

    pub fn record_traffic_at(&mut self, ip: IpAddr, bytes: u64, now: Instant) -> bool {
        let limit = self.max_bytes_per_sec;
        let entry = self.entries.entry(ip).or_default();
        if entry.banned_until.is_some_and(|until| now < until) {
            return false;
        }

        let window = entry.traffic.get_or_insert(TrafficWindow {
            started: now,
            bytes: 0,
        });
        if now.saturating_duration_since(window.started) >= TRAFFIC_WINDOW {
            window.started = now;
            window.bytes = 0;
        }
        let was_under = window.bytes <= limit;
        window.bytes = window.bytes.saturating_add(bytes);

        if window.bytes > limit.saturating_mul(2) {
            warn!(
                "Traffic from {} exceeded {} bytes/s, banning for {}s",
                ip,
                limit.saturating_mul(2),
                self.ban.as_secs()
            );
            entry.banned_until = Some(now + self.ban);
            entry.traffic = None;
            entry.attempts.clear();
            return false;
        }
        if was_under && window.bytes > limit {
            debug!("High traffic from {}: over {} bytes/s", ip, limit);
        }
        true
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.is_banned_at(ip, Instant::now())
    }

    pub fn is_banned_at(&self, ip: IpAddr, now: Instant) -> bool {
        self.entries
            .get(&ip)
            .and_then(|e| e.banned_until)
            .is_some_and(|until| now < until)
    }

    /// Drop expired bans and idle entries. Returns how many were removed.
    pub fn cleanup(&mut self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let window = self.window;
        self.entries.retain(|_, entry| {
            if let Some(until) = entry.banned_until {
                return now < until;
            }
            let recent_attempt = entry
                .attempts
                .back()
                .is_some_and(|last| now.saturating_duration_since(*last) < window);
            let recent_traffic = entry
                .traffic
                .as_ref()
                .is_some_and(|t| now.saturating_duration_since(t.started) < TRAFFIC_WINDOW);
            recent_attempt || recent_traffic
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
