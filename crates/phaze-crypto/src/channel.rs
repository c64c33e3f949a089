//! Secure channel for an established session.
//!
//! Wraps the directional packet ciphers with:
//! - A monotonic send counter (never reset, not even across rekeys)
//! - A replay window for inbound counters
//! - Key rotation driven by frame, byte and age thresholds
//!
//! # Rekeying
//!
//! Either side may send `RekeyInit` carrying a fresh ephemeral key. The peer
//! answers with `RekeyResponse` under the *current* key and then switches
//! to the next epoch; the initiator switches when the response arrives.
//! The key phase bit in the header tells the receiver which epoch a frame
//! belongs to. The previous receive key is kept until the first frame of
//! the new phase authenticates, so frames still in flight are not lost.
//!
//! If both sides start a rekey at once, the client's wins: the client
//! ignores the server's `RekeyInit`, the server abandons its own and answers.

use std::time::{Duration, Instant};

use phaze_core::{
    Control, Datagram, FrameFlags, Header, TransportFrame, COUNTER_SIZE, HEADER_SIZE, KEY_SIZE,
    MAX_PAYLOAD_SIZE,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::cipher::{CryptoError, PacketCipher};
use crate::keys::{self, EphemeralKeypair, SessionKeys};
use crate::replay::ReplayWindow;

/// How long to wait for a `RekeyResponse` before sending `RekeyInit` again.
pub const REKEY_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Which end of the session this channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Thresholds after which the channel asks for new keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyPolicy {
    /// Frames sealed or opened in one epoch.
    pub max_frames: u64,
    /// Plaintext bytes sealed or opened in one epoch.
    pub max_bytes: u64,
    /// Age of an epoch.
    pub max_age: Duration,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            max_frames: 1 << 24,
            max_bytes: 64 * 1024 * 1024,
            max_age: Duration::from_secs(300),
        }
    }
}

/// Channel tuning shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub rekey: RekeyPolicy,
    pub window_size: u64,
    pub forward_tolerance: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            rekey: RekeyPolicy::default(),
            window_size: ReplayWindow::MAX_WINDOW_SIZE,
            forward_tolerance: ReplayWindow::DEFAULT_FORWARD_TOLERANCE,
        }
    }
}

/// Why an inbound frame was rejected.
///
/// Only used for local accounting; it is never reflected to the network
/// and the error's `Display` is the same for every reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Replay,
    Integrity,
    UnknownKeyPhase,
    Malformed,
}

/// Secure channel errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("frame rejected")]
    Rejected(RejectReason),

    /// The send counter reached its limit; the session must be replaced.
    #[error("send counter exhausted")]
    CounterExhausted,

    #[error("payload too large: {0} bytes, maximum {1}")]
    PayloadTooLarge(usize, usize),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl ChannelError {
    /// Whether the session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::CounterExhausted)
    }
}

/// An authenticated inbound frame.
#[derive(Debug)]
pub struct Received {
    pub control: Control,
    /// Frame to send back (keepalive ack or rekey response).
    pub reply: Option<Datagram>,
    /// Whether this frame moved the channel to a new epoch.
    pub rekeyed: bool,
}

struct PendingRekey {
    keypair: EphemeralKeypair,
    started: Instant,
}

/// The last `RekeyInit` we answered, for retransmissions.
struct AnsweredRekey {
    peer: [u8; KEY_SIZE],
    response: [u8; KEY_SIZE],
}

/// Replay-protected, rekeying transport for one session.
pub struct SecureChannel {
    role: Role,
    session_id: Uuid,
    chaining: [u8; KEY_SIZE],
    phase: bool,
    epoch: u64,
    send: PacketCipher,
    previous_send: Option<PacketCipher>,
    recv: PacketCipher,
    previous_recv: Option<PacketCipher>,
    send_counter: u64,
    window: ReplayWindow,
    config: ChannelConfig,
    epoch_started: Instant,
    epoch_frames: u64,
    epoch_bytes: u64,
    pending: Option<PendingRekey>,
    answered: Option<AnsweredRekey>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("role", &self.role)
            .field("session_id", &self.session_id)
            .field("epoch", &self.epoch)
            .field("send_counter", &self.send_counter)
            .finish()
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.chaining.zeroize();
    }
}

impl SecureChannel {
    /// Build a channel from freshly derived handshake keys.
    pub fn new(role: Role, session_id: Uuid, keys: SessionKeys, config: ChannelConfig) -> Self {
        let (send_key, recv_key) = directional(role, &keys);
        Self {
            role,
            session_id,
            chaining: keys.chaining,
            phase: false,
            epoch: 0,
            send: PacketCipher::new(send_key),
            previous_send: None,
            recv: PacketCipher::new(recv_key),
            previous_recv: None,
            send_counter: 0,
            window: ReplayWindow::with_size(config.window_size, config.forward_tolerance),
            config,
            epoch_started: Instant::now(),
            epoch_frames: 0,
            epoch_bytes: 0,
            pending: None,
            answered: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Current key phase bit.
    pub fn key_phase(&self) -> bool {
        self.phase
    }

    /// Number of completed rekeys.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Counter the next sealed frame will use.
    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    pub fn rekey_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Encrypt a control frame into a transport datagram.
    pub fn seal(&mut self, control: &Control) -> Result<Datagram, ChannelError> {
        if let Control::Payload(data) = control {
            if data.len() > MAX_PAYLOAD_SIZE {
                return Err(ChannelError::PayloadTooLarge(data.len(), MAX_PAYLOAD_SIZE));
            }
        }
        self.seal_with(control, false)
    }

    fn seal_with(&mut self, control: &Control, previous: bool) -> Result<Datagram, ChannelError> {
        if self.send_counter == u64::MAX {
            return Err(ChannelError::CounterExhausted);
        }
        let counter = self.send_counter;

        let (cipher, phase) = if previous {
            match self.previous_send.as_ref() {
                Some(cipher) => (cipher, !self.phase),
                None => (&self.send, self.phase),
            }
        } else {
            (&self.send, self.phase)
        };

        let header = Datagram::transport_header(self.session_id, phase);
        let plaintext = control.encode();
        let ciphertext = cipher.seal(counter, &frame_aad(&header, counter), &plaintext)?;

        self.send_counter += 1;
        self.epoch_frames += 1;
        self.epoch_bytes += plaintext.len() as u64;

        Ok(Datagram::transport(
            self.session_id,
            phase,
            TransportFrame {
                counter,
                ciphertext,
            },
        ))
    }

    /// Authenticate and decrypt an inbound frame.
    ///
    /// The replay window is only updated once the frame authenticates;
    /// a rejected frame leaves the channel untouched.
    pub fn open(
        &mut self,
        header: &Header,
        frame: &TransportFrame,
    ) -> Result<Received, ChannelError> {
        if header.session_id != self.session_id {
            return Err(ChannelError::Rejected(RejectReason::Malformed));
        }

        let current = header.flags.contains(FrameFlags::KEY_PHASE) == self.phase;
        let cipher = if current {
            &self.recv
        } else {
            self.previous_recv
                .as_ref()
                .ok_or(ChannelError::Rejected(RejectReason::UnknownKeyPhase))?
        };

        if !self.window.check(frame.counter) {
            return Err(ChannelError::Rejected(RejectReason::Replay));
        }

        let plaintext = cipher
            .open(
                frame.counter,
                &frame_aad(header, frame.counter),
                &frame.ciphertext,
            )
            .map_err(|_| ChannelError::Rejected(RejectReason::Integrity))?;

        self.window.accept(frame.counter);
        self.epoch_frames += 1;
        self.epoch_bytes += plaintext.len() as u64;

        if current && self.previous_recv.is_some() {
            debug!(session_id = %self.session_id, epoch = self.epoch, "key phase confirmed");
            self.previous_recv = None;
            self.previous_send = None;
            self.answered = None;
        }

        let control = Control::decode(&plaintext)
            .map_err(|_| ChannelError::Rejected(RejectReason::Malformed))?;

        let mut reply = None;
        let mut rekeyed = false;
        match &control {
            Control::Keepalive => {
                reply = Some(self.seal(&Control::KeepaliveAck)?);
            }
            Control::RekeyInit(peer) => {
                reply = self.answer_rekey(peer, current)?;
                rekeyed = reply.is_some() && current;
            }
            Control::RekeyResponse(peer) if current => {
                rekeyed = self.complete_rekey(peer)?;
            }
            _ => {}
        }

        Ok(Received {
            control,
            reply,
            rekeyed,
        })
    }

    /// Whether this side should start (or retry) a rekey.
    pub fn needs_rekey(&self) -> bool {
        self.needs_rekey_at(Instant::now())
    }

    pub fn needs_rekey_at(&self, now: Instant) -> bool {
        if let Some(pending) = &self.pending {
            return now.saturating_duration_since(pending.started) >= REKEY_RETRY_INTERVAL;
        }
        let policy = &self.config.rekey;
        self.epoch_frames >= policy.max_frames
            || self.epoch_bytes >= policy.max_bytes
            || now.saturating_duration_since(self.epoch_started) >= policy.max_age
    }

    /// Begin a rekey, or repeat the outstanding `RekeyInit`.
    ///
    /// The returned control frame must be sealed and sent by the caller.
    pub fn start_rekey(&mut self) -> Control {
        let now = Instant::now();
        if let Some(pending) = self.pending.as_mut() {
            pending.started = now;
            return Control::RekeyInit(pending.keypair.public_bytes());
        }

        let keypair = EphemeralKeypair::generate();
        let public = keypair.public_bytes();
        self.pending = Some(PendingRekey {
            keypair,
            started: now,
        });
        debug!(session_id = %self.session_id, epoch = self.epoch, "starting rekey");
        Control::RekeyInit(public)
    }

    fn answer_rekey(
        &mut self,
        peer: &[u8; KEY_SIZE],
        current: bool,
    ) -> Result<Option<Datagram>, ChannelError> {
        if !current {
            // Retransmission of an init we already answered; the peer is
            // still on the old phase so answer under the old key.
            return match &self.answered {
                Some(answered) if answered.peer == *peer => {
                    let response = answered.response;
                    Ok(Some(self.seal_with(&Control::RekeyResponse(response), true)?))
                }
                _ => Ok(None),
            };
        }

        if self.pending.is_some() {
            match self.role {
                Role::Client => {
                    debug!(session_id = %self.session_id, "rekey collision, keeping ours");
                    return Ok(None);
                }
                Role::Server => {
                    debug!(session_id = %self.session_id, "rekey collision, yielding to client");
                    self.pending = None;
                }
            }
        }

        let keypair = EphemeralKeypair::generate();
        let shared = keypair
            .agree(peer)
            .map_err(|_| ChannelError::Rejected(RejectReason::Malformed))?;
        let next = keys::rekey(&self.chaining, &shared)?;
        let response = keypair.public_bytes();

        let reply = self.seal(&Control::RekeyResponse(response))?;
        self.install(&next);
        self.answered = Some(AnsweredRekey {
            peer: *peer,
            response,
        });
        Ok(Some(reply))
    }

    fn complete_rekey(&mut self, peer: &[u8; KEY_SIZE]) -> Result<bool, ChannelError> {
        let Some(pending) = self.pending.take() else {
            debug!(session_id = %self.session_id, "ignoring unsolicited rekey response");
            return Ok(false);
        };

        let shared = pending
            .keypair
            .agree(peer)
            .map_err(|_| ChannelError::Rejected(RejectReason::Malformed))?;
        let next = keys::rekey(&self.chaining, &shared)?;
        self.install(&next);
        Ok(true)
    }

    fn install(&mut self, next: &SessionKeys) {
        let (send_key, recv_key) = directional(self.role, next);
        self.previous_send = Some(std::mem::replace(
            &mut self.send,
            PacketCipher::new(send_key),
        ));
        self.previous_recv = Some(std::mem::replace(
            &mut self.recv,
            PacketCipher::new(recv_key),
        ));
        self.chaining = next.chaining;
        self.phase = !self.phase;
        self.epoch += 1;
        self.epoch_started = Instant::now();
        self.epoch_frames = 0;
        self.epoch_bytes = 0;
        debug!(session_id = %self.session_id, epoch = self.epoch, "installed new keys");
    }
}

fn directional(role: Role, keys: &SessionKeys) -> (&[u8; KEY_SIZE], &[u8; KEY_SIZE]) {
    match role {
        Role::Client => (&keys.client_to_server, &keys.server_to_client),
        Role::Server => (&keys.server_to_client, &keys.client_to_server),
    }
}

/// Associated data of a transport frame: header followed by the counter.
fn frame_aad(header: &Header, counter: u64) -> [u8; HEADER_SIZE + COUNTER_SIZE] {
    let mut aad = [0u8; HEADER_SIZE + COUNTER_SIZE];
    aad[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    aad[HEADER_SIZE..].copy_from_slice(&counter.to_be_bytes());
    aad
}
