//! Four-message handshake.
//!
//! ```text
//! Client                                        Server
//!   Init { eph_c, timestamp, name }     ---->
//!                                       <----   Response { eph_s, nonce, salt, kdf }
//!   Confirm { client_proof }            ---->
//!                                       <----   Ack { server_proof }
//! ```
//!
//! Both state machines are sans-I/O: they consume parsed messages and
//! produce datagrams, leaving sockets, timers and retransmission to the
//! caller. The expensive Argon2 step is also left to the caller, which
//! passes in a ready [`PasswordVerifier`].

use std::time::{SystemTime, UNIX_EPOCH};

use phaze_core::{
    Datagram, HandshakeAck, HandshakeConfirm, HandshakeInit, HandshakeResponse, KdfParams, Packet,
    PacketType, MAX_CLIENT_NAME_LEN, NONCE_SIZE,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use uuid::Uuid;

use crate::channel::{ChannelConfig, Role, SecureChannel};
use crate::cipher::CryptoError;
use crate::keys::{self, EphemeralKeypair, SessionKeys, SharedSecret};
use crate::password::{PasswordVerifier, ProofKey};

/// Maximum accepted difference between client and server clocks.
pub const MAX_CLOCK_SKEW_MS: u64 = 120_000;

/// Handshake progress, shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingResponse,
    AwaitingConfirm,
    Established,
    Closed,
}

/// Handshake errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unexpected {0:?} in state {1:?}")]
    UnexpectedMessage(PacketType, HandshakeState),

    #[error("handshake timestamp outside allowed clock skew")]
    StaleTimestamp,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("session id mismatch")]
    SessionMismatch,

    #[error("invalid client name")]
    InvalidName,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Current wall clock in Unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct ClientPending {
    keys: SessionKeys,
    proof_key: ProofKey,
    transcript: [u8; 32],
}

/// Client side of the handshake.
pub struct ClientHandshake {
    state: HandshakeState,
    client_name: String,
    config: ChannelConfig,
    keypair: Option<EphemeralKeypair>,
    init: Option<Datagram>,
    session_id: Option<Uuid>,
    pending: Option<ClientPending>,
    confirm: Option<Datagram>,
}

impl ClientHandshake {
    pub fn new(client_name: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            state: HandshakeState::Idle,
            client_name: client_name.into(),
            config,
            keypair: None,
            init: None,
            session_id: None,
            pending: None,
            confirm: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Session ID assigned by the server, once known.
    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// Produce `HandshakeInit`.
    ///
    /// Calling it again while awaiting the response returns the same
    /// datagram, so retransmissions are recognisable by the server.
    pub fn start(&mut self, now_ms: u64) -> Result<Datagram, HandshakeError> {
        match self.state {
            HandshakeState::Idle => {}
            HandshakeState::AwaitingResponse => {
                if let Some(init) = &self.init {
                    return Ok(init.clone());
                }
            }
            state => {
                return Err(HandshakeError::UnexpectedMessage(
                    PacketType::HandshakeInit,
                    state,
                ))
            }
        }

        if self.client_name.is_empty() || self.client_name.len() > MAX_CLIENT_NAME_LEN {
            return Err(HandshakeError::InvalidName);
        }

        let keypair = EphemeralKeypair::generate();
        let init = Datagram::new(
            Uuid::nil(),
            Packet::Init(HandshakeInit {
                ephemeral: keypair.public_bytes(),
                timestamp_ms: now_ms,
                client_name: self.client_name.clone(),
            }),
        );

        self.keypair = Some(keypair);
        self.init = Some(init.clone());
        self.state = HandshakeState::AwaitingResponse;
        Ok(init)
    }

    /// Consume `HandshakeResponse` and produce `HandshakeConfirm`.
    ///
    /// `verifier` must be derived from the password with the salt and
    /// parameters carried in `response`.
    pub fn on_response(
        &mut self,
        session_id: Uuid,
        response: &HandshakeResponse,
        verifier: &PasswordVerifier,
    ) -> Result<Datagram, HandshakeError> {
        match self.state {
            HandshakeState::AwaitingResponse => {}
            HandshakeState::AwaitingConfirm if self.session_id == Some(session_id) => {
                // Our confirm was lost and the server resent its response.
                if let Some(confirm) = &self.confirm {
                    return Ok(confirm.clone());
                }
            }
            state => {
                return Err(HandshakeError::UnexpectedMessage(
                    PacketType::HandshakeResponse,
                    state,
                ))
            }
        }

        let (Some(keypair), Some(init)) = (&self.keypair, &self.init) else {
            return Err(HandshakeError::UnexpectedMessage(
                PacketType::HandshakeResponse,
                self.state,
            ));
        };
        let Packet::Init(init_body) = &init.packet else {
            return Err(HandshakeError::UnexpectedMessage(
                PacketType::HandshakeResponse,
                self.state,
            ));
        };

        let shared = keypair.agree(&response.ephemeral)?;
        let transcript = keys::transcript_hash(init_body, &session_id, response);
        let keys = keys::derive_session_keys(&shared, verifier.as_bytes(), &transcript)?;
        let proof_key = keys::derive_proof_key(&shared, verifier.as_bytes(), &transcript)?;
        let proof = proof_key.client_proof(&transcript)?;

        let confirm = Datagram::new(session_id, Packet::Confirm(HandshakeConfirm { proof }));

        self.keypair = None;
        self.session_id = Some(session_id);
        self.pending = Some(ClientPending {
            keys,
            proof_key,
            transcript,
        });
        self.confirm = Some(confirm.clone());
        self.state = HandshakeState::AwaitingConfirm;
        Ok(confirm)
    }

    /// `HandshakeConfirm` to retransmit while waiting for the ack.
    pub fn confirm_datagram(&self) -> Option<&Datagram> {
        self.confirm.as_ref()
    }

    /// Consume `HandshakeAck`, verify the server's proof and open the channel.
    pub fn on_ack(
        &mut self,
        session_id: Uuid,
        ack: &HandshakeAck,
    ) -> Result<SecureChannel, HandshakeError> {
        if self.state != HandshakeState::AwaitingConfirm {
            return Err(HandshakeError::UnexpectedMessage(
                PacketType::HandshakeAck,
                self.state,
            ));
        }
        if self.session_id != Some(session_id) {
            return Err(HandshakeError::SessionMismatch);
        }

        let Some(pending) = self.pending.take() else {
            return Err(HandshakeError::UnexpectedMessage(
                PacketType::HandshakeAck,
                self.state,
            ));
        };

        if !pending
            .proof_key
            .verify_server_proof(&pending.transcript, &ack.proof)
        {
            self.close();
            return Err(HandshakeError::AuthenticationFailed);
        }

        self.state = HandshakeState::Established;
        self.confirm = None;
        Ok(SecureChannel::new(
            Role::Client,
            session_id,
            pending.keys,
            self.config,
        ))
    }

    /// Abandon the handshake and wipe its secrets.
    pub fn close(&mut self) {
        self.state = HandshakeState::Closed;
        self.keypair = None;
        self.pending = None;
        self.confirm = None;
    }
}

/// Authentication material the server holds for a client.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub salt: Vec<u8>,
    pub kdf: KdfParams,
    pub verifier: PasswordVerifier,
}

/// Server side of the handshake for one half-open session.
pub struct ServerHandshake {
    state: HandshakeState,
    session_id: Uuid,
    client_name: String,
    client_ephemeral: [u8; 32],
    shared: Option<SharedSecret>,
    transcript: [u8; 32],
    verifier: PasswordVerifier,
    config: ChannelConfig,
}

impl std::fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("client_name", &self.client_name)
            .finish()
    }
}

impl ServerHandshake {
    /// Answer a `HandshakeInit` for a known, non-revoked client.
    ///
    /// Returns the half-open handshake (in `AwaitingConfirm`) and the
    /// `HandshakeResponse` to send.
    pub fn respond(
        init: &HandshakeInit,
        session_id: Uuid,
        credentials: &Credentials,
        now_ms: u64,
        config: ChannelConfig,
    ) -> Result<(Self, Datagram), HandshakeError> {
        if init.timestamp_ms.abs_diff(now_ms) > MAX_CLOCK_SKEW_MS {
            return Err(HandshakeError::StaleTimestamp);
        }

        let keypair = EphemeralKeypair::generate();
        let shared = keypair.agree(&init.ephemeral)?;

        let mut server_nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut server_nonce);

        let response = HandshakeResponse {
            ephemeral: keypair.public_bytes(),
            server_nonce,
            salt: credentials.salt.clone(),
            kdf: credentials.kdf,
        };
        let transcript = keys::transcript_hash(init, &session_id, &response);

        let handshake = Self {
            state: HandshakeState::AwaitingConfirm,
            session_id,
            client_name: init.client_name.clone(),
            client_ephemeral: init.ephemeral,
            shared: Some(shared),
            transcript,
            verifier: credentials.verifier.clone(),
            config,
        };
        Ok((handshake, Datagram::new(session_id, Packet::Response(response))))
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn client_ephemeral(&self) -> &[u8; 32] {
        &self.client_ephemeral
    }

    /// Whether this handshake was answered with `credentials`' verifier.
    /// False once the client's password has been rotated.
    pub fn issued_for(&self, credentials: &Credentials) -> bool {
        let diff = self
            .verifier
            .as_bytes()
            .iter()
            .zip(credentials.verifier.as_bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        diff == 0
    }

    /// Verify the client's proof.
    ///
    /// On success returns the server's channel and the `HandshakeAck` to
    /// send. On a bad proof the handshake moves to `Closed` for good.
    pub fn on_confirm(
        &mut self,
        confirm: &HandshakeConfirm,
    ) -> Result<(SecureChannel, Datagram), HandshakeError> {
        if self.state != HandshakeState::AwaitingConfirm {
            return Err(HandshakeError::UnexpectedMessage(
                PacketType::HandshakeConfirm,
                self.state,
            ));
        }

        let Some(shared) = self.shared.take() else {
            self.close();
            return Err(HandshakeError::AuthenticationFailed);
        };
        let proof_key =
            keys::derive_proof_key(&shared, self.verifier.as_bytes(), &self.transcript)?;
        if !proof_key.verify_client_proof(&self.transcript, &confirm.proof) {
            self.close();
            return Err(HandshakeError::AuthenticationFailed);
        }

        let keys = keys::derive_session_keys(&shared, self.verifier.as_bytes(), &self.transcript)?;
        let proof = proof_key.server_proof(&self.transcript)?;

        self.state = HandshakeState::Established;
        let channel = SecureChannel::new(Role::Server, self.session_id, keys, self.config);
        let ack = Datagram::new(self.session_id, Packet::Ack(HandshakeAck { proof }));
        Ok((channel, ack))
    }

    pub fn close(&mut self) {
        self.state = HandshakeState::Closed;
        self.shared = None;
    }
}
