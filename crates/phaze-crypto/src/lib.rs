//! Cryptographic core for PhazeVPN.
//!
//! This crate provides:
//! - X25519 ephemeral key agreement and the HKDF-SHA256 key schedule
//! - ChaCha20-Poly1305 packet cipher with counter-derived nonces
//! - Replay window for out-of-order UDP delivery
//! - Argon2id password verifiers and HMAC handshake proofs
//! - Sans-I/O client and server handshake state machines
//! - The secure channel used once a session is established, including
//!   in-band rekeying
//!
//! # Design
//!
//! The handshake is four messages: `Init`, `Response`, `Confirm`, `Ack`.
//! Both sides contribute an ephemeral X25519 key; the client proves
//! knowledge of its password with a keyed hash over the transcript and the
//! server answers with its own proof, so each side authenticates the other.
//! The proof key comes from the ephemeral shared secret and the verifier
//! together, so a passive observer cannot grind passwords against a
//! recorded handshake.
//! Final keys mix the ephemeral shared secret with the password verifier, so
//! an attacker needs both to read traffic.
//!
//! Transport frames carry an explicit 64-bit counter used as the AEAD
//! nonce, which allows decryption of reordered datagrams.

#![forbid(unsafe_code)]

pub mod channel;
pub mod cipher;
pub mod handshake;
pub mod keys;
pub mod password;
pub mod replay;

pub use channel::{
    ChannelConfig, ChannelError, Received, RejectReason, RekeyPolicy, Role, SecureChannel,
};
pub use cipher::{CryptoError, PacketCipher};
pub use handshake::{
    unix_millis, ClientHandshake, Credentials, HandshakeError, HandshakeState, ServerHandshake,
};
pub use keys::{EphemeralKeypair, SessionKeys, SharedSecret};
pub use password::{PasswordVerifier, ProofKey, DEFAULT_KDF_PARAMS};
pub use replay::ReplayWindow;
