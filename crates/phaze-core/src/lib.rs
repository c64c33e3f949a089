//! Core PhazeVPN protocol types, framing, and constants.
//!
//! This crate provides:
//! - The datagram header and handshake/transport message codecs
//! - Control frames carried inside encrypted transport frames
//! - The obfuscation carrier ("ghost mode") and the plain transport
//! - Small helpers for inspecting tunnelled IP packets

#![forbid(unsafe_code)]

pub mod control;
pub mod ip;
pub mod mode;
pub mod obfuscation;
pub mod wire;

pub use control::Control;
pub use mode::ClientMode;
pub use obfuscation::{
    transport_for, CarrierError, ObfuscatedTransport, ObfuscationKey, ObfuscationProfile,
    PlainTransport, Transport,
};
pub use wire::{
    Datagram, FrameFlags, HandshakeAck, HandshakeConfirm, HandshakeInit, HandshakeResponse,
    Header, KdfParams, Packet, PacketType, TransportFrame, WireError,
};

/// Magic byte identifying PhazeVPN protocol datagrams ('P').
pub const PHAZE_MAGIC: u8 = 0x50;

/// Current protocol version.
pub const PHAZE_VERSION: u8 = 1;

/// Size of the common datagram header.
pub const HEADER_SIZE: usize = 20;

/// Maximum size of an inner (un-obfuscated) datagram.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// X25519 public key / symmetric key length.
pub const KEY_SIZE: usize = 32;

/// Length of handshake proofs (HMAC-SHA256).
pub const PROOF_SIZE: usize = 32;

/// Length of the server nonce in `HandshakeResponse`.
pub const NONCE_SIZE: usize = 32;

/// Transport frame counter length.
pub const COUNTER_SIZE: usize = 8;

/// AEAD authentication tag length.
pub const TAG_SIZE: usize = 16;

/// Maximum client name length in bytes.
pub const MAX_CLIENT_NAME_LEN: usize = 64;

/// Maximum password salt length carried in `HandshakeResponse`.
pub const MAX_SALT_LEN: usize = 64;

/// Largest tunnel payload that fits in one transport frame.
pub const MAX_PAYLOAD_SIZE: usize =
    MAX_DATAGRAM_SIZE - HEADER_SIZE - COUNTER_SIZE - TAG_SIZE - control::CONTROL_KIND_SIZE;

/// Receive buffer size large enough for any carrier-wrapped datagram.
pub const RECV_BUFFER_SIZE: usize =
    MAX_DATAGRAM_SIZE + obfuscation::CARRIER_OVERHEAD + obfuscation::MAX_PADDING;
