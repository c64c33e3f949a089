//! PhazeVPN wire protocol.
//!
//! Every inner datagram (what remains after the obfuscation carrier, if any,
//! has been removed) shares a 20-byte header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Magic (0x50) |    Version    |     Type      |    Flags      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Session ID                            |
//! |                         (16 bytes)                            |
//! |                                                               |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `HandshakeInit` carries the nil session ID (the server assigns one in its
//! response); every other type must carry a non-nil ID.
//!
//! Bodies:
//!
//! ```text
//! HandshakeInit      [ephemeral 32][timestamp_ms u64][name_len u8][name]
//! HandshakeResponse  [ephemeral 32][server_nonce 32][salt_len u8][salt]
//!                    [m_cost u32][t_cost u32][p_cost u32]
//! HandshakeConfirm   [auth_proof 32]
//! HandshakeAck       [server_proof 32]
//! Transport          [counter u64][ciphertext || tag]
//! ```
//!
//! All integers are big-endian.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    COUNTER_SIZE, HEADER_SIZE, KEY_SIZE, MAX_CLIENT_NAME_LEN, MAX_DATAGRAM_SIZE, MAX_SALT_LEN,
    NONCE_SIZE, PHAZE_MAGIC, PHAZE_VERSION, PROOF_SIZE, TAG_SIZE,
};

/// Datagram types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client -> server: ephemeral key and identity.
    HandshakeInit = 0x01,
    /// Server -> client: ephemeral key, nonce and password parameters.
    HandshakeResponse = 0x02,
    /// Client -> server: authentication proof.
    HandshakeConfirm = 0x03,
    /// Server -> client: session established, server proof.
    HandshakeAck = 0x04,
    /// Encrypted transport frame (payload or control).
    Transport = 0x10,
}

impl PacketType {
    /// Whether this type belongs to the handshake (routed by source address).
    pub fn is_handshake(self) -> bool {
        !matches!(self, PacketType::Transport)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::HandshakeInit),
            0x02 => Ok(Self::HandshakeResponse),
            0x03 => Ok(Self::HandshakeConfirm),
            0x04 => Ok(Self::HandshakeAck),
            0x10 => Ok(Self::Transport),
            _ => Err(WireError::UnknownPacketType(value)),
        }
    }
}

bitflags::bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// Key phase of a transport frame; flips on every rekey.
        const KEY_PHASE = 0x01;
    }
}

/// Wire protocol errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short: {0} bytes, minimum {1}")]
    TooShort(usize, usize),

    #[error("datagram too large: {0} bytes, maximum {1}")]
    TooLarge(usize, usize),

    #[error("invalid magic byte: 0x{0:02x}")]
    InvalidMagic(u8),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("unknown control kind: 0x{0:02x}")]
    UnknownControl(u8),

    #[error("unexpected session id for {0:?}")]
    UnexpectedSessionId(PacketType),

    #[error("malformed datagram: {0}")]
    Malformed(&'static str),
}

/// Datagram header (20 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version.
    pub version: u8,
    /// Datagram type.
    pub packet_type: PacketType,
    /// Flag bits.
    pub flags: FrameFlags,
    /// Session identifier (nil for `HandshakeInit`).
    pub session_id: Uuid,
}

impl Header {
    /// Create a new header with no flags set.
    pub fn new(packet_type: PacketType, session_id: Uuid) -> Self {
        Self {
            version: PHAZE_VERSION,
            packet_type,
            flags: FrameFlags::empty(),
            session_id,
        }
    }

    /// Encode into a fixed array (used as AEAD associated data).
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = PHAZE_MAGIC;
        out[1] = self.version;
        out[2] = self.packet_type as u8;
        out[3] = self.flags.bits();
        out[4..20].copy_from_slice(self.session_id.as_bytes());
        out
    }

    /// Decode header from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::TooShort(buf.len(), HEADER_SIZE));
        }

        if buf[0] != PHAZE_MAGIC {
            return Err(WireError::InvalidMagic(buf[0]));
        }

        let version = buf[1];
        if version != PHAZE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let packet_type = PacketType::try_from(buf[2])?;
        let flags = FrameFlags::from_bits_truncate(buf[3]);

        let mut session_bytes = [0u8; 16];
        session_bytes.copy_from_slice(&buf[4..20]);
        let session_id = Uuid::from_bytes(session_bytes);

        Ok(Self {
            version,
            packet_type,
            flags,
            session_id,
        })
    }

    /// Quick check if a buffer might be a plain PhazeVPN datagram.
    ///
    /// This is a fast pre-check before full parsing.
    pub fn quick_check(buf: &[u8]) -> bool {
        buf.len() >= HEADER_SIZE && buf[0] == PHAZE_MAGIC && buf[1] == PHAZE_VERSION
    }
}

/// Argon2 cost parameters the client needs to derive its password verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    /// Iterations.
    pub t_cost: u32,
    /// Parallelism.
    pub p_cost: u32,
}

impl KdfParams {
    /// Encoded size in bytes.
    pub const SIZE: usize = 12;
}

/// `HandshakeInit` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInit {
    /// Client ephemeral X25519 public key.
    pub ephemeral: [u8; KEY_SIZE],
    /// Client wall clock in Unix milliseconds.
    pub timestamp_ms: u64,
    /// Registered client name.
    pub client_name: String,
}

impl HandshakeInit {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.ephemeral);
        buf.put_u64(self.timestamp_ms);
        buf.put_u8(self.client_name.len() as u8);
        buf.put_slice(self.client_name.as_bytes());
    }

    fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        let ephemeral = r.array::<KEY_SIZE>()?;
        let timestamp_ms = r.u64()?;
        let name_len = r.u8()? as usize;
        if name_len == 0 || name_len > MAX_CLIENT_NAME_LEN {
            return Err(WireError::Malformed("client name length"));
        }
        let name = r.take(name_len)?;
        let client_name = std::str::from_utf8(name)
            .map_err(|_| WireError::Malformed("client name encoding"))?
            .to_string();
        r.finish()?;

        Ok(Self {
            ephemeral,
            timestamp_ms,
            client_name,
        })
    }
}

/// `HandshakeResponse` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Server ephemeral X25519 public key.
    pub ephemeral: [u8; KEY_SIZE],
    /// Fresh random nonce bound into the transcript.
    pub server_nonce: [u8; NONCE_SIZE],
    /// The client's password salt.
    pub salt: Vec<u8>,
    /// Password hashing parameters.
    pub kdf: KdfParams,
}

impl HandshakeResponse {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.ephemeral);
        buf.put_slice(&self.server_nonce);
        buf.put_u8(self.salt.len() as u8);
        buf.put_slice(&self.salt);
        buf.put_u32(self.kdf.m_cost);
        buf.put_u32(self.kdf.t_cost);
        buf.put_u32(self.kdf.p_cost);
    }

    fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        let ephemeral = r.array::<KEY_SIZE>()?;
        let server_nonce = r.array::<NONCE_SIZE>()?;
        let salt_len = r.u8()? as usize;
        if salt_len == 0 || salt_len > MAX_SALT_LEN {
            return Err(WireError::Malformed("salt length"));
        }
        let salt = r.take(salt_len)?.to_vec();
        let kdf = KdfParams {
            m_cost: r.u32()?,
            t_cost: r.u32()?,
            p_cost: r.u32()?,
        };
        r.finish()?;

        Ok(Self {
            ephemeral,
            server_nonce,
            salt,
            kdf,
        })
    }
}

/// `HandshakeConfirm` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfirm {
    /// Keyed hash over the transcript proving knowledge of the password.
    pub proof: [u8; PROOF_SIZE],
}

/// `HandshakeAck` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAck {
    /// Keyed hash proving the server holds the client's verifier.
    pub proof: [u8; PROOF_SIZE],
}

/// Encrypted transport frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFrame {
    /// Per-direction frame counter (also the AEAD nonce).
    pub counter: u64,
    /// Ciphertext including the trailing authentication tag.
    pub ciphertext: Vec<u8>,
}

/// Parsed datagram body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Init(HandshakeInit),
    Response(HandshakeResponse),
    Confirm(HandshakeConfirm),
    Ack(HandshakeAck),
    Transport(TransportFrame),
}

impl Packet {
    /// Datagram type of this body.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Init(_) => PacketType::HandshakeInit,
            Packet::Response(_) => PacketType::HandshakeResponse,
            Packet::Confirm(_) => PacketType::HandshakeConfirm,
            Packet::Ack(_) => PacketType::HandshakeAck,
            Packet::Transport(_) => PacketType::Transport,
        }
    }
}

/// A full inner datagram: header plus typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub header: Header,
    pub packet: Packet,
}

impl Datagram {
    /// Build a datagram, deriving the header type from the body.
    pub fn new(session_id: Uuid, packet: Packet) -> Self {
        Self {
            header: Header::new(packet.packet_type(), session_id),
            packet,
        }
    }

    /// Build a transport datagram with the given key phase.
    pub fn transport(session_id: Uuid, key_phase: bool, frame: TransportFrame) -> Self {
        let mut header = Header::new(PacketType::Transport, session_id);
        header.flags.set(FrameFlags::KEY_PHASE, key_phase);
        Self {
            header,
            packet: Packet::Transport(frame),
        }
    }

    /// Header of a transport frame with the given key phase (AEAD associated data).
    pub fn transport_header(session_id: Uuid, key_phase: bool) -> Header {
        let mut header = Header::new(PacketType::Transport, session_id);
        header.flags.set(FrameFlags::KEY_PHASE, key_phase);
        header
    }

    /// Serialize to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 128);
        buf.put_slice(&self.header.to_bytes());

        match &self.packet {
            Packet::Init(init) => init.encode_into(&mut buf),
            Packet::Response(resp) => resp.encode_into(&mut buf),
            Packet::Confirm(confirm) => buf.put_slice(&confirm.proof),
            Packet::Ack(ack) => buf.put_slice(&ack.proof),
            Packet::Transport(frame) => {
                buf.put_u64(frame.counter);
                buf.put_slice(&frame.ciphertext);
            }
        }

        buf.to_vec()
    }

    /// Parse a datagram. Never panics on arbitrary input.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(WireError::TooLarge(buf.len(), MAX_DATAGRAM_SIZE));
        }

        let header = Header::decode(buf)?;
        let body = &buf[HEADER_SIZE..];

        let expects_nil = header.packet_type == PacketType::HandshakeInit;
        if header.session_id.is_nil() != expects_nil {
            return Err(WireError::UnexpectedSessionId(header.packet_type));
        }

        let packet = match header.packet_type {
            PacketType::HandshakeInit => Packet::Init(HandshakeInit::decode(body)?),
            PacketType::HandshakeResponse => Packet::Response(HandshakeResponse::decode(body)?),
            PacketType::HandshakeConfirm => {
                let mut r = Reader::new(body);
                let proof = r.array::<PROOF_SIZE>()?;
                r.finish()?;
                Packet::Confirm(HandshakeConfirm { proof })
            }
            PacketType::HandshakeAck => {
                let mut r = Reader::new(body);
                let proof = r.array::<PROOF_SIZE>()?;
                r.finish()?;
                Packet::Ack(HandshakeAck { proof })
            }
            PacketType::Transport => {
                let mut r = Reader::new(body);
                let counter = r.u64()?;
                let ciphertext = r.rest();
                if ciphertext.len() < TAG_SIZE {
                    return Err(WireError::TooShort(
                        buf.len(),
                        HEADER_SIZE + COUNTER_SIZE + TAG_SIZE,
                    ));
                }
                Packet::Transport(TransportFrame {
                    counter,
                    ciphertext: ciphertext.to_vec(),
                })
            }
        };

        Ok(Self { header, packet })
    }
}

/// Bounds-checked cursor over a datagram body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(WireError::Malformed("length overflow"))?;
        if end > self.buf.len() {
            return Err(WireError::TooShort(self.buf.len(), end));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.array::<8>()?))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn finish(&self) -> Result<(), WireError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(WireError::Malformed("trailing bytes"))
        }
    }
}
