//! Obfuscation carrier ("ghost mode").
//!
//! The carrier hides the plain framing from traffic classifiers: every
//! byte on the wire is indistinguishable from random and datagram sizes are
//! randomized with padding. For full ghost mode the sender also adds a
//! small random delay before each datagram.
//!
//! # Carrier format
//!
//! ```text
//! [nonce 12] [ChaCha20-Poly1305(obfs_key, nonce, len u16 || frame || padding)]
//! ```
//!
//! The obfuscation key is derived from a server-wide pre-shared secret that
//! is handed to ghost-mode clients at provisioning time. It provides no
//! confidentiality beyond what the inner framing already has; its job is to
//! make the framing unrecognizable.
//!
//! Both transports implement [`Transport`], so the framing layer above never
//! knows which one it is talking through.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, Rng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::mode::ClientMode;
use crate::TAG_SIZE;

/// Carrier nonce length.
pub const CARRIER_NONCE_SIZE: usize = 12;

/// Bytes added by the carrier before padding.
pub const CARRIER_OVERHEAD: usize = CARRIER_NONCE_SIZE + 2 + TAG_SIZE;

/// Upper bound of padding any profile adds.
pub const MAX_PADDING: usize = 256;

const OBFS_SALT: &[u8] = b"phazevpn-obfs-v1";
const OBFS_INFO: &[u8] = b"carrier key";

/// Carrier errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CarrierError {
    /// Anything that fails to unwrap; deliberately carries no detail.
    #[error("malformed carrier")]
    Malformed,

    #[error("frame too large for carrier: {0} bytes")]
    FrameTooLarge(usize),

    #[error("ghost mode requires an obfuscation secret")]
    MissingKey,

    #[error("obfuscation secret must not be empty")]
    EmptySecret,
}

/// Symmetric key of the carrier.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ObfuscationKey([u8; 32]);

impl ObfuscationKey {
    /// Derive the carrier key from the pre-shared obfuscation secret.
    pub fn derive(secret: &[u8]) -> Result<Self, CarrierError> {
        if secret.is_empty() {
            return Err(CarrierError::EmptySecret);
        }
        let hk = Hkdf::<Sha256>::new(Some(OBFS_SALT), secret);
        let mut key = [0u8; 32];
        hk.expand(OBFS_INFO, &mut key)
            .map_err(|_| CarrierError::EmptySecret)?;
        Ok(Self(key))
    }
}

impl fmt::Debug for ObfuscationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ObfuscationKey(..)")
    }
}

/// Shape parameters of the carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObfuscationProfile {
    /// Maximum random padding added per datagram.
    pub max_padding: usize,
    /// Maximum random delay before sending.
    pub max_jitter: Duration,
}

impl ObfuscationProfile {
    /// Profile for a client mode; `None` for standard mode.
    pub fn for_mode(mode: ClientMode) -> Option<Self> {
        match mode {
            ClientMode::Standard => None,
            ClientMode::SemiGhost => Some(Self {
                max_padding: 64,
                max_jitter: Duration::ZERO,
            }),
            ClientMode::FullGhost => Some(Self {
                max_padding: MAX_PADDING,
                max_jitter: Duration::from_millis(25),
            }),
        }
    }
}

/// Outer datagram shape: wraps framed datagrams for the wire and unwraps
/// received ones.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Wrap an inner datagram for sending.
    fn wrap(&self, frame: &[u8]) -> Result<Vec<u8>, CarrierError>;

    /// Recover the inner datagram from a received one.
    fn unwrap(&self, datagram: &[u8]) -> Result<Vec<u8>, CarrierError>;

    /// Delay to apply before sending the next datagram.
    fn send_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Whether this transport uses the carrier.
    fn is_obfuscated(&self) -> bool;
}

/// Pass-through transport for standard-mode clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTransport;

impl Transport for PlainTransport {
    fn wrap(&self, frame: &[u8]) -> Result<Vec<u8>, CarrierError> {
        Ok(frame.to_vec())
    }

    fn unwrap(&self, datagram: &[u8]) -> Result<Vec<u8>, CarrierError> {
        Ok(datagram.to_vec())
    }

    fn is_obfuscated(&self) -> bool {
        false
    }
}

/// Carrier transport for ghost-mode clients.
pub struct ObfuscatedTransport {
    cipher: ChaCha20Poly1305,
    profile: ObfuscationProfile,
}

impl fmt::Debug for ObfuscatedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObfuscatedTransport")
            .field("profile", &self.profile)
            .finish()
    }
}

impl ObfuscatedTransport {
    pub fn new(key: &ObfuscationKey, profile: ObfuscationProfile) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new((&key.0).into()),
            profile,
        }
    }

    pub fn profile(&self) -> ObfuscationProfile {
        self.profile
    }
}

impl Transport for ObfuscatedTransport {
    fn wrap(&self, frame: &[u8]) -> Result<Vec<u8>, CarrierError> {
        let frame_len =
            u16::try_from(frame.len()).map_err(|_| CarrierError::FrameTooLarge(frame.len()))?;

        let padding = if self.profile.max_padding > 0 {
            rand::thread_rng().gen_range(0..=self.profile.max_padding)
        } else {
            0
        };

        let mut body = Vec::with_capacity(2 + frame.len() + padding);
        body.extend_from_slice(&frame_len.to_be_bytes());
        body.extend_from_slice(frame);
        body.resize(2 + frame.len() + padding, 0);

        let mut nonce_bytes = [0u8; CARRIER_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(&nonce, body.as_slice())
            .map_err(|_| CarrierError::FrameTooLarge(frame.len()))?;

        let mut out = Vec::with_capacity(CARRIER_NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn unwrap(&self, datagram: &[u8]) -> Result<Vec<u8>, CarrierError> {
        if datagram.len() < CARRIER_OVERHEAD {
            return Err(CarrierError::Malformed);
        }

        let (nonce_bytes, sealed) = datagram.split_at(CARRIER_NONCE_SIZE);
        let body = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| CarrierError::Malformed)?;

        let frame_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        if 2 + frame_len > body.len() {
            return Err(CarrierError::Malformed);
        }

        Ok(body[2..2 + frame_len].to_vec())
    }

    fn send_delay(&self) -> Duration {
        let max_ms = self.profile.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    fn is_obfuscated(&self) -> bool {
        true
    }
}

/// Select the transport a client mode requires.
pub fn transport_for(
    mode: ClientMode,
    key: Option<&ObfuscationKey>,
) -> Result<Arc<dyn Transport>, CarrierError> {
    match ObfuscationProfile::for_mode(mode) {
        None => Ok(Arc::new(PlainTransport)),
        Some(profile) => {
            let key = key.ok_or(CarrierError::MissingKey)?;
            Ok(Arc::new(ObfuscatedTransport::new(key, profile)))
        }
    }
}
