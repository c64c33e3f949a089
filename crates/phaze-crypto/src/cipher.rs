//! Per-frame AEAD with explicit counters.
//!
//! The 96-bit ChaCha20-Poly1305 nonce is four zero bytes followed by the
//! big-endian frame counter. Counters never repeat under one key, so nonces
//! never repeat either.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use thiserror::Error;

/// Cryptographic failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Any inbound authentication or decryption failure.
    #[error("frame rejected")]
    Rejected,

    #[error("encryption failed")]
    Seal,

    #[error("peer public key produced a non-contributory shared secret")]
    WeakKey,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("password hashing failed: {0}")]
    PasswordHash(String),
}

/// One direction's AEAD key.
pub struct PacketCipher {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketCipher(..)")
    }
}

impl PacketCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Encrypt `plaintext` under `counter`, binding `aad`.
    pub fn seal(
        &self,
        counter: u64,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(
                &counter_nonce(counter),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Seal)
    }

    /// Decrypt and authenticate. Every failure is [`CryptoError::Rejected`].
    pub fn open(
        &self,
        counter: u64,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(
                &counter_nonce(counter),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Rejected)
    }
}

/// Convert a frame counter to a 12-byte nonce.
fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(nonce_bytes)
}
