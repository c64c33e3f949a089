//! Password verifiers and handshake proofs.
//!
//! The registry never stores a password. It stores
//! `Argon2id(password, salt, params)`, the *verifier*, and the client
//! recomputes the same value from the password it was provisioned with.
//!
//! Proofs are HMAC-SHA256 over the handshake transcript hash, with distinct
//! labels for each direction. The key is a [`ProofKey`], derived from the
//! ephemeral shared secret together with the verifier, so a recorded
//! handshake gives an eavesdropper nothing to test password guesses against.

use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use phaze_core::{KdfParams, PROOF_SIZE};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Length of a verifier.
pub const VERIFIER_SIZE: usize = 32;

/// Length of freshly generated salts.
pub const SALT_SIZE: usize = 16;

/// Argon2id parameters for newly provisioned clients (19 MiB, 2 passes).
pub const DEFAULT_KDF_PARAMS: KdfParams = KdfParams {
    m_cost: 19_456,
    t_cost: 2,
    p_cost: 1,
};

const CLIENT_PROOF_LABEL: &[u8] = b"phazevpn client proof";
const SERVER_PROOF_LABEL: &[u8] = b"phazevpn server proof";

/// Slow-hashed password digest.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PasswordVerifier([u8; VERIFIER_SIZE]);

impl std::fmt::Debug for PasswordVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordVerifier(..)")
    }
}

impl PasswordVerifier {
    /// Run Argon2id over the password. Deliberately slow; keep it off the
    /// receive path.
    pub fn derive(password: &[u8], salt: &[u8], kdf: KdfParams) -> Result<Self, CryptoError> {
        let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(VERIFIER_SIZE))
            .map_err(|e| CryptoError::PasswordHash(e.to_string()))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut out = [0u8; VERIFIER_SIZE];
        argon
            .hash_password_into(password, salt, &mut out)
            .map_err(|e| CryptoError::PasswordHash(e.to_string()))?;
        Ok(Self(out))
    }

    pub fn from_bytes(bytes: [u8; VERIFIER_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERIFIER_SIZE] {
        &self.0
    }
}

/// Key for the handshake proofs of one session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ProofKey([u8; 32]);

impl std::fmt::Debug for ProofKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProofKey(..)")
    }
}

impl ProofKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Proof sent by the client in `HandshakeConfirm`.
    pub fn client_proof(
        &self,
        transcript_hash: &[u8; 32],
    ) -> Result<[u8; PROOF_SIZE], CryptoError> {
        self.proof(CLIENT_PROOF_LABEL, transcript_hash)
    }

    /// Proof sent by the server in `HandshakeAck`.
    pub fn server_proof(
        &self,
        transcript_hash: &[u8; 32],
    ) -> Result<[u8; PROOF_SIZE], CryptoError> {
        self.proof(SERVER_PROOF_LABEL, transcript_hash)
    }

    /// Constant-time check of a client proof.
    pub fn verify_client_proof(&self, transcript_hash: &[u8; 32], proof: &[u8]) -> bool {
        self.verify(CLIENT_PROOF_LABEL, transcript_hash, proof)
    }

    /// Constant-time check of a server proof.
    pub fn verify_server_proof(&self, transcript_hash: &[u8; 32], proof: &[u8]) -> bool {
        self.verify(SERVER_PROOF_LABEL, transcript_hash, proof)
    }

    fn mac(&self, label: &[u8], transcript_hash: &[u8; 32]) -> Result<HmacSha256, CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.0)
            .map_err(|_| CryptoError::KeyDerivation)?;
        mac.update(label);
        mac.update(transcript_hash);
        Ok(mac)
    }

    fn proof(
        &self,
        label: &[u8],
        transcript_hash: &[u8; 32],
    ) -> Result<[u8; PROOF_SIZE], CryptoError> {
        let tag = self.mac(label, transcript_hash)?.finalize().into_bytes();
        let mut out = [0u8; PROOF_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    fn verify(&self, label: &[u8], transcript_hash: &[u8; 32], proof: &[u8]) -> bool {
        match self.mac(label, transcript_hash) {
            Ok(mac) => mac.verify_slice(proof).is_ok(),
            Err(_) => false,
        }
    }
}

/// Random salt for a new verifier.
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHEAP: KdfParams = KdfParams {
        m_cost: 8,
        t_cost: 1,
        p_cost: 1,
    };

    #[test]
    fn test_derive_is_deterministic() {
        let salt = generate_salt();
        let a = PasswordVerifier::derive(b"hunter22", &salt, CHEAP).unwrap();
        let b = PasswordVerifier::derive(b"hunter22", &salt, CHEAP).unwrap();
        assert_eq!(a, b);

        let other_salt = PasswordVerifier::derive(b"hunter22", &generate_salt(), CHEAP).unwrap();
        assert_ne!(a, other_salt);

        let other_password = PasswordVerifier::derive(b"hunter23", &salt, CHEAP).unwrap();
        assert_ne!(a, other_password);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let bad = KdfParams {
            m_cost: 1,
            t_cost: 0,
            p_cost: 1,
        };
        assert!(matches!(
            PasswordVerifier::derive(b"pw", &generate_salt(), bad),
            Err(CryptoError::PasswordHash(_))
        ));
    }

    #[test]
    fn test_proofs_verify() {
        let key = ProofKey::from_bytes([5; 32]);
        let transcript = [6u8; 32];

        let client = key.client_proof(&transcript).unwrap();
        let server = key.server_proof(&transcript).unwrap();
        assert_ne!(client, server);

        assert!(key.verify_client_proof(&transcript, &client));
        assert!(key.verify_server_proof(&transcript, &server));
        // Proofs are direction-bound
        assert!(!key.verify_client_proof(&transcript, &server));
        assert!(!key.verify_client_proof(&[7u8; 32], &client));
        assert!(!key.verify_client_proof(&transcript, &client[..16]));

        let other = ProofKey::from_bytes([4; 32]);
        assert!(!other.verify_client_proof(&transcript, &client));
    }
}
