//! Ephemeral key agreement and the session key schedule.

use hkdf::Hkdf;
use phaze_core::{HandshakeInit, HandshakeResponse, KEY_SIZE};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::CryptoError;
use crate::password::ProofKey;

const TRANSCRIPT_DOMAIN: &[u8] = b"phazevpn handshake v1";

const LABEL_C2S: &[u8] = b"phazevpn c2s";
const LABEL_S2C: &[u8] = b"phazevpn s2c";
const LABEL_CHAIN: &[u8] = b"phazevpn chaining";
const LABEL_PROOF: &[u8] = b"phazevpn proof key";

const LABEL_REKEY_C2S: &[u8] = b"phazevpn rekey c2s";
const LABEL_REKEY_S2C: &[u8] = b"phazevpn rekey s2c";
const LABEL_REKEY_CHAIN: &[u8] = b"phazevpn rekey chaining";

/// X25519 key pair used for a single exchange.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Diffie-Hellman with the peer's public key.
    ///
    /// Low-order peer keys yield an all-zero secret and are refused.
    pub fn agree(&self, peer_public: &[u8; KEY_SIZE]) -> Result<SharedSecret, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakKey);
        }
        Ok(SharedSecret(*shared.as_bytes()))
    }
}

impl std::fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &self.public.as_bytes())
            .finish()
    }
}

/// Raw X25519 output.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_SIZE]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Directional keys plus the chaining key for the next rekey.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub client_to_server: [u8; KEY_SIZE],
    pub server_to_client: [u8; KEY_SIZE],
    pub chaining: [u8; KEY_SIZE],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Hash of everything both sides said during the handshake.
pub fn transcript_hash(
    init: &HandshakeInit,
    session_id: &Uuid,
    response: &HandshakeResponse,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_DOMAIN);
    hasher.update(init.ephemeral);
    hasher.update(init.timestamp_ms.to_be_bytes());
    update_prefixed(&mut hasher, init.client_name.as_bytes());
    hasher.update(session_id.as_bytes());
    hasher.update(response.ephemeral);
    hasher.update(response.server_nonce);
    update_prefixed(&mut hasher, &response.salt);
    hasher.update(response.kdf.m_cost.to_be_bytes());
    hasher.update(response.kdf.t_cost.to_be_bytes());
    hasher.update(response.kdf.p_cost.to_be_bytes());

    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn update_prefixed(hasher: &mut Sha256, data: &[u8]) {
    hasher.update((data.len() as u32).to_be_bytes());
    hasher.update(data);
}

/// Derive the first epoch's keys.
///
/// The input keying material is the ephemeral shared secret followed by the
/// password verifier; the transcript hash is the salt.
pub fn derive_session_keys(
    shared: &SharedSecret,
    verifier: &[u8; 32],
    transcript_hash: &[u8; 32],
) -> Result<SessionKeys, CryptoError> {
    let hk = handshake_hkdf(shared, verifier, transcript_hash);
    expand_keys(&hk, LABEL_C2S, LABEL_S2C, LABEL_CHAIN)
}

/// Derive the key for the handshake proofs from the same material as the
/// session keys. Without the shared secret a transcript cannot be checked
/// against a guessed verifier.
pub fn derive_proof_key(
    shared: &SharedSecret,
    verifier: &[u8; 32],
    transcript_hash: &[u8; 32],
) -> Result<ProofKey, CryptoError> {
    let hk = handshake_hkdf(shared, verifier, transcript_hash);
    let mut okm = [0u8; 32];
    hk.expand(LABEL_PROOF, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    let key = ProofKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

fn handshake_hkdf(
    shared: &SharedSecret,
    verifier: &[u8; 32],
    transcript_hash: &[u8; 32],
) -> Hkdf<Sha256> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(shared.as_bytes());
    ikm[32..].copy_from_slice(verifier);
    let hk = Hkdf::<Sha256>::new(Some(transcript_hash), &ikm);
    ikm.zeroize();
    hk
}

/// Derive the next epoch's keys from the chaining key and a fresh exchange.
pub fn rekey(chaining: &[u8; 32], shared: &SharedSecret) -> Result<SessionKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(chaining), shared.as_bytes());
    expand_keys(&hk, LABEL_REKEY_C2S, LABEL_REKEY_S2C, LABEL_REKEY_CHAIN)
}

fn expand_keys(
    hk: &Hkdf<Sha256>,
    c2s: &[u8],
    s2c: &[u8],
    chain: &[u8],
) -> Result<SessionKeys, CryptoError> {
    let mut keys = SessionKeys {
        client_to_server: [0u8; KEY_SIZE],
        server_to_client: [0u8; KEY_SIZE],
        chaining: [0u8; KEY_SIZE],
    };
    hk.expand(c2s, &mut keys.client_to_server)
        .map_err(|_| CryptoError::KeyDerivation)?;
    hk.expand(s2c, &mut keys.server_to_client)
        .map_err(|_| CryptoError::KeyDerivation)?;
    hk.expand(chain, &mut keys.chaining)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaze_core::KdfParams;

    fn sample_messages() -> (HandshakeInit, HandshakeResponse) {
        (
            HandshakeInit {
                ephemeral: [1; 32],
                timestamp_ms: 1_700_000_000_000,
                client_name: "alice".into(),
            },
            HandshakeResponse {
                ephemeral: [2; 32],
                server_nonce: [3; 32],
                salt: vec![4; 16],
                kdf: KdfParams {
                    m_cost: 8,
                    t_cost: 1,
                    p_cost: 1,
                },
            },
        )
    }

    #[test]
    fn test_agreement_matches() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let ab = a.agree(&b.public_bytes()).unwrap();
        let ba = b.agree(&a.public_bytes()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let a = EphemeralKeypair::generate();
        assert_eq!(a.agree(&[0u8; 32]).unwrap_err(), CryptoError::WeakKey);
    }

    #[test]
    fn test_transcript_binds_every_field() {
        let (init, response) = sample_messages();
        let session_id = Uuid::new_v4();
        let base = transcript_hash(&init, &session_id, &response);

        let mut renamed = init.clone();
        renamed.client_name = "alicf".into();
        assert_ne!(base, transcript_hash(&renamed, &session_id, &response));

        let mut resalted = response.clone();
        resalted.salt[0] ^= 1;
        assert_ne!(base, transcript_hash(&init, &session_id, &resalted));

        assert_ne!(base, transcript_hash(&init, &Uuid::new_v4(), &response));
        assert_eq!(base, transcript_hash(&init, &session_id, &response));
    }

    #[test]
    fn test_directional_keys_independent() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let shared = a.agree(&b.public_bytes()).unwrap();
        let keys = derive_session_keys(&shared, &[9; 32], &[7; 32]).unwrap();

        assert_ne!(keys.client_to_server, keys.server_to_client);
        assert_ne!(keys.client_to_server, keys.chaining);

        let other = derive_session_keys(&shared, &[8; 32], &[7; 32]).unwrap();
        assert_ne!(keys.client_to_server, other.client_to_server);
    }

    #[test]
    fn test_proof_key_needs_shared_secret() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let verifier = [9u8; 32];
        let transcript = [7u8; 32];
        let shared = a.agree(&b.public_bytes()).unwrap();
        let key = derive_proof_key(&shared, &verifier, &transcript).unwrap();
        let proof = key.client_proof(&transcript).unwrap();

        // An eavesdropper who guesses the verifier exactly still cannot
        // reproduce the proof from the transcript alone.
        let guessed = ProofKey::from_bytes(verifier);
        assert!(!guessed.verify_client_proof(&transcript, &proof));

        let other_shared = a
            .agree(&EphemeralKeypair::generate().public_bytes())
            .unwrap();
        let other = derive_proof_key(&other_shared, &verifier, &transcript).unwrap();
        assert!(!other.verify_client_proof(&transcript, &proof));

        let again = derive_proof_key(&shared, &verifier, &transcript).unwrap();
        assert!(again.verify_client_proof(&transcript, &proof));

        let keys = derive_session_keys(&shared, &verifier, &transcript).unwrap();
        assert!(!ProofKey::from_bytes(keys.chaining).verify_client_proof(&transcript, &proof));
    }

    #[test]
    fn test_rekey_changes_keys() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let shared = a.agree(&b.public_bytes()).unwrap();
        let first = derive_session_keys(&shared, &[9; 32], &[7; 32]).unwrap();

        let fresh = a.agree(&EphemeralKeypair::generate().public_bytes()).unwrap();
        let next = rekey(&first.chaining, &fresh).unwrap();
        assert_ne!(first.client_to_server, next.client_to_server);
        assert_ne!(first.chaining, next.chaining);
    }
}
