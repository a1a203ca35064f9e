//! Identity key management.
//!
//! Supplies the local static X25519 key pair used by the Noise sessions and
//! the Ed25519 signing pair used for packet signatures. Keys are injected
//! at startup; nothing below this module generates persistent keys.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::protocol::{peer_id_from_public_key, PeerId};

/// X25519 static key pair for Noise handshakes
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NoiseKeyPair {
    private: [u8; 32],
    #[zeroize(skip)]
    public: [u8; 32],
}

impl NoiseKeyPair {
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        getrandom::getrandom(&mut private).expect("system randomness unavailable");
        Self::from_bytes(private)
    }

    pub fn from_bytes(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret).to_bytes();
        Self {
            private: secret.to_bytes(),
            public,
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.private
    }
}

impl std::fmt::Debug for NoiseKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseKeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Ed25519 signing key pair for packet signatures
#[derive(Debug, Clone)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        getrandom::getrandom(&mut secret_bytes).expect("system randomness unavailable");
        let pair = Self::from_bytes(secret_bytes);
        secret_bytes.zeroize();
        pair
    }

    pub fn from_bytes(private_bytes: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&private_bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(
        verifying_key: &VerifyingKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        verifying_key.verify(message, signature)
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// Combined identity: Noise static keys plus signing keys
#[derive(Debug, Clone)]
pub struct BitchatIdentity {
    pub noise_keypair: NoiseKeyPair,
    pub signing_keypair: SigningKeyPair,
}

impl BitchatIdentity {
    pub fn generate() -> Self {
        Self {
            noise_keypair: NoiseKeyPair::generate(),
            signing_keypair: SigningKeyPair::generate(),
        }
    }

    pub fn from_keys(noise_private: [u8; 32], signing_private: [u8; 32]) -> Self {
        Self {
            noise_keypair: NoiseKeyPair::from_bytes(noise_private),
            signing_keypair: SigningKeyPair::from_bytes(signing_private),
        }
    }

    /// Peer ID derived from the Noise static public key
    pub fn peer_id(&self) -> PeerId {
        peer_id_from_public_key(&self.noise_keypair.public_bytes())
    }

    /// Fingerprint of the local static public key
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.noise_keypair.public_bytes())
    }
}

/// SHA-256 hex of a public key; the stable identity handle for a peer
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(public_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_keypair_deterministic_public() {
        let private = [0x42u8; 32];
        let a = NoiseKeyPair::from_bytes(private);
        let b = NoiseKeyPair::from_bytes(private);
        assert_eq!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn test_distinct_keys_distinct_publics() {
        let a = NoiseKeyPair::generate();
        let b = NoiseKeyPair::generate();
        assert_ne!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn test_sign_verify() {
        let pair = SigningKeyPair::generate();
        let signature = pair.sign(b"message");
        let verifying = VerifyingKey::from_bytes(&pair.public_bytes()).unwrap();
        assert!(SigningKeyPair::verify(&verifying, b"message", &signature).is_ok());
        assert!(SigningKeyPair::verify(&verifying, b"other", &signature).is_err());
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let key = [1u8; 32];
        let fp = fingerprint(&key);
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint(&key));
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_peer_id_stable() {
        let identity = BitchatIdentity::from_keys([9u8; 32], [8u8; 32]);
        assert_eq!(identity.peer_id(), identity.peer_id());
    }
}
