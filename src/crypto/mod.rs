//! Cryptographic primitives and key management.
//!
//! The identity store supplies the long-lived Curve25519 static keys for
//! Noise and the Ed25519 keys for packet signatures. Channel encryption
//! derives AES-256 keys from channel passwords.

pub mod channel;
pub mod identity;

pub use channel::{derive_channel_key, ChannelCipher};
pub use identity::{fingerprint, BitchatIdentity, NoiseKeyPair, SigningKeyPair};
