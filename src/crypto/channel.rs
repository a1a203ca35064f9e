//! Password-derived channel encryption.
//!
//! Channel keys come from PBKDF2-HMAC-SHA256 over the channel password with
//! the channel name as salt. Channel messages are AES-256-GCM, wire-framed
//! as `iv || ciphertext || tag`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// PBKDF2 iteration count
const PBKDF2_ITERATIONS: u32 = 100_000;

/// AES-GCM IV length
const IV_SIZE: usize = 12;

/// AES-GCM authentication tag length
const TAG_SIZE: usize = 16;

/// Derive a 32-byte channel key from a channel name and password
pub fn derive_channel_key(channel_name: &str, password: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        channel_name.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut key,
    );
    key
}

/// AES-256-GCM cipher bound to one channel key
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChannelCipher {
    key: [u8; 32],
}

impl ChannelCipher {
    pub fn new(channel_name: &str, password: &str) -> Self {
        Self {
            key: derive_channel_key(channel_name, password),
        }
    }

    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Encrypt to `iv || ciphertext || tag` with a fresh random IV
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Crypto("Channel encryption failed".into()))?;

        let mut framed = Vec::with_capacity(IV_SIZE + ciphertext.len());
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    /// Decrypt `iv || ciphertext || tag`
    pub fn decrypt(&self, framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < IV_SIZE + TAG_SIZE {
            return Err(Error::Crypto(format!(
                "Channel ciphertext of {} bytes is shorter than iv plus tag",
                framed.len()
            )));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(&framed[..IV_SIZE]);

        cipher
            .decrypt(nonce, &framed[IV_SIZE..])
            .map_err(|_| Error::DecryptionFailed)
    }
}
