//! Wire protocol for the BitChat mesh.
//!
//! This module implements the binary packet model:
//! - Fixed header with flag-gated optional fields
//! - TLV (Type-Length-Value) encoding for typed payloads
//! - LZ4 compression for bandwidth efficiency
//! - Fragmentation for MTU-limited transports
//! - Ed25519 packet signatures

pub mod binary;
pub mod fragmentation;
pub mod tlv;

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::SigningKeyPair;
use crate::error::{Error, Result};
use binary::BinaryWriter;

/// Peer identifier - 8 bytes on the wire
pub type PeerId = [u8; 8];

/// Stable packet digest over (sender, timestamp, type, payload); used for
/// deduplication and sync reconciliation
pub type PacketId = [u8; 32];

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size: version + type + ttl + timestamp + flags + payload_len
pub const HEADER_SIZE: usize = 14;

pub const SENDER_ID_SIZE: usize = 8;
pub const RECIPIENT_ID_SIZE: usize = 8;
pub const SIGNATURE_SIZE: usize = 64;

/// Maximum payload length expressible in the 2-byte length field
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

// Flag bit positions
pub const FLAG_RECIPIENT_PRESENT: u8 = 0x01; // Bit 0
pub const FLAG_SIGNATURE_PRESENT: u8 = 0x02; // Bit 1
pub const FLAG_PAYLOAD_COMPRESSED: u8 = 0x04; // Bit 2
// Bits 3-7 reserved for future use

/// Packet type constants
pub const PACKET_TYPE_ANNOUNCE: u8 = 0x01;
pub const PACKET_TYPE_LEAVE: u8 = 0x03;
pub const PACKET_TYPE_MESSAGE: u8 = 0x04;
pub const PACKET_TYPE_NOISE_HANDSHAKE_INIT: u8 = 0x10;
pub const PACKET_TYPE_NOISE_HANDSHAKE_RESP: u8 = 0x11;
pub const PACKET_TYPE_NOISE_HANDSHAKE_FINAL: u8 = 0x12;
pub const PACKET_TYPE_NOISE_ENCRYPTED: u8 = 0x13;
pub const PACKET_TYPE_FRAGMENT: u8 = 0x20;
pub const PACKET_TYPE_REQUEST_SYNC: u8 = 0x30;
pub const PACKET_TYPE_FILE: u8 = 0x40;

/// Current time as milliseconds since the Unix epoch
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Derive a peer ID from a 32-byte public key (first 8 bytes of SHA-256)
pub fn peer_id_from_public_key(public_key: &[u8; 32]) -> PeerId {
    let digest = Sha256::digest(public_key);
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    id
}

/// Basic packet structure for the mesh wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitchatPacket {
    pub version: u8,
    pub packet_type: u8,
    pub ttl: u8,
    pub timestamp: u64,
    pub flags: u8,
    pub sender_id: PeerId,
    pub recipient_id: Option<PeerId>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl BitchatPacket {
    /// Create a broadcast packet with the given type, sender and payload
    pub fn new(packet_type: u8, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            ttl: crate::config::DEFAULT_INITIAL_TTL,
            timestamp: current_timestamp_millis(),
            flags: 0,
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    /// Address the packet to a single peer
    pub fn with_recipient(mut self, recipient_id: PeerId) -> Self {
        self.recipient_id = Some(recipient_id);
        self.flags |= FLAG_RECIPIENT_PRESENT;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// Stable packet ID over (sender_id, timestamp, type, payload).
    /// TTL and flags are excluded so relayed copies share the same ID.
    pub fn packet_id(&self) -> PacketId {
        let mut hasher = Sha256::new();
        hasher.update(self.sender_id);
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update([self.packet_type]);
        hasher.update(&self.payload);
        hasher.finalize().into()
    }

    /// Canonical bytes covered by the packet signature.
    ///
    /// TTL is zeroed and the signature/compression flag bits are cleared so
    /// relaying (which decrements TTL) and transport-level compression do
    /// not invalidate signatures.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: self.payload.len(),
                limit: MAX_PAYLOAD_SIZE,
            });
        }
        let mut writer = BinaryWriter::new();
        writer.write_u8(self.version);
        writer.write_u8(self.packet_type);
        writer.write_u8(0);
        writer.write_u64(self.timestamp);
        writer.write_u8(self.flags & !(FLAG_SIGNATURE_PRESENT | FLAG_PAYLOAD_COMPRESSED));
        writer.write_u16(self.payload.len() as u16);
        writer.write_bytes(&self.sender_id);
        if let Some(recipient) = &self.recipient_id {
            writer.write_bytes(recipient);
        }
        writer.write_bytes(&self.payload);
        Ok(writer.into_bytes())
    }

    /// Sign the packet with an Ed25519 signing key
    pub fn sign(&mut self, keypair: &SigningKeyPair) -> Result<()> {
        let message = self.signing_bytes()?;
        self.signature = Some(keypair.sign(&message).to_bytes());
        self.flags |= FLAG_SIGNATURE_PRESENT;
        Ok(())
    }

    /// Verify the packet signature against a known signing public key
    pub fn verify_signature(&self, public_key: &[u8; 32]) -> Result<()> {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        let signature = self
            .signature
            .ok_or_else(|| Error::InvalidSignature("No signature present".into()))?;
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
        let message = self.signing_bytes()?;
        key.verify(&message, &Signature::from_bytes(&signature))
            .map_err(|e| Error::InvalidSignature(e.to_string()))
    }

    /// Serialized size after header packing, before compression
    pub fn wire_size(&self) -> usize {
        let mut size = HEADER_SIZE + SENDER_ID_SIZE + self.payload.len();
        if self.recipient_id.is_some() {
            size += RECIPIENT_ID_SIZE;
        }
        if self.signature.is_some() {
            size += SIGNATURE_SIZE;
        }
        size
    }
}
