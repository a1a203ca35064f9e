//! Error types for the BitChat mesh core.

use thiserror::Error;

/// Result type alias for mesh core operations
pub type Result<T> = std::result::Result<T, Error>;

/// BitChat mesh error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet too small: expected at least {expected} bytes, got {actual}")]
    PacketTooSmall { expected: usize, actual: usize },

    #[error("Invalid protocol version: expected {expected}, got {actual}")]
    InvalidVersion { expected: u8, actual: u8 },

    #[error("Payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Invalid fragment: {0}")]
    InvalidFragment(String),

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Session not established")]
    NotEstablished,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Decompression error: {0}")]
    DecompressionError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
