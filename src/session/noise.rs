//! Per-peer Noise XX session state machine.
//!
//! Protocol: `Noise_XX_25519_ChaChaPoly_SHA256`. One `NoiseSession` drives
//! the three-message handshake and, after the split, the transport ciphers
//! for both directions. Nonces are owned by the cipher state and never
//! reset; rekeying replaces the whole session.

use snow::{Builder, HandshakeState, TransportState};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::protocol::PeerId;

/// Noise protocol pattern
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// XX message sizes with empty handshake payloads:
/// msg1 = e; msg2 = e, ee, s, es + payload tag; msg3 = s, se + payload tag
pub const HANDSHAKE_MSG1_SIZE: usize = 32;
pub const HANDSHAKE_MSG2_SIZE: usize = 96;
pub const HANDSHAKE_MSG3_SIZE: usize = 64;

/// Handshake messages above this size are rejected outright
pub const MAX_HANDSHAKE_MESSAGE_SIZE: usize = 200;

/// AEAD tag appended to every transport-mode ciphertext
pub const TAG_SIZE: usize = 16;

/// Sessions older than this want a replacement handshake
const MAX_SESSION_AGE: Duration = Duration::from_secs(3600);

/// Sessions past this many total messages want a replacement handshake
const MAX_SESSION_MESSAGES: u64 = 10_000;

/// Which side of the handshake this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseRole {
    Initiator,
    Responder,
}

/// Why a session ended up in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Handshake message size did not match the expected step
    BadMessageSize,
    /// Decryption or MAC failure during the handshake
    Crypto,
    /// Message arrived in a state that cannot accept it
    UnexpectedMessage,
    /// Explicitly destroyed
    Destroyed,
    /// Pending handshake expired
    TimedOut,
}

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking { step: u8 },
    Established,
    Failed(FailureReason),
}

/// One Noise session with a remote peer
pub struct NoiseSession {
    peer_id: PeerId,
    role: NoiseRole,
    state: SessionState,
    handshake: Option<HandshakeState>,
    transport: Option<TransportState>,
    remote_static_public: Option<[u8; 32]>,
    handshake_hash: Option<[u8; 32]>,
    created_at: Instant,
    sent_count: u64,
    recv_count: u64,
}

impl NoiseSession {
    /// Build a session around the injected local static key. The session
    /// never generates persistent keys itself.
    pub fn new(peer_id: PeerId, role: NoiseRole, local_static_private: &[u8; 32]) -> Result<Self> {
        let params = NOISE_PATTERN
            .parse()
            .map_err(|e| Error::Crypto(format!("Invalid noise params: {}", e)))?;
        let builder = Builder::new(params).local_private_key(local_static_private)?;
        let handshake = match role {
            NoiseRole::Initiator => builder.build_initiator()?,
            NoiseRole::Responder => builder.build_responder()?,
        };

        Ok(Self {
            peer_id,
            role,
            state: SessionState::Uninitialized,
            handshake: Some(handshake),
            transport: None,
            remote_static_public: None,
            handshake_hash: None,
            created_at: Instant::now(),
            sent_count: 0,
            recv_count: 0,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn role(&self) -> NoiseRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Remote static public key; available once the handshake reached the
    /// message that carries it
    pub fn remote_static_public(&self) -> Option<[u8; 32]> {
        self.remote_static_public
    }

    /// Channel-binding hash of the completed handshake
    pub fn handshake_hash(&self) -> Option<[u8; 32]> {
        self.handshake_hash
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_count
    }

    pub fn recv_count(&self) -> u64 {
        self.recv_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Emit the first handshake message. Initiator only, from
    /// `Uninitialized`.
    pub fn start_handshake(&mut self) -> Result<Vec<u8>> {
        if self.role != NoiseRole::Initiator {
            return Err(Error::InvalidState(
                "Only the initiator starts a handshake".into(),
            ));
        }
        if self.state != SessionState::Uninitialized {
            return Err(Error::InvalidState(format!(
                "Cannot start handshake from {:?}",
                self.state
            )));
        }

        let handshake = self
            .handshake
            .as_mut()
            .ok_or_else(|| Error::InvalidState("Handshake state missing".into()))?;
        let mut buffer = vec![0u8; MAX_HANDSHAKE_MESSAGE_SIZE];
        let len = match handshake.write_message(&[], &mut buffer) {
            Ok(len) => len,
            Err(e) => {
                self.fail(FailureReason::Crypto);
                return Err(e.into());
            }
        };
        buffer.truncate(len);

        self.state = SessionState::Handshaking { step: 1 };
        Ok(buffer)
    }

    /// Drive the handshake with an incoming message; returns the outgoing
    /// message if this step produces one. On the final step the transport
    /// ciphers are derived and the session becomes `Established`.
    pub fn process_handshake(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>> {
        let expected = match (self.role, self.state) {
            (NoiseRole::Responder, SessionState::Uninitialized) => HANDSHAKE_MSG1_SIZE,
            (NoiseRole::Initiator, SessionState::Handshaking { step: 1 }) => HANDSHAKE_MSG2_SIZE,
            (NoiseRole::Responder, SessionState::Handshaking { step: 2 }) => HANDSHAKE_MSG3_SIZE,
            _ => {
                self.fail(FailureReason::UnexpectedMessage);
                return Err(Error::HandshakeFailed(format!(
                    "Unexpected handshake message in state {:?}",
                    self.state
                )));
            }
        };

        if message.len() > MAX_HANDSHAKE_MESSAGE_SIZE || message.len() != expected {
            self.fail(FailureReason::BadMessageSize);
            return Err(Error::HandshakeFailed(format!(
                "Handshake message of {} bytes, expected {}",
                message.len(),
                expected
            )));
        }

        let handshake = self
            .handshake
            .as_mut()
            .ok_or_else(|| Error::InvalidState("Handshake state missing".into()))?;

        let mut payload = vec![0u8; MAX_HANDSHAKE_MESSAGE_SIZE];
        if let Err(e) = handshake.read_message(message, &mut payload) {
            self.fail(FailureReason::Crypto);
            return Err(e.into());
        }

        if self.handshake.as_ref().map(|h| h.is_handshake_finished()) == Some(true) {
            // Responder consumed msg3; nothing further to send
            self.split()?;
            return Ok(None);
        }

        let handshake = self
            .handshake
            .as_mut()
            .ok_or_else(|| Error::InvalidState("Handshake state missing".into()))?;
        let mut response = vec![0u8; MAX_HANDSHAKE_MESSAGE_SIZE];
        let len = match handshake.write_message(&[], &mut response) {
            Ok(len) => len,
            Err(e) => {
                self.fail(FailureReason::Crypto);
                return Err(e.into());
            }
        };
        response.truncate(len);

        if self.handshake.as_ref().map(|h| h.is_handshake_finished()) == Some(true) {
            // Initiator just wrote msg3
            self.split()?;
        } else {
            self.state = SessionState::Handshaking { step: 2 };
        }

        Ok(Some(response))
    }

    /// Derive transport ciphers and capture the remote identity
    fn split(&mut self) -> Result<()> {
        let handshake = self
            .handshake
            .take()
            .ok_or_else(|| Error::InvalidState("Handshake state missing".into()))?;

        let remote_static = handshake
            .get_remote_static()
            .ok_or_else(|| {
                self.state = SessionState::Failed(FailureReason::Crypto);
                Error::HandshakeFailed("Remote static key missing after handshake".into())
            })?
            .try_into()
            .map_err(|_| Error::HandshakeFailed("Remote static key has wrong length".into()))?;

        let hash = handshake
            .get_handshake_hash()
            .try_into()
            .map_err(|_| Error::HandshakeFailed("Handshake hash has wrong length".into()))?;

        let transport = match handshake.into_transport_mode() {
            Ok(transport) => transport,
            Err(e) => {
                self.state = SessionState::Failed(FailureReason::Crypto);
                return Err(e.into());
            }
        };

        self.remote_static_public = Some(remote_static);
        self.handshake_hash = Some(hash);
        self.transport = Some(transport);
        self.state = SessionState::Established;
        Ok(())
    }

    /// AEAD-encrypt in transport mode; output includes the 16-byte tag
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let transport = match (&self.state, self.transport.as_mut()) {
            (SessionState::Established, Some(transport)) => transport,
            _ => return Err(Error::NotEstablished),
        };

        let mut buffer = vec![0u8; plaintext.len() + TAG_SIZE];
        let len = transport
            .write_message(plaintext, &mut buffer)
            .map_err(|_| Error::Crypto("Transport encryption failed".into()))?;
        buffer.truncate(len);

        self.sent_count += 1;
        Ok(buffer)
    }

    /// AEAD-decrypt in transport mode. Failure drops the packet without
    /// tearing down the session.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let transport = match (&self.state, self.transport.as_mut()) {
            (SessionState::Established, Some(transport)) => transport,
            _ => return Err(Error::NotEstablished),
        };

        if ciphertext.len() < TAG_SIZE {
            return Err(Error::DecryptionFailed);
        }
        let mut buffer = vec![0u8; ciphertext.len()];
        let len = transport
            .read_message(ciphertext, &mut buffer)
            .map_err(|_| Error::DecryptionFailed)?;
        buffer.truncate(len);

        self.recv_count += 1;
        Ok(buffer)
    }

    /// Whether the session is due for replacement: older than an hour or
    /// past 10,000 total messages
    pub fn needs_rekey(&self) -> bool {
        self.age() > MAX_SESSION_AGE || self.sent_count + self.recv_count > MAX_SESSION_MESSAGES
    }

    /// Drop cipher and handshake states (snow zeroizes key material on
    /// drop) and mark the session failed. Subsequent operations return
    /// `NotEstablished`.
    pub fn destroy(&mut self) {
        self.handshake = None;
        self.transport = None;
        self.state = SessionState::Failed(FailureReason::Destroyed);
    }

    fn fail(&mut self, reason: FailureReason) {
        self.handshake = None;
        self.transport = None;
        self.state = SessionState::Failed(reason);
    }

    #[cfg(test)]
    pub(crate) fn force_counts(&mut self, sent: u64, recv: u64) {
        self.sent_count = sent;
        self.recv_count = recv;
    }
}

impl std::fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSession")
            .field("peer_id", &hex::encode(self.peer_id))
            .field("role", &self.role)
            .field("state", &self.state)
            .field("sent_count", &self.sent_count)
            .field("recv_count", &self.recv_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NoiseKeyPair;

    fn session_pair() -> (NoiseSession, NoiseSession) {
        let a_keys = NoiseKeyPair::generate();
        let b_keys = NoiseKeyPair::generate();
        let a = NoiseSession::new([0xAA; 8], NoiseRole::Initiator, &a_keys.private_bytes()).unwrap();
        let b = NoiseSession::new([0xBB; 8], NoiseRole::Responder, &b_keys.private_bytes()).unwrap();
        (a, b)
    }

    fn establish(a: &mut NoiseSession, b: &mut NoiseSession) {
        let msg1 = a.start_handshake().unwrap();
        let msg2 = b.process_handshake(&msg1).unwrap().unwrap();
        let msg3 = a.process_handshake(&msg2).unwrap().unwrap();
        assert!(b.process_handshake(&msg3).unwrap().is_none());
    }

    #[test]
    fn test_handshake_message_sizes() {
        let (mut a, mut b) = session_pair();

        let msg1 = a.start_handshake().unwrap();
        assert_eq!(msg1.len(), HANDSHAKE_MSG1_SIZE);
        assert_eq!(a.state(), SessionState::Handshaking { step: 1 });

        let msg2 = b.process_handshake(&msg1).unwrap().unwrap();
        assert_eq!(msg2.len(), HANDSHAKE_MSG2_SIZE);
        assert_eq!(b.state(), SessionState::Handshaking { step: 2 });

        let msg3 = a.process_handshake(&msg2).unwrap().unwrap();
        assert_eq!(msg3.len(), HANDSHAKE_MSG3_SIZE);
        assert!(a.is_established());

        assert!(b.process_handshake(&msg3).unwrap().is_none());
        assert!(b.is_established());
    }

    #[test]
    fn test_mutual_static_keys_and_hash() {
        let a_keys = NoiseKeyPair::generate();
        let b_keys = NoiseKeyPair::generate();
        let mut a =
            NoiseSession::new([1u8; 8], NoiseRole::Initiator, &a_keys.private_bytes()).unwrap();
        let mut b =
            NoiseSession::new([2u8; 8], NoiseRole::Responder, &b_keys.private_bytes()).unwrap();
        establish(&mut a, &mut b);

        assert_eq!(a.remote_static_public(), Some(b_keys.public_bytes()));
        assert_eq!(b.remote_static_public(), Some(a_keys.public_bytes()));
        assert_eq!(a.handshake_hash(), b.handshake_hash());
        assert!(a.handshake_hash().is_some());
    }

    #[test]
    fn test_transport_round_trip() {
        let (mut a, mut b) = session_pair();
        establish(&mut a, &mut b);

        let ciphertext = a.encrypt(b"hello").unwrap();
        assert_eq!(ciphertext.len(), 5 + TAG_SIZE);
        assert_eq!(b.decrypt(&ciphertext).unwrap(), b"hello");
        assert_eq!(a.sent_count(), 1);
        assert_eq!(b.recv_count(), 1);

        // Both directions work
        let reply = b.encrypt(b"hi back").unwrap();
        assert_eq!(a.decrypt(&reply).unwrap(), b"hi back");
    }

    #[test]
    fn test_decrypt_failure_keeps_session_established() {
        let (mut a, mut b) = session_pair();
        establish(&mut a, &mut b);

        let mut ciphertext = a.encrypt(b"hello").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(matches!(b.decrypt(&ciphertext), Err(Error::DecryptionFailed)));
        assert!(b.is_established());
        assert_eq!(b.recv_count(), 0);
    }

    #[test]
    fn test_encrypt_before_established_fails() {
        let (mut a, _) = session_pair();
        assert!(matches!(a.encrypt(b"x"), Err(Error::NotEstablished)));
    }

    #[test]
    fn test_wrong_size_message_fails_session() {
        let (mut a, mut b) = session_pair();
        let _ = a.start_handshake().unwrap();
        assert!(b.process_handshake(&[0u8; 33]).is_err());
        assert_eq!(
            b.state(),
            SessionState::Failed(FailureReason::BadMessageSize)
        );
    }

    #[test]
    fn test_oversize_message_rejected() {
        let (_, mut b) = session_pair();
        assert!(b.process_handshake(&[0u8; 250]).is_err());
        assert_eq!(
            b.state(),
            SessionState::Failed(FailureReason::BadMessageSize)
        );
    }

    #[test]
    fn test_garbage_msg2_fails_with_crypto() {
        let (mut a, _) = session_pair();
        let _ = a.start_handshake().unwrap();
        assert!(a.process_handshake(&[0x55u8; HANDSHAKE_MSG2_SIZE]).is_err());
        assert_eq!(a.state(), SessionState::Failed(FailureReason::Crypto));
    }

    #[test]
    fn test_responder_cannot_start() {
        let (_, mut b) = session_pair();
        assert!(b.start_handshake().is_err());
    }

    #[test]
    fn test_destroy_transitions_to_failed() {
        let (mut a, mut b) = session_pair();
        establish(&mut a, &mut b);

        a.destroy();
        assert_eq!(a.state(), SessionState::Failed(FailureReason::Destroyed));
        assert!(matches!(a.encrypt(b"x"), Err(Error::NotEstablished)));
        assert!(matches!(a.decrypt(b"xxxxxxxxxxxxxxxxx"), Err(Error::NotEstablished)));
        // Remote identity stays observable after destroy
        assert!(a.remote_static_public().is_some());
    }

    #[test]
    fn test_needs_rekey_on_message_count() {
        let (mut a, mut b) = session_pair();
        establish(&mut a, &mut b);

        assert!(!a.needs_rekey());
        a.force_counts(5_000, 5_000);
        assert!(!a.needs_rekey());
        a.force_counts(5_000, 5_001);
        assert!(a.needs_rekey());
    }

    #[test]
    fn test_nonce_advances_identical_plaintexts() {
        let (mut a, mut b) = session_pair();
        establish(&mut a, &mut b);

        let c1 = a.encrypt(b"same").unwrap();
        let c2 = a.encrypt(b"same").unwrap();
        assert_ne!(c1, c2);
        assert_eq!(b.decrypt(&c1).unwrap(), b"same");
        assert_eq!(b.decrypt(&c2).unwrap(), b"same");
    }
}
