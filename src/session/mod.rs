//! Session management for the mesh.
//!
//! Holds the per-peer Noise sessions, applies the handshake tie-breaker,
//! expires stale pending handshakes, and enforces the session cap. Session
//! lifecycle events flow to subscribers over a channel; no component lock
//! is held while invoking crypto.

pub mod noise;

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::crypto::BitchatIdentity;
use crate::error::{Error, Result};
use crate::protocol::PeerId;

pub use noise::{
    FailureReason, NoiseRole, NoiseSession, SessionState, HANDSHAKE_MSG1_SIZE,
    HANDSHAKE_MSG2_SIZE, HANDSHAKE_MSG3_SIZE, MAX_HANDSHAKE_MESSAGE_SIZE,
};

/// Hard cap on concurrent sessions when not overridden by configuration
pub const MAX_SESSIONS: usize = 50;

/// Canonicalize a peer identifier for the handshake tie-breaker: hex,
/// lowercased, zero-padded to 64 chars; identifiers longer than 64 chars
/// are replaced by the SHA-256 hex of their bytes.
pub fn canonical_identifier(identifier: &str) -> String {
    let lower = identifier.to_lowercase();
    if lower.len() > 64 {
        return hex::encode(Sha256::digest(lower.as_bytes()));
    }
    format!("{:0<64}", lower)
}

/// Handshake tie-breaker: the side whose static public key hex sorts
/// lexicographically below the canonicalized peer identifier initiates;
/// the other side waits for msg1.
pub fn should_initiate(local_static_public: &[u8; 32], remote_identifier: &str) -> bool {
    hex::encode(local_static_public) < canonical_identifier(remote_identifier)
}

/// Tie-breaker variant for when the remote static public key is known
pub fn should_initiate_with_key(
    local_static_public: &[u8; 32],
    remote_static_public: &[u8; 32],
) -> bool {
    hex::encode(local_static_public) < hex::encode(remote_static_public)
}

/// A "first" XX handshake message: exactly 32 bytes of a plausible
/// ephemeral key (not degenerate all-zero / all-0xFF content)
pub fn is_initial_handshake_message(message: &[u8]) -> bool {
    message.len() == HANDSHAKE_MSG1_SIZE
        && !message.iter().all(|&b| b == 0x00)
        && !message.iter().all(|&b| b == 0xFF)
}

/// Session lifecycle events delivered to subscribers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Established {
        peer_id: PeerId,
        remote_static_public: [u8; 32],
    },
    Failed {
        peer_id: PeerId,
        reason: FailureReason,
    },
}

struct PendingHandshake {
    started_at: Instant,
    #[allow(dead_code)]
    role: NoiseRole,
}

/// Manager for all per-peer Noise sessions
pub struct NoiseSessionManager {
    identity: Arc<BitchatIdentity>,
    max_sessions: usize,
    pending_timeout: Duration,
    sessions: RwLock<HashMap<PeerId, Arc<Mutex<NoiseSession>>>>,
    pending: RwLock<HashMap<PeerId, PendingHandshake>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl NoiseSessionManager {
    pub fn new(
        identity: Arc<BitchatIdentity>,
        max_sessions: usize,
        pending_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                identity,
                max_sessions,
                pending_timeout,
                sessions: RwLock::new(HashMap::new()),
                pending: RwLock::new(HashMap::new()),
                events,
            },
            receiver,
        )
    }

    /// Whether this node should open the handshake toward `peer_id`
    pub fn should_initiate_to(&self, peer_id: &PeerId) -> bool {
        should_initiate(
            &self.identity.noise_keypair.public_bytes(),
            &hex::encode(peer_id),
        )
    }

    /// Begin a handshake as initiator; returns msg1 for the wire
    pub async fn initiate_handshake(&self, peer_id: PeerId) -> Result<Vec<u8>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(existing) = sessions.get(&peer_id) {
                let state = existing.lock().await.state();
                match state {
                    SessionState::Established => {
                        return Err(Error::InvalidState(
                            "Session already established; rekey by replacing it".into(),
                        ))
                    }
                    SessionState::Handshaking { .. } | SessionState::Uninitialized => {
                        return Err(Error::InvalidState("Handshake already in progress".into()))
                    }
                    SessionState::Failed(_) => {} // replace below
                }
            }
        }

        let session = self.create_session(peer_id, NoiseRole::Initiator).await?;
        let mut guard = session.lock().await;
        match guard.start_handshake() {
            Ok(msg1) => Ok(msg1),
            Err(e) => {
                drop(guard);
                self.discard(peer_id, FailureReason::Crypto).await;
                Err(e)
            }
        }
    }

    /// Feed an incoming handshake message for `peer_id`; returns the
    /// response to send back, if any.
    ///
    /// A fresh first message tears down whatever session exists (dual
    /// initiation is resolved by the tie-breaker before anyone transmits,
    /// so a stray msg1 means the remote won the race or rekeyed).
    pub async fn handle_handshake_message(
        &self,
        peer_id: PeerId,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let fresh_start = is_initial_handshake_message(message);
        let existing = self.sessions.read().await.get(&peer_id).cloned();

        let session = match existing {
            Some(session) => {
                let state = session.lock().await.state();
                match state {
                    SessionState::Established | SessionState::Handshaking { .. }
                    | SessionState::Uninitialized
                        if fresh_start =>
                    {
                        debug!(peer = %hex::encode(peer_id), "Restarting session on fresh handshake init");
                        session.lock().await.destroy();
                        self.remove_entry(&peer_id).await;
                        self.create_session(peer_id, NoiseRole::Responder).await?
                    }
                    SessionState::Failed(_) => {
                        self.remove_entry(&peer_id).await;
                        if fresh_start {
                            self.create_session(peer_id, NoiseRole::Responder).await?
                        } else {
                            return Err(Error::SessionNotFound);
                        }
                    }
                    // Stale mid-handshake bytes must not tear down a live
                    // transport session
                    SessionState::Established => return Ok(None),
                    _ => session,
                }
            }
            None => {
                if !fresh_start {
                    // Mid-handshake message for a session we do not have
                    return Err(Error::SessionNotFound);
                }
                self.create_session(peer_id, NoiseRole::Responder).await?
            }
        };

        let result = {
            let mut guard = session.lock().await;
            let result = guard.process_handshake(message);
            (result, guard.state(), guard.remote_static_public())
        };

        match result {
            (Ok(response), SessionState::Established, Some(remote_static_public)) => {
                self.pending.write().await.remove(&peer_id);
                let _ = self.events.send(SessionEvent::Established {
                    peer_id,
                    remote_static_public,
                });
                Ok(response)
            }
            (Ok(response), _, _) => Ok(response),
            (Err(e), state, _) => {
                let reason = match state {
                    SessionState::Failed(reason) => reason,
                    _ => FailureReason::Crypto,
                };
                self.discard(peer_id, reason).await;
                Err(e)
            }
        }
    }

    /// Encrypt a transport payload for an established peer session
    pub async fn encrypt_for(&self, peer_id: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let session = self.get_session(peer_id).await?;
        let mut guard = session.lock().await;
        guard.encrypt(plaintext)
    }

    /// Decrypt a transport payload from an established peer session
    pub async fn decrypt_from(&self, peer_id: &PeerId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let session = self.get_session(peer_id).await?;
        let mut guard = session.lock().await;
        guard.decrypt(ciphertext)
    }

    pub async fn is_established(&self, peer_id: &PeerId) -> bool {
        match self.sessions.read().await.get(peer_id) {
            Some(session) => session.lock().await.is_established(),
            None => false,
        }
    }

    pub async fn remote_static_public(&self, peer_id: &PeerId) -> Option<[u8; 32]> {
        let session = self.sessions.read().await.get(peer_id).cloned()?;
        let guard = session.lock().await;
        guard.remote_static_public()
    }

    pub async fn needs_rekey(&self, peer_id: &PeerId) -> bool {
        match self.sessions.read().await.get(peer_id) {
            Some(session) => session.lock().await.needs_rekey(),
            None => false,
        }
    }

    /// Destroy and forget the session for `peer_id`
    pub async fn remove_session(&self, peer_id: &PeerId) {
        if let Some(session) = self.sessions.write().await.remove(peer_id) {
            session.lock().await.destroy();
        }
        self.pending.write().await.remove(peer_id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Expire stale pending handshakes and enforce the session cap
    pub async fn cleanup(&self) {
        let expired: Vec<PeerId> = {
            let pending = self.pending.read().await;
            pending
                .iter()
                .filter(|(_, entry)| entry.started_at.elapsed() > self.pending_timeout)
                .map(|(peer_id, _)| *peer_id)
                .collect()
        };

        for peer_id in expired {
            warn!(peer = %hex::encode(peer_id), "Pending handshake timed out");
            self.discard(peer_id, FailureReason::TimedOut).await;
        }

        self.enforce_session_cap(0).await;
    }

    /// Spawn the periodic cleanup duty
    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.cleanup().await;
            }
        })
    }

    async fn get_session(&self, peer_id: &PeerId) -> Result<Arc<Mutex<NoiseSession>>> {
        self.sessions
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or(Error::SessionNotFound)
    }

    async fn create_session(
        &self,
        peer_id: PeerId,
        role: NoiseRole,
    ) -> Result<Arc<Mutex<NoiseSession>>> {
        self.enforce_session_cap(1).await;
        if self.sessions.read().await.len() >= self.max_sessions {
            return Err(Error::ResourceExhausted(format!(
                "Session cap of {} reached with all sessions established",
                self.max_sessions
            )));
        }

        let session = Arc::new(Mutex::new(NoiseSession::new(
            peer_id,
            role,
            &self.identity.noise_keypair.private_bytes(),
        )?));

        self.sessions.write().await.insert(peer_id, Arc::clone(&session));
        self.pending.write().await.insert(
            peer_id,
            PendingHandshake {
                started_at: Instant::now(),
                role,
            },
        );
        Ok(session)
    }

    /// Evict oldest non-established sessions until `headroom` slots are free
    async fn enforce_session_cap(&self, headroom: usize) {
        loop {
            let over = {
                let sessions = self.sessions.read().await;
                sessions.len() + headroom > self.max_sessions
            };
            if !over {
                return;
            }

            let mut victim: Option<(PeerId, Instant)> = None;
            {
                let sessions = self.sessions.read().await;
                for (peer_id, session) in sessions.iter() {
                    let guard = session.lock().await;
                    if guard.is_established() {
                        continue;
                    }
                    let started = Instant::now() - guard.age();
                    if victim.map(|(_, oldest)| started < oldest).unwrap_or(true) {
                        victim = Some((*peer_id, started));
                    }
                }
            }

            match victim {
                Some((peer_id, _)) => {
                    debug!(peer = %hex::encode(peer_id), "Evicting non-established session at cap");
                    self.discard(peer_id, FailureReason::Destroyed).await;
                }
                None => return, // every session is established; nothing to evict
            }
        }
    }

    async fn remove_entry(&self, peer_id: &PeerId) {
        self.sessions.write().await.remove(peer_id);
        self.pending.write().await.remove(peer_id);
    }

    /// Remove a session and signal failure to subscribers
    async fn discard(&self, peer_id: PeerId, reason: FailureReason) {
        if let Some(session) = self.sessions.write().await.remove(&peer_id) {
            session.lock().await.destroy();
        }
        self.pending.write().await.remove(&peer_id);
        let _ = self.events.send(SessionEvent::Failed { peer_id, reason });
    }
}
