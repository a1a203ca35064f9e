//! Mesh networking layer.
//!
//! The router deduplicates, relays, and delivers packets across attached
//! transports; the seen-set bounds duplicate memory; the GCS filter and
//! sync engine reconcile missed packets between directly-connected peers.

pub mod cache;
pub mod gcs;
pub mod router;
pub mod seen;
pub mod sync;

use uuid::Uuid;

use crate::protocol::tlv::{ChatMessage, FilePayload, PrivateMessage};
use crate::protocol::{BitchatPacket, PeerId};
use crate::session::FailureReason;

pub use gcs::{GcsFilter, GcsParams};
pub use router::MeshRouter;
pub use seen::SeenSet;
pub use sync::SyncEngine;

/// Events the mesh core surfaces to the application
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A verified announce bound a peer identity to a link
    PeerAnnounced {
        peer_id: PeerId,
        nickname: String,
        noise_public: [u8; 32],
    },
    /// A peer's link dropped
    PeerDisconnected { peer_id: PeerId },
    /// A peer broadcast a graceful departure
    PeerLeft { peer_id: PeerId },
    /// Broadcast or channel chat
    MessageReceived { from: PeerId, message: ChatMessage },
    /// Decrypted private message addressed to this node
    PrivateMessageReceived {
        from: PeerId,
        message: PrivateMessage,
    },
    ReadReceiptReceived { from: PeerId, message_id: Uuid },
    DeliveryAckReceived { from: PeerId, message_id: Uuid },
    FileReceived { from: PeerId, file: FilePayload },
    /// Directed packet of a type the core does not interpret
    PacketReceived { packet: BitchatPacket },
    SessionEstablished {
        peer_id: PeerId,
        remote_static_public: [u8; 32],
    },
    SessionFailed {
        peer_id: PeerId,
        reason: FailureReason,
    },
}
