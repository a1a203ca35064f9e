//! BitChat mesh core - protocol and session engine for a decentralized,
//! peer-to-peer Bluetooth LE mesh chat network.
//!
//! This library implements the wire protocol, Noise XX session layer,
//! mesh relay/deduplication logic, and gossip-based sync reconciliation.
//! Radio drivers, UI, and persistence live outside this crate and talk to
//! it through the narrow interfaces in [`transport`] and [`crypto`].

pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod mesh;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use config::{ProtocolConfig, SyncConfig};
pub use error::{Error, Result};
pub use mesh::{MeshEvent, MeshRouter};
pub use protocol::{BitchatPacket, PacketId, PeerId};
pub use session::{NoiseSessionManager, SessionEvent};
