//! Abstract transport interface.
//!
//! The mesh core does not drive radios. A transport (BLE GATT, TCP for
//! development, anything else) delivers byte frames and link events to the
//! router and accepts frames for unicast or broadcast. The router owns
//! fan-out across transports.

use async_trait::async_trait;
use std::net::SocketAddr;

use crate::error::Result;
use crate::protocol::PeerId;

/// Index of an attached transport within the router
pub type TransportId = usize;

/// Transport address types for different connection methods
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddress {
    /// Bluetooth device ID/address
    Bluetooth(String),
    /// TCP connection (development and testing)
    Tcp(SocketAddr),
    /// Abstract addressing by peer ID
    Mesh(PeerId),
}

impl std::fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportAddress::Bluetooth(id) => write!(f, "ble:{}", id),
            TransportAddress::Tcp(addr) => write!(f, "tcp:{}", addr),
            TransportAddress::Mesh(peer_id) => write!(f, "mesh:{}", hex::encode(peer_id)),
        }
    }
}

/// Events a transport reports to the router
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected {
        address: TransportAddress,
    },
    Disconnected {
        address: TransportAddress,
        reason: String,
    },
    DataReceived {
        address: TransportAddress,
        data: Vec<u8>,
    },
}

/// Core transport trait: unicast to one link, broadcast to all links
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &str;

    /// Send a frame to one connected link
    async fn send(&self, address: &TransportAddress, data: &[u8]) -> Result<()>;

    /// Send a frame to every connected link
    async fn broadcast(&self, data: &[u8]) -> Result<()>;
}
