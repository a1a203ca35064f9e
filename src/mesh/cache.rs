//! Cache of recently observed packets backing the sync engine.
//!
//! Keeps the serialized bytes of packets this node has seen (sent,
//! received, or relayed) so missing packets can be replayed to peers
//! during sync reconciliation.

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::protocol::fragmentation::{FragmentHeader, FRAGMENT_HEADER_SIZE};
use crate::protocol::{PacketId, PACKET_TYPE_FRAGMENT};

/// One cached packet, ready for retransmission
#[derive(Debug, Clone)]
pub struct CachedPacket {
    pub bytes: Vec<u8>,
    pub packet_type: u8,
    pub timestamp: u64,
    /// Fragment ID when `packet_type` is FRAGMENT
    pub fragment_id: Option<[u8; 8]>,
}

impl CachedPacket {
    pub fn new(bytes: Vec<u8>, packet_type: u8, timestamp: u64, payload: &[u8]) -> Self {
        let fragment_id = if packet_type == PACKET_TYPE_FRAGMENT
            && payload.len() >= FRAGMENT_HEADER_SIZE
        {
            FragmentHeader::from_bytes(payload)
                .ok()
                .map(|header| header.fragment_id)
        } else {
            None
        };
        Self {
            bytes,
            packet_type,
            timestamp,
            fragment_id,
        }
    }
}

/// LRU cache of recently observed serialized packets
pub struct PacketCache {
    entries: LruCache<PacketId, CachedPacket>,
}

impl PacketCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn insert(&mut self, id: PacketId, packet: CachedPacket) {
        self.entries.put(id, packet);
    }

    pub fn contains(&self, id: &PacketId) -> bool {
        self.entries.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of cached entries for a sync walk, most recent first
    pub fn snapshot(&self) -> Vec<(PacketId, CachedPacket)> {
        self.entries
            .iter()
            .map(|(id, packet)| (*id, packet.clone()))
            .collect()
    }
}
