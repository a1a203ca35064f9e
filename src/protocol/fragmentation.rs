//! Fragmentation and reassembly for MTU-limited transports.
//!
//! Serialized packets above the fragment threshold are split into chunks,
//! each carried in a FRAGMENT packet whose payload is a 13-byte header
//! followed by the chunk:
//!
//! - FragmentID: 8 random bytes
//! - Index: u16, big-endian
//! - Total: u16, big-endian
//! - OriginalType: u8

use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use super::PeerId;
use crate::error::{Error, Result};

/// Fragment header size on the wire
pub const FRAGMENT_HEADER_SIZE: usize = 13;

/// Upper bound on fragments per message
pub const MAX_FRAGMENTS_PER_MESSAGE: u16 = 256;

/// Identifier shared by all fragments of one message
pub type FragmentId = [u8; 8];

/// Fragment header for message reconstruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub fragment_id: FragmentId,
    pub index: u16,
    pub total: u16,
    pub original_type: u8,
}

impl FragmentHeader {
    pub fn validate(&self) -> Result<()> {
        if self.total == 0 {
            return Err(Error::InvalidFragment("Total fragments is zero".into()));
        }
        if self.index >= self.total {
            return Err(Error::InvalidFragment(format!(
                "Fragment index {} out of bounds for total {}",
                self.index, self.total
            )));
        }
        if self.total > MAX_FRAGMENTS_PER_MESSAGE {
            return Err(Error::InvalidFragment(format!(
                "Total fragments {} exceeds cap {}",
                self.total, MAX_FRAGMENTS_PER_MESSAGE
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FRAGMENT_HEADER_SIZE);
        bytes.extend_from_slice(&self.fragment_id);
        bytes.extend_from_slice(&self.index.to_be_bytes());
        bytes.extend_from_slice(&self.total.to_be_bytes());
        bytes.push(self.original_type);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(Error::InvalidFragment("Fragment header too short".into()));
        }
        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&bytes[0..8]);
        let header = Self {
            fragment_id,
            index: u16::from_be_bytes([bytes[8], bytes[9]]),
            total: u16::from_be_bytes([bytes[10], bytes[11]]),
            original_type: bytes[12],
        };
        header.validate()?;
        Ok(header)
    }
}

/// One slice of a fragmented message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn to_wire_format(&self) -> Vec<u8> {
        let mut bytes = self.header.to_bytes();
        bytes.extend_from_slice(&self.data);
        bytes
    }

    pub fn from_wire_format(bytes: &[u8]) -> Result<Self> {
        let header = FragmentHeader::from_bytes(bytes)?;
        let data = bytes[FRAGMENT_HEADER_SIZE..].to_vec();
        if data.is_empty() {
            return Err(Error::InvalidFragment("Fragment carries no data".into()));
        }
        Ok(Self { header, data })
    }
}

/// Splits oversized messages into fragments
pub struct MessageFragmenter {
    max_fragment_size: usize,
}

impl MessageFragmenter {
    /// `max_fragment_size` bounds the fragment payload: header plus chunk
    pub fn new(max_fragment_size: usize) -> Self {
        debug_assert!(max_fragment_size > FRAGMENT_HEADER_SIZE);
        Self { max_fragment_size }
    }

    pub fn needs_fragmentation(&self, message_size: usize) -> bool {
        message_size > self.max_fragment_size
    }

    /// Split `data` into fragments sharing a fresh random fragment ID
    pub fn fragment(&self, data: &[u8], original_type: u8) -> Result<Vec<Fragment>> {
        if data.is_empty() {
            return Err(Error::InvalidFragment("Cannot fragment empty message".into()));
        }

        let mut fragment_id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut fragment_id);

        let chunk_size = self.max_fragment_size - FRAGMENT_HEADER_SIZE;
        let total = data.len().div_ceil(chunk_size);
        if total > MAX_FRAGMENTS_PER_MESSAGE as usize {
            return Err(Error::InvalidFragment(format!(
                "Message of {} bytes needs {} fragments, cap is {}",
                data.len(),
                total,
                MAX_FRAGMENTS_PER_MESSAGE
            )));
        }

        let fragments = data
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| Fragment {
                header: FragmentHeader {
                    fragment_id,
                    index: index as u16,
                    total: total as u16,
                    original_type,
                },
                data: chunk.to_vec(),
            })
            .collect();

        Ok(fragments)
    }
}

/// Partial assembly of one fragmented message
struct PendingAssembly {
    total: u16,
    original_type: u8,
    chunks: BTreeMap<u16, Vec<u8>>,
    last_activity: Instant,
}

impl PendingAssembly {
    fn new(header: &FragmentHeader) -> Self {
        Self {
            total: header.total,
            original_type: header.original_type,
            chunks: BTreeMap::new(),
            last_activity: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() == self.total as usize
    }

    fn reassemble(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in self.chunks.values() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// Reassembles fragments keyed by (sender, fragment ID)
pub struct MessageReassembler {
    pending: HashMap<(PeerId, FragmentId), PendingAssembly>,
    timeout: Duration,
}

impl MessageReassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Process a received fragment. Returns `Some((data, original_type))`
    /// when the message is complete. Duplicate indices are ignored (first
    /// write wins); headers inconsistent with the pending assembly are
    /// rejected.
    pub fn add_fragment(
        &mut self,
        sender: PeerId,
        fragment: Fragment,
    ) -> Result<Option<(Vec<u8>, u8)>> {
        fragment.header.validate()?;
        if fragment.data.is_empty() {
            return Err(Error::InvalidFragment("Fragment carries no data".into()));
        }

        if fragment.header.total == 1 {
            return Ok(Some((fragment.data, fragment.header.original_type)));
        }

        let key = (sender, fragment.header.fragment_id);
        let assembly = self
            .pending
            .entry(key)
            .or_insert_with(|| PendingAssembly::new(&fragment.header));

        if assembly.total != fragment.header.total
            || assembly.original_type != fragment.header.original_type
        {
            return Err(Error::InvalidFragment("Fragment header mismatch".into()));
        }

        assembly.chunks.entry(fragment.header.index).or_insert(fragment.data);
        assembly.last_activity = Instant::now();

        if assembly.is_complete() {
            let data = assembly.reassemble();
            let original_type = assembly.original_type;
            self.pending.remove(&key);
            Ok(Some((data, original_type)))
        } else {
            Ok(None)
        }
    }

    /// Drop assemblies with no activity within the timeout window
    pub fn cleanup_expired(&mut self) {
        let timeout = self.timeout;
        let now = Instant::now();
        self.pending
            .retain(|_, assembly| now.duration_since(assembly.last_activity) <= timeout);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
