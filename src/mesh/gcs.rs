//! Golomb-Coded Set filter.
//!
//! A compact, probabilistic, ordered set over packet IDs with a tunable
//! false-positive rate of about 2^-P. Used to summarize the seen-set for
//! sync reconciliation: elements are mapped into `[0, M)` with
//! `M = N * 2^P`, sorted, delta-encoded, and each delta is written as a
//! unary quotient followed by P binary remainder bits.

use bitvec::prelude::*;

use crate::error::{Error, Result};
use crate::protocol::PacketId;

/// Largest supported Golomb-Rice parameter
pub const MAX_P: u8 = 32;

/// Filter parameters derived from a byte budget and a target
/// false-positive rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcsParams {
    /// Golomb-Rice parameter; the false-positive rate is about 2^-p
    pub p: u8,
    /// Largest element count that fits the byte budget
    pub n_max: usize,
}

impl GcsParams {
    /// Derive parameters from `(max_bytes, target_fpr)`.
    ///
    /// `p = max(1, round(-log2(target_fpr)))`; the element cap follows the
    /// expected `p + 1.44` bits per entry.
    pub fn derive(max_bytes: usize, target_fpr: f64) -> Self {
        let p = (-target_fpr.log2()).round().clamp(1.0, MAX_P as f64) as u8;
        let n_max = ((max_bytes * 8) as f64 / (p as f64 + 1.44)).floor() as usize;
        Self {
            p,
            n_max: n_max.max(1),
        }
    }
}

/// An immutable Golomb-coded set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsFilter {
    p: u8,
    m: u64,
    /// Sorted distinct mapped values, kept for queries
    values: Vec<u64>,
    data: Vec<u8>,
}

impl GcsFilter {
    /// Build a filter over the given packet IDs
    pub fn build(ids: &[PacketId], p: u8) -> Result<Self> {
        if ids.is_empty() {
            return Err(Error::InvalidInput("Cannot build an empty GCS filter".into()));
        }
        if p == 0 || p > MAX_P {
            return Err(Error::InvalidInput(format!("GCS parameter p={} out of range", p)));
        }

        let m = (ids.len() as u64) << p;
        let mut values: Vec<u64> = ids.iter().map(|id| map_to_range(id, m)).collect();
        values.sort_unstable();
        values.dedup();

        let data = encode_deltas(&values, p);
        Ok(Self { p, m, values, data })
    }

    /// Reconstruct a filter from wire parameters and packed bits
    pub fn from_parts(p: u8, m: u64, data: &[u8]) -> Result<Self> {
        if p == 0 || p > MAX_P {
            return Err(Error::InvalidInput(format!("GCS parameter p={} out of range", p)));
        }
        if m == 0 {
            return Err(Error::InvalidInput("GCS domain m must be positive".into()));
        }
        let values = decode_deltas(data, p);
        Ok(Self {
            p,
            m,
            values,
            data: data.to_vec(),
        })
    }

    /// Membership test; false positives occur at roughly rate 2^-p
    pub fn contains(&self, id: &PacketId) -> bool {
        let value = map_to_range(id, self.m);
        self.values.binary_search(&value).is_ok()
    }

    pub fn p(&self) -> u8 {
        self.p
    }

    pub fn m(&self) -> u64 {
        self.m
    }

    /// Packed filter bitstream, zero-padded to a byte boundary
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Map a packet ID into `[0, m)` using its leading digest bytes
fn map_to_range(id: &PacketId, m: u64) -> u64 {
    let raw = u64::from_be_bytes(id[..8].try_into().expect("packet id has 32 bytes"));
    raw % m
}

fn encode_deltas(sorted_values: &[u64], p: u8) -> Vec<u8> {
    let mut bits: BitVec<u8, Msb0> = BitVec::new();
    let mut previous = 0u64;

    for &value in sorted_values {
        let delta = value - previous;
        previous = value;

        let quotient = delta >> p;
        for _ in 0..quotient {
            bits.push(true);
        }
        bits.push(false);

        for bit in (0..p).rev() {
            bits.push((delta >> bit) & 1 == 1);
        }
    }

    while bits.len() % 8 != 0 {
        bits.push(false);
    }
    bits.into_vec()
}

fn decode_deltas(data: &[u8], p: u8) -> Vec<u64> {
    let bits = data.view_bits::<Msb0>();
    let mut values = Vec::new();
    let mut previous = 0u64;
    let mut pos = 0;

    loop {
        // Unary quotient: count 1-bits up to the 0 terminator
        let mut quotient = 0u64;
        loop {
            if pos >= bits.len() {
                values.dedup();
                return values;
            }
            let bit = bits[pos];
            pos += 1;
            if bit {
                quotient += 1;
            } else {
                break;
            }
        }

        // Remainder: p binary bits, MSB first
        if bits.len() - pos < p as usize {
            values.dedup();
            return values;
        }
        let mut remainder = 0u64;
        for _ in 0..p {
            remainder = (remainder << 1) | (bits[pos] as u64);
            pos += 1;
        }

        previous += (quotient << p) | remainder;
        values.push(previous);
    }
}
