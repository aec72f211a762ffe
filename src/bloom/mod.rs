//! # Bloom Filter Module
//!
//! Space-efficient negative membership test over row ids, embedded in every
//! segment file so point lookups can reject absent ids without touching the
//! data block.
//!
//! ## Sizing
//!
//! For `n` expected items at target false-positive rate `ε`:
//!
//! ```text
//! m = ⌈−n·ln ε / (ln 2)²⌉   bits
//! k = ⌈(m/n)·ln 2⌉          hash functions
//! ```
//!
//! floored to `m ≥ 64`, `k ≥ 1`. Probe `i` is `MD5(item ∥ seed_i) mod m`
//! with the seed as a little-endian `u32`.
//!
//! # On-disk layout
//!
//! ```text
//! [m u32 LE][k u32 LE][bytes_len u32 LE][bits]
//! ```

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use md5::{Digest, Md5};
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned when deserializing a bloom filter.
#[derive(Debug, Error)]
pub enum BloomError {
    /// Serialized form is truncated or self-inconsistent.
    #[error("Malformed bloom filter: {0}")]
    Malformed(String),
}

// ------------------------------------------------------------------------------------------------
// BloomFilter
// ------------------------------------------------------------------------------------------------

/// Bloom filter over `u64` row ids.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bit_count: u32,
    hash_count: u32,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Sizes the filter for `expected_items` at `false_positive_rate`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = ((-n * false_positive_rate.ln()) / (ln2 * ln2)).ceil() as u32;
        let bit_count = m.max(64);
        let k = ((f64::from(bit_count) / n) * ln2).ceil() as u32;
        let hash_count = k.max(1);
        Self {
            bit_count,
            hash_count,
            bits: vec![0u8; bit_count.div_ceil(8) as usize],
        }
    }

    fn probe(&self, item: u64, seed: u32) -> u32 {
        let mut hasher = Md5::new();
        hasher.update(item.to_le_bytes());
        hasher.update(seed.to_le_bytes());
        let digest = hasher.finalize();
        let hash = u128::from_be_bytes(digest.into());
        (hash % u128::from(self.bit_count)) as u32
    }

    pub fn add(&mut self, item: u64) {
        for seed in 0..self.hash_count {
            let bit = self.probe(item, seed);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// `false` means definitely absent; `true` means probably present.
    pub fn might_contain(&self, item: u64) -> bool {
        (0..self.hash_count).all(|seed| {
            let bit = self.probe(item, seed);
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }

    pub fn bit_count(&self) -> u32 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Serializes as `[m][k][bytes_len][bits]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.bits.len());
        out.extend_from_slice(&self.bit_count.to_le_bytes());
        out.extend_from_slice(&self.hash_count.to_le_bytes());
        out.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    /// Inverse of [`BloomFilter::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, BloomError> {
        if data.len() < 12 {
            return Err(BloomError::Malformed("shorter than fixed fields".into()));
        }
        let bit_count = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let hash_count = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let bytes_len = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
        if data.len() < 12 + bytes_len {
            return Err(BloomError::Malformed(format!(
                "declares {bytes_len} bit bytes but carries {}",
                data.len() - 12
            )));
        }
        if bytes_len < bit_count.div_ceil(8) as usize {
            return Err(BloomError::Malformed(format!(
                "{bytes_len} bytes cannot hold {bit_count} bits"
            )));
        }
        Ok(Self {
            bit_count,
            hash_count,
            bits: data[12..12 + bytes_len].to_vec(),
        })
    }
}
