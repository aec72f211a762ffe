//! Snowflake-aware hashing.
//!
//! Tenant ids are snowflakes: 42 timestamp bits up top, then machine/process
//! bits, then a sequence. Ids minted around the same time share almost all of
//! their high bits, so hashing them directly concentrates load on one ring
//! segment. The whitener folds the low (fast-moving) bits into the high ones
//! before the final avalanche:
//!
//! 1. split into 32-bit halves `hi`, `lo`,
//! 2. `mixed_hi = hi ^ rotl32(lo, 17)`, `mixed_lo = lo ^ rotl32(hi, 13)`,
//! 3. concatenate and run the 64-bit MurmurHash3 finalizer,
//! 4. for a ring position, digest the whitened id plus a seed with
//!    BLAKE2b-128 and read the digest as a big-endian integer.

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};

type Blake2b128 = Blake2b<U16>;

/// MurmurHash3 64-bit finalizer.
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// Whitens a snowflake id so near-in-time ids land far apart.
pub fn whiten(snowflake_id: u64) -> u64 {
    let hi = (snowflake_id >> 32) as u32;
    let lo = snowflake_id as u32;
    let mixed_hi = hi ^ lo.rotate_left(17);
    let mixed_lo = lo ^ hi.rotate_left(13);
    mix64((u64::from(mixed_hi) << 32) | u64::from(mixed_lo))
}

/// 128-bit ring hash of a partition id: whiten, then BLAKE2b-128 over the
/// whitened id and seed (little-endian u64s), read big-endian.
pub fn hash_partition(partition_id: u64, seed: u64) -> u128 {
    let whitened = whiten(partition_id);
    let mut hasher = Blake2b128::new();
    hasher.update(whitened.to_le_bytes());
    hasher.update(seed.to_le_bytes());
    u128::from_be_bytes(hasher.finalize().into())
}

/// How evenly a set of ids spreads over `num_buckets` equal hash slices.
#[derive(Debug, Clone)]
pub struct DistributionReport {
    pub total_ids: usize,
    pub num_buckets: usize,
    pub expected_per_bucket: f64,
    pub std_deviation: f64,
    /// Standard deviation as a percentage of the uniform expectation.
    pub deviation_percent: f64,
    pub max_bucket_count: usize,
    pub min_bucket_count: usize,
    /// How far the fullest bucket overshoots the expectation, in percent.
    pub max_deviation_percent: f64,
}

/// Buckets the ids by their ring hash and reports spread statistics.
pub fn analyze_distribution(partition_ids: &[u64], num_buckets: usize) -> DistributionReport {
    let num_buckets = num_buckets.max(1);
    let mut buckets = vec![0usize; num_buckets];
    let bucket_size = u128::MAX / num_buckets as u128;
    for id in partition_ids {
        let hash = hash_partition(*id, 0);
        let bucket = ((hash / bucket_size) as usize).min(num_buckets - 1);
        buckets[bucket] += 1;
    }

    let expected = partition_ids.len() as f64 / num_buckets as f64;
    let variance = buckets
        .iter()
        .map(|count| (*count as f64 - expected).powi(2))
        .sum::<f64>()
        / num_buckets as f64;
    let std_deviation = variance.sqrt();
    let max_bucket_count = buckets.iter().copied().max().unwrap_or(0);
    let min_bucket_count = buckets.iter().copied().min().unwrap_or(0);

    DistributionReport {
        total_ids: partition_ids.len(),
        num_buckets,
        expected_per_bucket: expected,
        std_deviation,
        deviation_percent: if expected > 0.0 {
            std_deviation / expected * 100.0
        } else {
            0.0
        },
        max_bucket_count,
        min_bucket_count,
        max_deviation_percent: if expected > 0.0 {
            (max_bucket_count as f64 - expected) / expected * 100.0
        } else {
            0.0
        },
    }
}

/// Builds a synthetic snowflake for tests and load modeling.
pub fn synthesize(timestamp_ms: u64, worker: u16, sequence: u16) -> u64 {
    (timestamp_ms << 22) | (u64::from(worker & 0x3ff) << 12) | u64::from(sequence & 0xfff)
}
