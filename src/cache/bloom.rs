//! Bloom Filter
//!
//! Write-only probabilistic membership set used to short-circuit lookups for
//! ids that provably do not exist. A negative answer is always correct; a
//! positive answer is wrong with probability close to the configured rate.
//!
//! Sizing follows the standard optimum for `n` expected items and target
//! false-positive rate `p`:
//!
//! ```text
//! m = ceil(-n * ln(p) / ln(2)^2)      bits
//! k = ceil(m / n * ln(2))             hash functions
//! ```

use std::f64::consts::LN_2;

use parking_lot::RwLock;

use crate::error::{Error, Result};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Bloom filter sizing.
#[derive(Debug, Clone)]
pub struct BloomConfig {
    /// Expected number of distinct items
    pub expected_items: u64,

    /// Target false-positive rate, strictly between 0 and 1
    pub false_positive_rate: f64,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            expected_items: 100_000,
            false_positive_rate: 0.01,
        }
    }
}

/// Fixed-size bit array probed by `k` seeded hash functions.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    m: u64,
    k: u32,
}

impl BloomFilter {
    pub fn new(expected_items: u64, false_positive_rate: f64) -> Result<Self> {
        if expected_items == 0 {
            return Err(Error::Config(
                "bloom filter expected items must be positive".to_string(),
            ));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(Error::Config(format!(
                "bloom filter false-positive rate must be in (0, 1), got {}",
                false_positive_rate
            )));
        }

        let m = optimal_bits(expected_items, false_positive_rate);
        let k = optimal_hashes(expected_items, m);
        let words = m.div_ceil(64) as usize;
        Ok(Self {
            bits: vec![0; words],
            m,
            k,
        })
    }

    pub fn from_config(config: &BloomConfig) -> Result<Self> {
        Self::new(config.expected_items, config.false_positive_rate)
    }

    /// Number of bits `m`.
    pub fn bit_count(&self) -> u64 {
        self.m
    }

    /// Number of hash functions `k`.
    pub fn hash_count(&self) -> u32 {
        self.k
    }

    pub fn insert(&mut self, item: &[u8]) {
        for seed in 0..self.k {
            let bit = hash_with_seed(item, seed) % self.m;
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        (0..self.k).all(|seed| {
            let bit = hash_with_seed(item, seed) % self.m;
            self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }
}

pub fn optimal_bits(n: u64, p: f64) -> u64 {
    (-(n as f64) * p.ln() / (LN_2 * LN_2)).ceil() as u64
}

pub fn optimal_hashes(n: u64, m: u64) -> u32 {
    ((m as f64 / n as f64) * LN_2).ceil().max(1.0) as u32
}

/// FNV-1a over `seed || data`, finished with a 64-bit avalanche mix so that
/// low bits stay well distributed under `% m`.
fn hash_with_seed(data: &[u8], seed: u32) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in seed.to_be_bytes().iter().chain(data) {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^ (hash >> 33)
}

/// Thread-safe bloom filter over entity ids.
#[derive(Debug)]
pub struct BloomGate {
    filter: RwLock<BloomFilter>,
}

impl BloomGate {
    pub fn new(config: &BloomConfig) -> Result<Self> {
        Ok(Self {
            filter: RwLock::new(BloomFilter::from_config(config)?),
        })
    }

    pub fn insert(&self, id: i64) {
        self.filter.write().insert(&id.to_be_bytes());
    }

    /// Insert a batch of ids under one write lock.
    pub fn populate<I: IntoIterator<Item = i64>>(&self, ids: I) -> usize {
        let mut filter = self.filter.write();
        let mut count = 0;
        for id in ids {
            filter.insert(&id.to_be_bytes());
            count += 1;
        }
        count
    }

    /// `false` means the id was never inserted.
    pub fn might_contain(&self, id: i64) -> bool {
        self.filter.read().contains(&id.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sizing_formulas() {
        // n = 100k, p = 0.01 -> m = 958_506, k = 7
        assert_eq!(optimal_bits(100_000, 0.01), 958_506);
        assert_eq!(optimal_hashes(100_000, 958_506), 7);

        let filter = BloomFilter::new(100_000, 0.0001).unwrap();
        assert_eq!(filter.hash_count(), 14);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(BloomFilter::new(0, 0.01).is_err());
        assert!(BloomFilter::new(10, 0.0).is_err());
        assert!(BloomFilter::new(10, 1.0).is_err());
        assert!(BloomFilter::new(10, f64::NAN).is_err());
    }

    #[test]
    fn test_known_keys() {
        let mut filter = BloomFilter::new(100_000, 0.0001).unwrap();
        for key in ["user:1001", "product:2002", "order:3003"] {
            filter.insert(key.as_bytes());
        }
        assert!(filter.contains(b"user:1001"));
        assert!(filter.contains(b"product:2002"));
        assert!(!filter.contains(b"user:9999"));
        assert!(!filter.contains(b"invalid_key"));
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let target = 0.01;
        let gate = BloomGate::new(&BloomConfig {
            expected_items: 10_000,
            false_positive_rate: target,
        })
        .unwrap();
        gate.populate(0..10_000);

        let trials = 50_000;
        let false_positives = (1_000_000..1_000_000 + trials)
            .filter(|id| gate.might_contain(*id))
            .count();
        let observed = false_positives as f64 / trials as f64;

        assert!(observed < target * 2.0, "observed fp rate {}", observed);
    }

    proptest! {
        #[test]
        fn prop_no_false_negatives(ids in prop::collection::vec(any::<i64>(), 1..500)) {
            let gate = BloomGate::new(&BloomConfig {
                expected_items: 500,
                false_positive_rate: 0.01,
            }).unwrap();
            gate.populate(ids.iter().copied());
            for id in ids {
                prop_assert!(gate.might_contain(id));
            }
        }
    }
}
