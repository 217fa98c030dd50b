use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

const SECOND_HASH_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Per-block bloom filter over the tokens of every column value in the block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockBloom {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: usize,
}

impl BlockBloom {
    /// - expected_items: number of distinct tokens to be inserted
    /// - false_positive_rate: e.g. 0.01 for 1%
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1);
        let num_bits = Self::optimal_num_bits(n, false_positive_rate).max(64);
        let num_hashes = Self::optimal_num_hashes(n, num_bits);
        BlockBloom {
            bits: vec![0u64; num_bits.div_ceil(64)],
            num_bits,
            num_hashes,
        }
    }

    fn optimal_num_bits(n: usize, p: f64) -> usize {
        let m = -(n as f64 * p.ln()) / (2.0_f64.ln().powi(2));
        m.ceil() as usize
    }

    fn optimal_num_hashes(n: usize, m: usize) -> usize {
        let k = (m as f64 / n as f64) * 2.0_f64.ln();
        (k.ceil() as usize).max(1)
    }

    pub fn insert(&mut self, token: &str) {
        let (h1, h2) = Self::hashes(token);
        for i in 0..self.num_hashes {
            let bit = Self::bit_index(h1, h2, i, self.num_bits);
            self.bits[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    /// False means the token is definitely absent.
    pub fn might_contain(&self, token: &str) -> bool {
        let (h1, h2) = Self::hashes(token);
        (0..self.num_hashes).all(|i| {
            let bit = Self::bit_index(h1, h2, i, self.num_bits);
            self.bits[bit / 64] & (1u64 << (bit % 64)) != 0
        })
    }

    #[inline]
    fn hashes(token: &str) -> (u64, u64) {
        let bytes = token.as_bytes();
        (xxh3_64(bytes), xxh3_64_with_seed(bytes, SECOND_HASH_SEED) | 1)
    }

    #[inline]
    fn bit_index(h1: u64, h2: u64, i: usize, num_bits: usize) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits as u64) as usize
    }
}
