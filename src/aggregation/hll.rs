use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;
use crate::core::error::{Error, ErrorKind, Result};

pub const DEFAULT_PRECISION: u8 = 14;

/// Dense HyperLogLog sketch for distinct counts. Union is a register-wise max.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
}

impl Default for HyperLogLog {
    fn default() -> Self {
        HyperLogLog::new(DEFAULT_PRECISION)
    }
}

impl HyperLogLog {
    /// `precision` is clamped to 4..=18.
    pub fn new(precision: u8) -> Self {
        let precision = precision.clamp(4, 18);
        HyperLogLog {
            precision,
            registers: vec![0; 1 << precision],
        }
    }

    pub fn insert_bytes(&mut self, bytes: &[u8]) {
        self.insert_hash(xxh3_64(bytes));
    }

    pub fn insert_hash(&mut self, hash: u64) {
        let idx = (hash >> (64 - self.precision)) as usize;
        let rest = hash << self.precision;
        let rho = if rest == 0 {
            64 - self.precision + 1
        } else {
            rest.leading_zeros() as u8 + 1
        };
        if rho > self.registers[idx] {
            self.registers[idx] = rho;
        }
    }

    pub fn merge(&mut self, other: &HyperLogLog) -> Result<()> {
        if other.precision != self.precision {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("cannot merge hll of precision {} into {}", other.precision, self.precision),
            ));
        }
        for (a, b) in self.registers.iter_mut().zip(&other.registers) {
            *a = (*a).max(*b);
        }
        Ok(())
    }

    pub fn count(&self) -> u64 {
        let m = self.registers.len() as f64;
        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m),
        };
        let sum: f64 = self.registers.iter().map(|r| 2f64.powi(-(*r as i32))).sum();
        let raw = alpha * m * m / sum;
        let zeros = self.registers.iter().filter(|r| **r == 0).count();
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            // linear counting for small cardinalities
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        estimate.round() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|r| *r == 0)
    }
}
