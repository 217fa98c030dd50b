use std::collections::{BTreeSet, HashMap};
use serde::{Deserialize, Serialize};
use crate::aggregation::hll::HyperLogLog;
use crate::aggregation::number::Number;
use crate::core::error::Result;
use crate::core::types::ColumnValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub min: Number,
    pub max: Number,
    pub sum: Number,
    pub sum_overflowed: bool,
}

impl NumericStats {
    fn single(n: Number) -> Self {
        NumericStats { min: n, max: n, sum: n, sum_overflowed: false }
    }

    fn merge(&mut self, other: &NumericStats) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        let r = self.sum.add(other.sum);
        self.sum = r.value;
        self.sum_overflowed |= r.overflowed || other.sum_overflowed;
    }
}

/// Per-column statistics of the matched records of one or more segments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegStats {
    pub is_numeric: bool,
    pub count: u64,
    pub hll: HyperLogLog,
    pub numeric: Option<NumericStats>,
    pub strings: BTreeSet<String>,
}

impl SegStats {
    pub fn add_value(&mut self, value: &ColumnValue) {
        match value {
            ColumnValue::Null => {}
            ColumnValue::Signed(_) | ColumnValue::Unsigned(_) | ColumnValue::Float(_) => {
                if let Some(n) = Number::from_column_value(value) {
                    self.add_numeric(n, value);
                }
            }
            ColumnValue::Str(s) => self.add_string(s),
            ColumnValue::Bool(b) => self.add_string(if *b { "true" } else { "false" }),
        }
    }

    fn add_numeric(&mut self, n: Number, raw: &ColumnValue) {
        self.count += 1;
        self.is_numeric = true;
        let mut key = Vec::with_capacity(9);
        raw.write_key_bytes(&mut key);
        self.hll.insert_bytes(&key);
        match &mut self.numeric {
            Some(stats) => stats.merge(&NumericStats::single(n)),
            None => self.numeric = Some(NumericStats::single(n)),
        }
    }

    pub fn add_string(&mut self, s: &str) {
        self.count += 1;
        self.hll.insert_bytes(s.as_bytes());
        self.strings.insert(s.to_string());
    }

    pub fn merge(&mut self, other: &SegStats) -> Result<()> {
        self.count += other.count;
        self.is_numeric |= other.is_numeric;
        self.hll.merge(&other.hll)?;
        match (&mut self.numeric, &other.numeric) {
            (Some(a), Some(b)) => a.merge(b),
            (None, Some(b)) => self.numeric = Some(b.clone()),
            _ => {}
        }
        self.strings.extend(other.strings.iter().cloned());
        Ok(())
    }

    pub fn cardinality(&self) -> u64 {
        self.hll.count()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Merges `from` column by column into `into`.
pub fn merge_seg_stats(into: &mut HashMap<String, SegStats>, from: HashMap<String, SegStats>) -> Result<()> {
    for (column, stats) in from {
        match into.get_mut(&column) {
            Some(existing) => existing.merge(&stats)?,
            None => {
                into.insert(column, stats);
            }
        }
    }
    Ok(())
}
