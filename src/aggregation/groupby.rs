use std::cmp::Ordering;
use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use crate::aggregation::request::MeasureAggregator;
use crate::aggregation::running::RunningStat;
use crate::core::error::Result;
use crate::core::types::{value_tag, BlockNum, ColumnValue, RecordNum};
use crate::segment::reader::ColumnReader;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBucket {
    pub key_values: Vec<ColumnValue>,
    pub count: u64,
    pub stats: Vec<RunningStat>,  // parallel to GroupByBuckets::measures
}

/// Final row of a group-by.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupResult {
    pub key_values: Vec<ColumnValue>,
    pub count: u64,
    pub measures: Vec<ColumnValue>,
}

/// Group key bytes -> running measures. `bucket_limit` of 0 means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByBuckets {
    pub measures: Vec<MeasureAggregator>,
    pub bucket_limit: usize,
    pub buckets: HashMap<Vec<u8>, GroupBucket>,
    pub dropped_records: u64,
}

impl GroupByBuckets {
    pub fn new(measures: Vec<MeasureAggregator>, bucket_limit: usize) -> Self {
        GroupByBuckets {
            measures,
            bucket_limit,
            buckets: HashMap::new(),
            dropped_records: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.bucket_limit > 0 && self.buckets.len() >= self.bucket_limit
    }

    /// Adds one record. Returns false when a new key was refused because the limit is reached.
    pub fn add_record(&mut self, key: &[u8], key_values: &[ColumnValue], measure_values: &[ColumnValue]) -> bool {
        if !self.buckets.contains_key(key) {
            if self.is_full() {
                self.dropped_records += 1;
                return false;
            }
            let stats = self.measures.iter().map(|m| RunningStat::new(&m.func)).collect();
            self.buckets.insert(
                key.to_vec(),
                GroupBucket { key_values: key_values.to_vec(), count: 0, stats },
            );
        }
        if let Some(bucket) = self.buckets.get_mut(key) {
            bucket.count += 1;
            for (stat, value) in bucket.stats.iter_mut().zip(measure_values) {
                stat.add(value);
            }
        }
        true
    }

    pub fn merge(&mut self, other: GroupByBuckets) -> Result<()> {
        self.dropped_records += other.dropped_records;
        for (key, bucket) in other.buckets {
            let full = self.is_full();
            match self.buckets.get_mut(&key) {
                Some(existing) => {
                    existing.count += bucket.count;
                    for (a, b) in existing.stats.iter_mut().zip(&bucket.stats) {
                        a.merge(b)?;
                    }
                }
                None if full => self.dropped_records += bucket.count,
                None => {
                    self.buckets.insert(key, bucket);
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Rows ordered by their key values; timechart rows come out in time order.
    pub fn results(&self) -> Vec<GroupResult> {
        let mut rows: Vec<GroupResult> = self
            .buckets
            .values()
            .map(|b| GroupResult {
                key_values: b.key_values.clone(),
                count: b.count,
                measures: b.stats.iter().map(|s| s.result()).collect(),
            })
            .collect();
        rows.sort_by(|a, b| compare_keys(&a.key_values, &b.key_values));
        rows
    }
}

fn compare_keys(a: &[ColumnValue], b: &[ColumnValue]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) if x.is_numeric() && y.is_numeric() => fx.total_cmp(&fy),
            _ => x.to_string().cmp(&y.to_string()),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Builds the group key of a record into `key` and the decoded parts into `values`.
/// A column that fails to read contributes a backfill marker.
pub fn build_group_key(
    reader: &dyn ColumnReader,
    columns: &[String],
    block: BlockNum,
    record: RecordNum,
    key: &mut Vec<u8>,
    values: &mut Vec<ColumnValue>,
) {
    key.clear();
    values.clear();
    for column in columns {
        match reader.read_value(column, block, record) {
            Ok(v) => {
                v.write_key_bytes(key);
                values.push(v);
            }
            Err(_) => {
                key.push(value_tag::BACKFILL);
                values.push(ColumnValue::Null);
            }
        }
    }
}

/// Timechart key: the time bucket as an unsigned value, then the optional split-by value.
pub fn build_timechart_key(bucket: u64, by_value: Option<&ColumnValue>, key: &mut Vec<u8>, values: &mut Vec<ColumnValue>) {
    key.clear();
    values.clear();
    key.push(value_tag::UNSIGNED);
    key.extend_from_slice(&bucket.to_le_bytes());
    values.push(ColumnValue::Unsigned(bucket));
    if let Some(v) = by_value {
        v.write_key_bytes(key);
        values.push(v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::request::MeasureFunc;

    fn key_of(values: &[ColumnValue]) -> Vec<u8> {
        let mut key = Vec::new();
        for v in values {
            v.write_key_bytes(&mut key);
        }
        key
    }

    #[test]
    fn buckets_accumulate_measures() {
        let mut g = GroupByBuckets::new(vec![MeasureAggregator::new("latency", MeasureFunc::Sum)], 0);
        let web = [ColumnValue::from("web")];
        let db = [ColumnValue::from("db")];
        g.add_record(&key_of(&web), &web, &[ColumnValue::Signed(5)]);
        g.add_record(&key_of(&web), &web, &[ColumnValue::Signed(7)]);
        g.add_record(&key_of(&db), &db, &[ColumnValue::Signed(1)]);

        let rows = g.results();
        assert_eq!(rows.len(), 2);
        let web_row = rows.iter().find(|r| r.key_values == web).unwrap();
        assert_eq!(web_row.count, 2);
        assert_eq!(web_row.measures, vec![ColumnValue::Signed(12)]);
    }

    #[test]
    fn bucket_limit_refuses_new_keys() {
        let mut g = GroupByBuckets::new(vec![], 1);
        let a = [ColumnValue::from("a")];
        let b = [ColumnValue::from("b")];
        assert!(g.add_record(&key_of(&a), &a, &[]));
        assert!(!g.add_record(&key_of(&b), &b, &[]));
        assert!(g.add_record(&key_of(&a), &a, &[]));
        assert_eq!(g.len(), 1);
        assert_eq!(g.dropped_records, 1);
    }

    #[test]
    fn merge_combines_shared_keys() {
        let m = vec![MeasureAggregator::new("x", MeasureFunc::Max)];
        let k = [ColumnValue::from("k")];
        let mut left = GroupByBuckets::new(m.clone(), 0);
        left.add_record(&key_of(&k), &k, &[ColumnValue::Signed(3)]);
        let mut right = GroupByBuckets::new(m, 0);
        right.add_record(&key_of(&k), &k, &[ColumnValue::Signed(9)]);
        left.merge(right).unwrap();
        let rows = left.results();
        assert_eq!(rows[0].count, 2);
        assert_eq!(rows[0].measures, vec![ColumnValue::Signed(9)]);
    }

    #[test]
    fn timechart_key_layout() {
        let (mut k1, mut k2, mut vals) = (Vec::new(), Vec::new(), Vec::new());
        build_timechart_key(60_000, None, &mut k1, &mut vals);
        build_timechart_key(120_000, Some(&ColumnValue::from("web")), &mut k2, &mut vals);
        assert_eq!(k1[0], value_tag::UNSIGNED);
        assert_eq!(&k1[1..9], &60_000u64.to_le_bytes());
        assert_eq!(vals, vec![ColumnValue::Unsigned(120_000), ColumnValue::from("web")]);
    }

    #[test]
    fn timechart_rows_come_out_in_time_order() {
        let mut g = GroupByBuckets::new(vec![], 0);
        let (mut key, mut vals) = (Vec::new(), Vec::new());
        for bucket in [3_600_000u64, 256, 60_000] {
            build_timechart_key(bucket, None, &mut key, &mut vals);
            g.add_record(&key, &vals, &[]);
        }
        let order: Vec<_> = g.results().into_iter().map(|r| r.key_values[0].clone()).collect();
        assert_eq!(
            order,
            vec![ColumnValue::Unsigned(256), ColumnValue::Unsigned(60_000), ColumnValue::Unsigned(3_600_000)]
        );
    }
}
