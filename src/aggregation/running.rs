use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};
use crate::aggregation::hll::HyperLogLog;
use crate::aggregation::number::Number;
use crate::aggregation::request::MeasureFunc;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::ColumnValue;

/// Partial result of one measure over one bucket. Mergeable across blocks and segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunningStat {
    Count(u64),
    Sum { sum: Option<Number>, overflowed: bool },
    Min(Option<Number>),
    Max(Option<Number>),
    Avg { sum: f64, count: u64 },
    // Welford accumulator, shared by variance and stdev
    Variance { count: u64, mean: f64, m2: f64, stdev: bool },
    Cardinality(HyperLogLog),
    Percentile { percent: f64, values: Vec<f64> },
    Values(BTreeSet<String>),
    List(Vec<String>),
}

impl RunningStat {
    pub fn new(func: &MeasureFunc) -> Self {
        match func {
            MeasureFunc::Count => RunningStat::Count(0),
            MeasureFunc::Sum => RunningStat::Sum { sum: None, overflowed: false },
            MeasureFunc::Min => RunningStat::Min(None),
            MeasureFunc::Max => RunningStat::Max(None),
            MeasureFunc::Avg => RunningStat::Avg { sum: 0.0, count: 0 },
            MeasureFunc::Variance => RunningStat::Variance { count: 0, mean: 0.0, m2: 0.0, stdev: false },
            MeasureFunc::Stdev => RunningStat::Variance { count: 0, mean: 0.0, m2: 0.0, stdev: true },
            MeasureFunc::Cardinality => RunningStat::Cardinality(HyperLogLog::default()),
            MeasureFunc::Percentile(p) => RunningStat::Percentile { percent: p.clamp(0.0, 100.0), values: Vec::new() },
            MeasureFunc::Values => RunningStat::Values(BTreeSet::new()),
            MeasureFunc::List => RunningStat::List(Vec::new()),
        }
    }

    /// Folds one record's value in. Nulls are skipped; numeric measures skip non-numeric values.
    pub fn add(&mut self, value: &ColumnValue) {
        if matches!(value, ColumnValue::Null) {
            return;
        }
        match self {
            RunningStat::Count(c) => *c += 1,
            RunningStat::Sum { sum, overflowed } => {
                if let Some(n) = Number::from_column_value(value) {
                    *sum = Some(match sum.take() {
                        None => n,
                        Some(acc) => {
                            let r = acc.add(n);
                            *overflowed |= r.overflowed;
                            r.value
                        }
                    });
                }
            }
            RunningStat::Min(m) => {
                if let Some(n) = Number::from_column_value(value) {
                    *m = Some(m.map_or(n, |cur| cur.min(n)));
                }
            }
            RunningStat::Max(m) => {
                if let Some(n) = Number::from_column_value(value) {
                    *m = Some(m.map_or(n, |cur| cur.max(n)));
                }
            }
            RunningStat::Avg { sum, count } => {
                if let Some(f) = value.as_f64() {
                    *sum += f;
                    *count += 1;
                }
            }
            RunningStat::Variance { count, mean, m2, .. } => {
                if let Some(x) = value.as_f64() {
                    *count += 1;
                    let delta = x - *mean;
                    *mean += delta / *count as f64;
                    *m2 += delta * (x - *mean);
                }
            }
            RunningStat::Cardinality(hll) => {
                let mut buf = Vec::with_capacity(16);
                value.write_key_bytes(&mut buf);
                hll.insert_bytes(&buf);
            }
            RunningStat::Percentile { values, .. } => {
                if let Some(f) = value.as_f64() {
                    values.push(f);
                }
            }
            RunningStat::Values(set) => {
                set.insert(value.to_string());
            }
            RunningStat::List(list) => list.push(value.to_string()),
        }
    }

    pub fn merge(&mut self, other: &RunningStat) -> Result<()> {
        match (self, other) {
            (RunningStat::Count(a), RunningStat::Count(b)) => *a += b,
            (RunningStat::Sum { sum, overflowed }, RunningStat::Sum { sum: other_sum, overflowed: other_of }) => {
                *overflowed |= *other_of;
                if let Some(b) = other_sum {
                    *sum = Some(match sum.take() {
                        None => *b,
                        Some(a) => {
                            let r = a.add(*b);
                            *overflowed |= r.overflowed;
                            r.value
                        }
                    });
                }
            }
            (RunningStat::Min(a), RunningStat::Min(b)) => {
                if let Some(b) = b {
                    *a = Some(a.map_or(*b, |cur| cur.min(*b)));
                }
            }
            (RunningStat::Max(a), RunningStat::Max(b)) => {
                if let Some(b) = b {
                    *a = Some(a.map_or(*b, |cur| cur.max(*b)));
                }
            }
            (RunningStat::Avg { sum, count }, RunningStat::Avg { sum: s, count: c }) => {
                *sum += s;
                *count += c;
            }
            (
                RunningStat::Variance { count, mean, m2, .. },
                RunningStat::Variance { count: c2, mean: mean2, m2: m2b, .. },
            ) => {
                if *c2 == 0 {
                    return Ok(());
                }
                let total = *count + c2;
                let delta = mean2 - *mean;
                *m2 += m2b + delta * delta * (*count as f64) * (*c2 as f64) / total as f64;
                *mean += delta * (*c2 as f64) / total as f64;
                *count = total;
            }
            (RunningStat::Cardinality(a), RunningStat::Cardinality(b)) => a.merge(b)?,
            (RunningStat::Percentile { values, .. }, RunningStat::Percentile { values: other, .. }) => {
                values.extend_from_slice(other)
            }
            (RunningStat::Values(a), RunningStat::Values(b)) => a.extend(b.iter().cloned()),
            (RunningStat::List(a), RunningStat::List(b)) => a.extend(b.iter().cloned()),
            (a, b) => {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    format!("cannot merge running stat {} with {}", kind_name(a), kind_name(b)),
                ));
            }
        }
        Ok(())
    }

    /// Final value of the measure. Null when nothing was accumulated.
    pub fn result(&self) -> ColumnValue {
        match self {
            RunningStat::Count(c) => ColumnValue::Unsigned(*c),
            RunningStat::Sum { sum, .. } => sum.map_or(ColumnValue::Null, number_value),
            RunningStat::Min(m) | RunningStat::Max(m) => m.map_or(ColumnValue::Null, number_value),
            RunningStat::Avg { sum, count } => {
                if *count == 0 {
                    ColumnValue::Null
                } else {
                    ColumnValue::Float(sum / *count as f64)
                }
            }
            RunningStat::Variance { count, m2, stdev, .. } => {
                if *count < 2 {
                    return ColumnValue::Null;
                }
                // sample variance
                let var = m2 / (*count - 1) as f64;
                ColumnValue::Float(if *stdev { var.sqrt() } else { var })
            }
            RunningStat::Cardinality(hll) => ColumnValue::Unsigned(hll.count()),
            RunningStat::Percentile { percent, values } => percentile(values, *percent)
                .map_or(ColumnValue::Null, ColumnValue::Float),
            RunningStat::Values(set) => ColumnValue::Str(set.iter().cloned().collect::<Vec<_>>().join(", ")),
            RunningStat::List(list) => ColumnValue::Str(list.join(", ")),
        }
    }
}

fn kind_name(stat: &RunningStat) -> &'static str {
    match stat {
        RunningStat::Count(_) => "count",
        RunningStat::Sum { .. } => "sum",
        RunningStat::Min(_) => "min",
        RunningStat::Max(_) => "max",
        RunningStat::Avg { .. } => "avg",
        RunningStat::Variance { .. } => "variance",
        RunningStat::Cardinality(_) => "cardinality",
        RunningStat::Percentile { .. } => "percentile",
        RunningStat::Values(_) => "values",
        RunningStat::List(_) => "list",
    }
}

fn number_value(n: Number) -> ColumnValue {
    match n {
        Number::F64(f) => ColumnValue::Float(f),
        Number::U8(v) => ColumnValue::Unsigned(v as u64),
        Number::U16(v) => ColumnValue::Unsigned(v as u64),
        Number::U32(v) => ColumnValue::Unsigned(v as u64),
        Number::U64(v) => ColumnValue::Unsigned(v),
        Number::I8(v) => ColumnValue::Signed(v as i64),
        Number::I16(v) => ColumnValue::Signed(v as i64),
        Number::I32(v) => ColumnValue::Signed(v as i64),
        Number::I64(v) => ColumnValue::Signed(v),
    }
}

/// Nearest-rank percentile with linear interpolation between neighbours.
fn percentile(values: &[f64], percent: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = percent / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(func: MeasureFunc, values: &[ColumnValue]) -> RunningStat {
        let mut s = RunningStat::new(&func);
        for v in values {
            s.add(v);
        }
        s
    }

    fn ints(values: &[i64]) -> Vec<ColumnValue> {
        values.iter().map(|v| ColumnValue::Signed(*v)).collect()
    }

    #[test]
    fn basic_measures() {
        let vals = ints(&[4, 8, 15, 16, 23, 42]);
        assert_eq!(fold(MeasureFunc::Count, &vals).result(), ColumnValue::Unsigned(6));
        assert_eq!(fold(MeasureFunc::Sum, &vals).result(), ColumnValue::Signed(108));
        assert_eq!(fold(MeasureFunc::Min, &vals).result(), ColumnValue::Signed(4));
        assert_eq!(fold(MeasureFunc::Max, &vals).result(), ColumnValue::Signed(42));
        assert_eq!(fold(MeasureFunc::Avg, &vals).result(), ColumnValue::Float(18.0));
    }

    #[test]
    fn nulls_and_text_are_skipped_by_numeric_measures() {
        let vals = vec![ColumnValue::Null, ColumnValue::from("abc"), ColumnValue::Signed(3)];
        assert_eq!(fold(MeasureFunc::Count, &vals).result(), ColumnValue::Unsigned(2));
        assert_eq!(fold(MeasureFunc::Sum, &vals).result(), ColumnValue::Signed(3));
        assert_eq!(fold(MeasureFunc::Min, &[ColumnValue::Null]).result(), ColumnValue::Null);
    }

    #[test]
    fn parallel_variance_merge_matches_single_pass() {
        let all = ints(&[2, 4, 4, 4, 5, 5, 7, 9]);
        let single = fold(MeasureFunc::Variance, &all).result();
        let mut left = fold(MeasureFunc::Variance, &all[..3]);
        let right = fold(MeasureFunc::Variance, &all[3..]);
        left.merge(&right).unwrap();
        let (ColumnValue::Float(a), ColumnValue::Float(b)) = (single, left.result()) else {
            panic!("variance should be a float");
        };
        assert!((a - b).abs() < 1e-9);
        assert!((a - 32.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn stdev_is_sqrt_of_variance() {
        let vals = ints(&[2, 4, 4, 4, 5, 5, 7, 9]);
        let ColumnValue::Float(sd) = fold(MeasureFunc::Stdev, &vals).result() else {
            panic!("stdev should be a float");
        };
        assert!((sd - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn percentile_interpolates() {
        let vals = ints(&[1, 2, 3, 4, 5]);
        assert_eq!(fold(MeasureFunc::Percentile(50.0), &vals).result(), ColumnValue::Float(3.0));
        assert_eq!(fold(MeasureFunc::Percentile(100.0), &vals).result(), ColumnValue::Float(5.0));
        assert_eq!(fold(MeasureFunc::Percentile(25.0), &ints(&[10, 20])).result(), ColumnValue::Float(12.5));
    }

    #[test]
    fn cardinality_and_values_merge_as_sets() {
        let mut a = fold(MeasureFunc::Cardinality, &[ColumnValue::from("x"), ColumnValue::from("y")]);
        a.merge(&fold(MeasureFunc::Cardinality, &[ColumnValue::from("y"), ColumnValue::from("z")])).unwrap();
        assert_eq!(a.result(), ColumnValue::Unsigned(3));

        let mut v = fold(MeasureFunc::Values, &[ColumnValue::from("b"), ColumnValue::from("a")]);
        v.merge(&fold(MeasureFunc::Values, &[ColumnValue::from("a")])).unwrap();
        assert_eq!(v.result(), ColumnValue::from("a, b"));
    }

    #[test]
    fn sum_promotes_to_float_and_tracks_overflow() {
        let s = fold(MeasureFunc::Sum, &[ColumnValue::Signed(1), ColumnValue::Float(0.5)]);
        assert_eq!(s.result(), ColumnValue::Float(1.5));
        let big = fold(MeasureFunc::Sum, &[ColumnValue::Signed(i64::MAX), ColumnValue::Signed(1)]);
        assert!(matches!(big, RunningStat::Sum { overflowed: true, .. }));
    }

    #[test]
    fn mismatched_merge_fails() {
        let mut a = RunningStat::new(&MeasureFunc::Count);
        assert!(a.merge(&RunningStat::new(&MeasureFunc::Sum)).is_err());
    }
}
