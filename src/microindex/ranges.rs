use std::cmp::Ordering;
use serde::{Deserialize, Serialize};
use crate::aggregation::number::Number;
use crate::search::query::{FilterOp, SearchQuery};

/// Min/max of a numeric column within one block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    pub min: Number,
    pub max: Number,
}

impl NumericRange {
    pub fn new(min: Number, max: Number) -> Self {
        NumericRange { min, max }
    }

    pub fn single(v: Number) -> Self {
        NumericRange { min: v, max: v }
    }

    pub fn extend(&mut self, v: Number) {
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    /// Whether some value in [min, max] could satisfy `x <op> value`.
    /// Incomparable values (NaN) never prune.
    pub fn may_satisfy(&self, op: FilterOp, value: &Number) -> bool {
        let vs_min = value.compare(&self.min);
        let vs_max = value.compare(&self.max);
        let (Some(vs_min), Some(vs_max)) = (vs_min, vs_max) else {
            return true;
        };
        match op {
            FilterOp::Equals => vs_min != Ordering::Less && vs_max != Ordering::Greater,
            // only a block holding nothing but `value` is certain to fail
            FilterOp::NotEquals => !(vs_min == Ordering::Equal && vs_max == Ordering::Equal),
            FilterOp::GreaterThan => vs_max == Ordering::Less,
            FilterOp::GreaterThanOrEqualTo => vs_max != Ordering::Greater,
            FilterOp::LessThan => vs_min == Ordering::Greater,
            FilterOp::LessThanOrEqualTo => vs_min != Ordering::Less,
        }
    }

    /// Inclusive overlap with [low, high].
    pub fn overlaps(&self, low: &Number, high: &Number) -> bool {
        let below = high.compare(&self.min) == Some(Ordering::Less);
        let above = low.compare(&self.max) == Some(Ordering::Greater);
        !(below || above)
    }
}

/// The numeric part of a predicate a block range can refute.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeCheck {
    Compare(FilterOp, Number),
    Between(Number, Number),
}

impl RangeCheck {
    pub fn from_query(query: &SearchQuery) -> Option<RangeCheck> {
        match query {
            SearchQuery::Expression(e) if e.value.is_numeric() => {
                Number::from_column_value(&e.value).map(|n| RangeCheck::Compare(e.op, n))
            }
            SearchQuery::Range(r) => Some(RangeCheck::Between(r.low, r.high)),
            _ => None,
        }
    }

    pub fn passes(&self, range: &NumericRange) -> bool {
        match self {
            RangeCheck::Compare(op, v) => range.may_satisfy(*op, v),
            RangeCheck::Between(low, high) => range.overlaps(low, high),
        }
    }
}
