use std::fmt;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub type BlockNum = u16;
pub type RecordNum = u16;

/// Inclusive epoch-millisecond window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_epoch_ms: u64,
    pub end_epoch_ms: u64,
}

impl TimeRange {
    pub fn new(start_epoch_ms: u64, end_epoch_ms: u64) -> Self {
        TimeRange { start_epoch_ms, end_epoch_ms }
    }

    pub fn all_time() -> Self {
        TimeRange::new(0, u64::MAX)
    }

    pub fn from_datetimes(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeRange::new(
            start.timestamp_millis().max(0) as u64,
            end.timestamp_millis().max(0) as u64,
        )
    }

    /// Window ending now and spanning `span`.
    pub fn last(span: Duration) -> Self {
        let end = Utc::now();
        TimeRange::from_datetimes(end - span, end)
    }

    pub fn check_in_range(&self, ts: u64) -> bool {
        self.start_epoch_ms <= ts && ts <= self.end_epoch_ms
    }

    /// True when [low, high] shares at least one instant with this range.
    pub fn check_range_overlap(&self, low: u64, high: u64) -> bool {
        self.check_in_range(low)
            || self.check_in_range(high)
            || (low <= self.start_epoch_ms && high >= self.end_epoch_ms)
    }

    pub fn are_times_fully_enclosed(&self, low: u64, high: u64) -> bool {
        self.check_in_range(low) && self.check_in_range(high)
    }
}

/// Type tags used when a value is written into a byte key.
pub mod value_tag {
    pub const NULL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const SIGNED: u8 = 2;
    pub const UNSIGNED: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const STRING: u8 = 5;
    pub const BACKFILL: u8 = 6;
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Str(String),
}

impl ColumnValue {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnValue::Signed(_) | ColumnValue::Unsigned(_) | ColumnValue::Float(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Signed(v) => Some(*v as f64),
            ColumnValue::Unsigned(v) => Some(*v as f64),
            ColumnValue::Float(v) => Some(*v),
            ColumnValue::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Appends a tagged, self-delimiting encoding of the value.
    pub fn write_key_bytes(&self, buf: &mut Vec<u8>) {
        match self {
            ColumnValue::Null => buf.push(value_tag::NULL),
            ColumnValue::Bool(b) => {
                buf.push(value_tag::BOOL);
                buf.push(*b as u8);
            }
            ColumnValue::Signed(v) => {
                buf.push(value_tag::SIGNED);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            ColumnValue::Unsigned(v) => {
                buf.push(value_tag::UNSIGNED);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            ColumnValue::Float(v) => {
                buf.push(value_tag::FLOAT);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            ColumnValue::Str(s) => {
                buf.push(value_tag::STRING);
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "null"),
            ColumnValue::Bool(b) => write!(f, "{}", b),
            ColumnValue::Signed(v) => write!(f, "{}", v),
            ColumnValue::Unsigned(v) => write!(f, "{}", v),
            ColumnValue::Float(v) => write!(f, "{}", v),
            ColumnValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(s: &str) -> Self {
        ColumnValue::Str(s.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(s: String) -> Self {
        ColumnValue::Str(s)
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Signed(v)
    }
}

impl From<u64> for ColumnValue {
    fn from(v: u64) -> Self {
        ColumnValue::Unsigned(v)
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        ColumnValue::Float(v)
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        ColumnValue::Bool(v)
    }
}
