//! Closed set of numeric kinds with overflow-flagging arithmetic.
//!
//! Arithmetic never panics: an overflowing operation returns the wrapped value and raises
//! `overflowed`. Operands of different kinds are promoted before the operation: any float makes
//! the result a float, two unsigned values stay unsigned, anything else becomes signed.

use std::cmp::Ordering;
use std::fmt;
use serde::{Deserialize, Serialize};
use crate::core::types::ColumnValue;

/// Result of an arithmetic step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overflowing<T> {
    pub value: T,
    pub overflowed: bool,
}

impl<T> Overflowing<T> {
    fn exact(value: T) -> Self {
        Overflowing { value, overflowed: false }
    }
}

pub trait NumericKind: Copy + PartialOrd + fmt::Debug {
    fn overflowing_add(self, rhs: Self) -> (Self, bool);
    fn overflowing_mul(self, rhs: Self) -> (Self, bool);
    fn to_f64(self) -> f64;
}

macro_rules! int_kind {
    ($($t:ty),*) => {
        $(
            impl NumericKind for $t {
                #[inline]
                fn overflowing_add(self, rhs: Self) -> (Self, bool) {
                    <$t>::overflowing_add(self, rhs)
                }

                #[inline]
                fn overflowing_mul(self, rhs: Self) -> (Self, bool) {
                    <$t>::overflowing_mul(self, rhs)
                }

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

int_kind!(u8, u16, u32, u64, i8, i16, i32, i64);

impl NumericKind for f64 {
    #[inline]
    fn overflowing_add(self, rhs: Self) -> (Self, bool) {
        let v = self + rhs;
        (v, v.is_infinite() && self.is_finite() && rhs.is_finite())
    }

    #[inline]
    fn overflowing_mul(self, rhs: Self) -> (Self, bool) {
        let v = self * rhs;
        (v, v.is_infinite() && self.is_finite() && rhs.is_finite())
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

pub fn add<T: NumericKind>(a: T, b: T) -> Overflowing<T> {
    let (value, overflowed) = a.overflowing_add(b);
    Overflowing { value, overflowed }
}

pub fn multiply<T: NumericKind>(a: T, b: T) -> Overflowing<T> {
    let (value, overflowed) = a.overflowing_mul(b);
    Overflowing { value, overflowed }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Number {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F64(f64),
}

/// Canonical widest form of a number.
#[derive(Debug, Clone, Copy)]
enum Wide {
    U(u64),
    I(i64),
    F(f64),
}

impl Number {
    pub fn from_column_value(v: &ColumnValue) -> Option<Number> {
        match v {
            ColumnValue::Unsigned(u) => Some(Number::U64(*u)),
            ColumnValue::Signed(i) => Some(Number::I64(*i)),
            ColumnValue::Float(f) => Some(Number::F64(*f)),
            ColumnValue::Str(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    Some(Number::I64(i))
                } else if let Ok(u) = s.parse::<u64>() {
                    Some(Number::U64(u))
                } else {
                    s.parse::<f64>().ok().map(Number::F64)
                }
            }
            _ => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Number::F64(_))
    }

    pub fn as_f64(&self) -> f64 {
        match self.wide() {
            Wide::U(u) => u as f64,
            Wide::I(i) => i as f64,
            Wide::F(f) => f,
        }
    }

    fn wide(&self) -> Wide {
        match *self {
            Number::U8(v) => Wide::U(v as u64),
            Number::U16(v) => Wide::U(v as u64),
            Number::U32(v) => Wide::U(v as u64),
            Number::U64(v) => Wide::U(v),
            Number::I8(v) => Wide::I(v as i64),
            Number::I16(v) => Wide::I(v as i64),
            Number::I32(v) => Wide::I(v as i64),
            Number::I64(v) => Wide::I(v),
            Number::F64(v) => Wide::F(v),
        }
    }

    fn from_wide(w: Wide) -> Number {
        match w {
            Wide::U(v) => Number::U64(v),
            Wide::I(v) => Number::I64(v),
            Wide::F(v) => Number::F64(v),
        }
    }

    /// Brings both operands to a common wide kind.
    fn promote(a: Wide, b: Wide) -> (Wide, Wide) {
        match (a, b) {
            (Wide::U(_), Wide::U(_)) | (Wide::I(_), Wide::I(_)) | (Wide::F(_), Wide::F(_)) => (a, b),
            (Wide::F(_), _) | (_, Wide::F(_)) => (Wide::F(to_f64(a)), Wide::F(to_f64(b))),
            (Wide::U(u), Wide::I(i)) => match i64::try_from(u) {
                Ok(u) => (Wide::I(u), Wide::I(i)),
                Err(_) => (Wide::F(u as f64), Wide::F(i as f64)),
            },
            (Wide::I(i), Wide::U(u)) => match i64::try_from(u) {
                Ok(u) => (Wide::I(i), Wide::I(u)),
                Err(_) => (Wide::F(i as f64), Wide::F(u as f64)),
            },
        }
    }

    pub fn add(self, other: Number) -> Overflowing<Number> {
        macro_rules! same {
            ($($v:ident),*) => {
                match (self, other) {
                    $((Number::$v(a), Number::$v(b)) => {
                        let r = add(a, b);
                        return Overflowing { value: Number::$v(r.value), overflowed: r.overflowed };
                    })*
                    _ => {}
                }
            };
        }
        same!(U8, U16, U32, U64, I8, I16, I32, I64, F64);

        match Number::promote(self.wide(), other.wide()) {
            (Wide::U(a), Wide::U(b)) => lift(add(a, b), Number::U64),
            (Wide::I(a), Wide::I(b)) => lift(add(a, b), Number::I64),
            (a, b) => lift(add(to_f64(a), to_f64(b)), Number::F64),
        }
    }

    /// Multiplication; 8/16/32-bit unsigned operands widen to the next size and cannot overflow.
    pub fn multiply(self, other: Number) -> Overflowing<Number> {
        match (self, other) {
            (Number::U8(a), Number::U8(b)) => return Overflowing::exact(Number::U16(a as u16 * b as u16)),
            (Number::U16(a), Number::U16(b)) => return Overflowing::exact(Number::U32(a as u32 * b as u32)),
            (Number::U32(a), Number::U32(b)) => return Overflowing::exact(Number::U64(a as u64 * b as u64)),
            (Number::U64(a), Number::U64(b)) => return lift(multiply(a, b), Number::U64),
            (Number::I8(a), Number::I8(b)) => return lift(multiply(a, b), Number::I8),
            (Number::I16(a), Number::I16(b)) => return lift(multiply(a, b), Number::I16),
            (Number::I32(a), Number::I32(b)) => return lift(multiply(a, b), Number::I32),
            (Number::I64(a), Number::I64(b)) => return lift(multiply(a, b), Number::I64),
            (Number::F64(a), Number::F64(b)) => return lift(multiply(a, b), Number::F64),
            _ => {}
        }
        match Number::promote(self.wide(), other.wide()) {
            (Wide::U(a), Wide::U(b)) => lift(multiply(a, b), Number::U64),
            (Wide::I(a), Wide::I(b)) => lift(multiply(a, b), Number::I64),
            (a, b) => lift(multiply(to_f64(a), to_f64(b)), Number::F64),
        }
    }

    pub fn compare(&self, other: &Number) -> Option<Ordering> {
        match (self.wide(), other.wide()) {
            (Wide::U(a), Wide::U(b)) => Some(a.cmp(&b)),
            (Wide::I(a), Wide::I(b)) => Some(a.cmp(&b)),
            (Wide::U(a), Wide::I(b)) => Some((a as i128).cmp(&(b as i128))),
            (Wide::I(a), Wide::U(b)) => Some((a as i128).cmp(&(b as i128))),
            (a, b) => to_f64(a).partial_cmp(&to_f64(b)),
        }
    }

    /// Smaller of the two; a float on either side makes the stored result a float.
    pub fn min(self, other: Number) -> Number {
        let pick = match self.compare(&other) {
            Some(Ordering::Greater) => other,
            _ => self,
        };
        Number::keep_float(pick, self, other)
    }

    pub fn max(self, other: Number) -> Number {
        let pick = match self.compare(&other) {
            Some(Ordering::Less) => other,
            _ => self,
        };
        Number::keep_float(pick, self, other)
    }

    fn keep_float(pick: Number, a: Number, b: Number) -> Number {
        if (a.is_float() || b.is_float()) && !pick.is_float() {
            Number::F64(pick.as_f64())
        } else {
            Number::from_wide(pick.wide())
        }
    }
}

fn to_f64(w: Wide) -> f64 {
    match w {
        Wide::U(u) => u as f64,
        Wide::I(i) => i as f64,
        Wide::F(f) => f,
    }
}

fn lift<T>(r: Overflowing<T>, wrap: impl Fn(T) -> Number) -> Overflowing<Number> {
    Overflowing { value: wrap(r.value), overflowed: r.overflowed }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.wide() {
            Wide::U(v) => write!(f, "{}", v),
            Wide::I(v) => write!(f, "{}", v),
            Wide::F(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_kind_overflow_is_flagged_and_wrapped() {
        let r = Number::U8(250).add(Number::U8(10));
        assert_eq!(r.value, Number::U8(4));
        assert!(r.overflowed);

        let r = Number::I64(i64::MAX).add(Number::I64(1));
        assert_eq!(r.value, Number::I64(i64::MIN));
        assert!(r.overflowed);

        let r = Number::I32(-5).add(Number::I32(5));
        assert_eq!(r.value, Number::I32(0));
        assert!(!r.overflowed);
    }

    #[test]
    fn float_overflow_is_flagged() {
        let r = Number::F64(f64::MAX).add(Number::F64(f64::MAX));
        assert!(r.overflowed);
        let r = Number::F64(f64::INFINITY).add(Number::F64(1.0));
        assert!(!r.overflowed);
    }

    #[test]
    fn small_unsigned_multiply_widens() {
        let r = Number::U8(200).multiply(Number::U8(200));
        assert_eq!(r.value, Number::U16(40_000));
        assert!(!r.overflowed);
        let r = Number::U64(u64::MAX).multiply(Number::U64(2));
        assert!(r.overflowed);
    }

    #[test]
    fn mixed_kinds_promote() {
        assert_eq!(Number::U64(3).add(Number::I64(-5)).value, Number::I64(-2));
        assert_eq!(Number::I64(2).add(Number::F64(0.5)).value, Number::F64(2.5));
        assert_eq!(Number::U64(u64::MAX).add(Number::I64(-1)).value, Number::F64(u64::MAX as f64 - 1.0));
    }

    #[test]
    fn min_max_keep_float_when_either_side_is_float() {
        assert_eq!(Number::I64(1).min(Number::F64(2.0)), Number::F64(1.0));
        assert_eq!(Number::I64(5).max(Number::I64(2)), Number::I64(5));
        assert_eq!(Number::U64(7).max(Number::I64(-1)), Number::U64(7));
    }

    #[test]
    fn compare_across_signedness() {
        assert_eq!(Number::U64(u64::MAX).compare(&Number::I64(-1)), Some(Ordering::Greater));
        assert_eq!(Number::I8(-1).compare(&Number::U8(0)), Some(Ordering::Less));
    }

    #[test]
    fn parse_from_column_value() {
        assert_eq!(Number::from_column_value(&ColumnValue::from("42")), Some(Number::I64(42)));
        assert_eq!(Number::from_column_value(&ColumnValue::from("1.5")), Some(Number::F64(1.5)));
        assert_eq!(Number::from_column_value(&ColumnValue::from("abc")), None);
    }
}
