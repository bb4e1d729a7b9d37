//! Inclusive integer ranges with unbounded endpoints.

use std::fmt;

/// Sentinel used as the upper bound of a range with no maximum.
pub const INT_OO: i64 = i64::MAX;

/// Sentinel used as the lower bound of a range with no minimum.
pub const NEG_INT_OO: i64 = i64::MIN;

/// An inclusive range `[lower, upper]` of integer values.
///
/// An upper bound of [`INT_OO`] (or lower bound of [`NEG_INT_OO`]) means the
/// range is unbounded in that direction. Arithmetic on ranges saturates at
/// these sentinels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueRange {
    pub lower: i64,
    pub upper: i64,
}

impl ValueRange {
    pub const fn new(lower: i64, upper: i64) -> Self {
        ValueRange { lower, upper }
    }

    /// Range containing every integer.
    pub const fn unbounded() -> Self {
        ValueRange::new(NEG_INT_OO, INT_OO)
    }

    /// Range `[lower, int_oo]`.
    pub const fn at_least(lower: i64) -> Self {
        ValueRange::new(lower, INT_OO)
    }

    /// Range containing only `value`.
    pub const fn exact(value: i64) -> Self {
        ValueRange::new(value, value)
    }

    pub fn contains(&self, value: i64) -> bool {
        value >= self.lower && value <= self.upper
    }

    pub fn is_empty(&self) -> bool {
        self.lower > self.upper
    }

    /// Return the single value in this range, if it has exactly one.
    pub fn as_singleton(&self) -> Option<i64> {
        (self.lower == self.upper).then_some(self.lower)
    }

    /// Return true if every value in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &ValueRange) -> bool {
        self.lower >= other.lower && self.upper <= other.upper
    }

    /// Return the values common to both ranges, or `None` if there are none.
    pub fn intersect(&self, other: &ValueRange) -> Option<ValueRange> {
        let range = ValueRange::new(self.lower.max(other.lower), self.upper.min(other.upper));
        (!range.is_empty()).then_some(range)
    }

    /// Return the smallest range containing both ranges.
    pub fn union(&self, other: &ValueRange) -> ValueRange {
        ValueRange::new(self.lower.min(other.lower), self.upper.max(other.upper))
    }

    pub fn is_upper_unbounded(&self) -> bool {
        self.upper == INT_OO
    }

    pub(crate) fn add(&self, other: &ValueRange) -> ValueRange {
        ValueRange::new(
            sat_add(self.lower, other.lower),
            sat_add(self.upper, other.upper),
        )
    }

    pub(crate) fn neg(&self) -> ValueRange {
        ValueRange::new(sat_neg(self.upper), sat_neg(self.lower))
    }

    pub(crate) fn mul(&self, other: &ValueRange) -> ValueRange {
        let products = [
            sat_mul(self.lower, other.lower),
            sat_mul(self.lower, other.upper),
            sat_mul(self.upper, other.lower),
            sat_mul(self.upper, other.upper),
        ];
        ValueRange::new(
            products.iter().copied().min().unwrap_or(NEG_INT_OO),
            products.iter().copied().max().unwrap_or(INT_OO),
        )
    }

    /// Bounds of floor division, when the divisor is known to be positive.
    pub(crate) fn floor_div(&self, other: &ValueRange) -> ValueRange {
        if other.lower <= 0 {
            return ValueRange::unbounded();
        }
        let quotients = [
            sat_div(self.lower, other.lower),
            sat_div(self.lower, other.upper),
            sat_div(self.upper, other.lower),
            sat_div(self.upper, other.upper),
        ];
        ValueRange::new(
            quotients.iter().copied().min().unwrap_or(NEG_INT_OO),
            quotients.iter().copied().max().unwrap_or(INT_OO),
        )
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        ValueRange::unbounded()
    }
}

fn sat_add(a: i64, b: i64) -> i64 {
    if a == INT_OO || b == INT_OO {
        INT_OO
    } else if a == NEG_INT_OO || b == NEG_INT_OO {
        NEG_INT_OO
    } else {
        a.saturating_add(b)
    }
}

fn sat_neg(a: i64) -> i64 {
    match a {
        INT_OO => NEG_INT_OO,
        NEG_INT_OO => INT_OO,
        a => -a,
    }
}

fn sat_mul(a: i64, b: i64) -> i64 {
    if a == 0 || b == 0 {
        0
    } else {
        a.saturating_mul(b)
    }
}

fn sat_div(a: i64, b: i64) -> i64 {
    match (a, b) {
        (INT_OO, _) | (NEG_INT_OO, _) => a,
        (_, INT_OO) => 0,
        (a, b) => a.div_euclid(b),
    }
}

fn fmt_bound(value: i64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        INT_OO => write!(f, "int_oo"),
        NEG_INT_OO => write!(f, "-int_oo"),
        value => write!(f, "{}", value),
    }
}

impl fmt::Display for ValueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        fmt_bound(self.lower, f)?;
        write!(f, ", ")?;
        fmt_bound(self.upper, f)?;
        write!(f, "]")
    }
}
