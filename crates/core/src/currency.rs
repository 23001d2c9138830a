//! Monetary amounts in minor currency units.

use serde::{Deserialize, Serialize};

/// An amount of money as an integer count of minor units (e.g. kopecks, cents).
///
/// Never a floating point value. Arithmetic is checked so an overflow surfaces
/// as `None` rather than wrapping.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(i64);

impl Currency {
    pub const ZERO: Currency = Currency(0);

    pub const fn new(minor_units: i64) -> Self {
        Self(minor_units)
    }

    pub const fn minor_units(self) -> i64 {
        self.0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, rhs: Currency) -> Option<Currency> {
        self.0.checked_add(rhs.0).map(Currency)
    }

    pub fn checked_sub(self, rhs: Currency) -> Option<Currency> {
        self.0.checked_sub(rhs.0).map(Currency)
    }
}

impl From<i64> for Currency {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Currency> for i64 {
    fn from(value: Currency) -> Self {
        value.0
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
