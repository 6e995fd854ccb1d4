//! Measurement & unit registry (§4.A).
//!
//! A [`Measurement`] is a numeric quantity tagged with a base unit and a
//! decimal exponent, e.g. `4.2` at exponent `-3` with base unit `"V"` reads
//! as `4.2 mV`. Equality compares the value in base units (`quantity *
//! 10^exponent`) together with the base unit string: two measurements with
//! the same base-unit value but different exponents are equal.

pub mod units;

pub use units::{UnitRegistry, DEFAULT_REGISTRY};

use serde::{Deserialize, Serialize};
use std::fmt;

/// A numeric quantity tagged with a base unit and decimal exponent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    quantity: f64,
    exponent: i32,
    base_unit: String,
}

impl Measurement {
    /// Minimum allowed decimal exponent.
    pub const MIN_EXPONENT: i32 = -24;
    /// Maximum allowed decimal exponent.
    pub const MAX_EXPONENT: i32 = 24;

    /// Creates a new measurement. Fails if `base_unit` is empty or `exponent`
    /// is outside `[-24, 24]`.
    pub fn new(quantity: f64, exponent: i32, base_unit: impl Into<String>) -> Option<Self> {
        let base_unit = base_unit.into();
        if base_unit.is_empty() {
            return None;
        }
        if !(Self::MIN_EXPONENT..=Self::MAX_EXPONENT).contains(&exponent) {
            return None;
        }
        Some(Self {
            quantity,
            exponent,
            base_unit,
        })
    }

    /// Convenience constructor for a measurement already expressed in base
    /// units (exponent 0).
    pub fn in_base_units(quantity: f64, base_unit: impl Into<String>) -> Option<Self> {
        Self::new(quantity, 0, base_unit)
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn exponent(&self) -> i32 {
        self.exponent
    }

    pub fn base_unit(&self) -> &str {
        &self.base_unit
    }

    /// The value in base units: `quantity * 10^exponent`.
    pub fn value_in_base_units(&self) -> f64 {
        self.quantity * 10f64.powi(self.exponent)
    }

    /// The derived display unit: SI prefix for this measurement's exponent,
    /// followed by the base unit (e.g. exponent `3`, base `"Hz"` → `"kHz"`).
    pub fn display_unit(&self) -> String {
        format!("{}{}", units::prefix_symbol(self.exponent), self.base_unit)
    }

    /// Returns an equal measurement rescaled to a different exponent (same
    /// base-unit value, different `quantity`/`exponent` pair).
    pub fn rescaled(&self, new_exponent: i32) -> Measurement {
        let base_value = self.value_in_base_units();
        let quantity = base_value / 10f64.powi(new_exponent);
        Measurement {
            quantity,
            exponent: new_exponent,
            base_unit: self.base_unit.clone(),
        }
    }

    /// Returns `true` if `other` has the same base unit as `self`.
    pub fn is_unit_compatible(&self, other: &Measurement) -> bool {
        self.base_unit == other.base_unit
    }
}

impl PartialEq for Measurement {
    fn eq(&self, other: &Self) -> bool {
        self.base_unit == other.base_unit
            && (self.value_in_base_units() - other.value_in_base_units()).abs() < 1e-9
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.quantity, self.display_unit())
    }
}
