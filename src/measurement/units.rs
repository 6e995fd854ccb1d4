//! SI prefix table and the process-wide unit conversion registry (§4.A).

use crate::error::{AppResult, DaqError};
use crate::measurement::Measurement;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// `(exponent, prefix symbol)` pairs, longest symbol first so greedy prefix
/// matching picks `"da"` before a spurious single-letter match.
const SI_PREFIXES: &[(i32, &str)] = &[
    (1, "da"),
    (24, "Y"),
    (21, "Z"),
    (18, "E"),
    (15, "P"),
    (12, "T"),
    (9, "G"),
    (6, "M"),
    (3, "k"),
    (2, "h"),
    (-1, "d"),
    (-2, "c"),
    (-3, "m"),
    (-6, "µ"),
    (-6, "u"),
    (-9, "n"),
    (-12, "p"),
    (-15, "f"),
    (-18, "a"),
    (-21, "z"),
    (-24, "y"),
];

/// Returns the SI prefix symbol for a given exponent, or `""` for exponent 0.
pub fn prefix_symbol(exponent: i32) -> &'static str {
    if exponent == 0 {
        return "";
    }
    SI_PREFIXES
        .iter()
        .find(|(exp, sym)| *exp == exponent && *sym != "u")
        .map(|(_, sym)| *sym)
        .unwrap_or("")
}

/// Splits a display unit string such as `"kHz"` into its `(exponent, base_unit)`
/// parts, e.g. `(3, "Hz")`. A prefix only matches if a non-empty base unit
/// remains, so single-character base units (e.g. `"s"`, `"V"`) are never
/// mistaken for a bare prefix.
pub fn split_prefixed_unit(target: &str) -> (i32, String) {
    let mut candidates: Vec<&(i32, &str)> = SI_PREFIXES.iter().collect();
    candidates.sort_by_key(|(_, sym)| std::cmp::Reverse(sym.len()));

    for (exponent, symbol) in candidates {
        if let Some(rest) = target.strip_prefix(symbol) {
            if !rest.is_empty() {
                return (*exponent, rest.to_string());
            }
        }
    }
    (0, target.to_string())
}

type ConversionFn = Arc<dyn Fn(&Measurement) -> Measurement + Send + Sync>;

/// A process-wide mapping `(fromBaseUnit, toBaseUnit) -> conversion fn`,
/// threaded explicitly through every call site per the "ambient unit
/// registry" redesign note (spec §9): the global instance in
/// [`default_registry`] is a convenience wrapper over this type, never the
/// only path to it.
#[derive(Default)]
pub struct UnitRegistry {
    conversions: HashMap<(String, String), ConversionFn>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self {
            conversions: HashMap::new(),
        }
    }

    /// Registers a conversion function from `from_base_unit` to `to_base_unit`.
    /// Registration should complete before any pipeline starts; the registry
    /// is read-mostly once acquisition begins (§5).
    pub fn register<F>(&mut self, from_base_unit: &str, to_base_unit: &str, convert: F)
    where
        F: Fn(&Measurement) -> Measurement + Send + Sync + 'static,
    {
        self.conversions.insert(
            (from_base_unit.to_string(), to_base_unit.to_string()),
            Arc::new(convert),
        );
    }

    /// Converts `measurement` to the given target display unit (e.g.
    /// `"kHz"`, `"mV"`). If the target's base unit matches the measurement's
    /// base unit, this is a pure rescale; otherwise a registered conversion
    /// function is applied.
    pub fn convert(&self, measurement: &Measurement, target_unit: &str) -> AppResult<Measurement> {
        let (target_exponent, target_base) = split_prefixed_unit(target_unit);

        if target_base == measurement.base_unit() {
            return Ok(measurement.rescaled(target_exponent));
        }

        let key = (measurement.base_unit().to_string(), target_base.clone());
        match self.conversions.get(&key) {
            Some(convert) => {
                let converted = convert(measurement);
                Ok(converted.rescaled(target_exponent))
            }
            None => Err(DaqError::UnknownConversion {
                from: measurement.base_unit().to_string(),
                to: target_base,
            }),
        }
    }
}

/// Default process-wide registry instance. Pipeline code should prefer
/// threading a `&UnitRegistry` explicitly; this exists for call sites (tests,
/// ad-hoc tooling) where that is impractical.
pub static DEFAULT_REGISTRY: Lazy<RwLock<UnitRegistry>> =
    Lazy::new(|| RwLock::new(UnitRegistry::new()));
