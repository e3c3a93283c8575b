//! Physical units and the value types parameters can carry.
//!
//! The framework never converts values on write. It only answers one question
//! before a write reaches the driver: is this value compatible with the unit
//! the parameter declares? [`value_compatible`] is that predicate.
//!
//! [`Quantity`] pairs a magnitude with a [`Unit`]. Units of the same
//! [`Dimension`] compare and convert through a scale factor to the SI base
//! unit, which is what limiters like `-10 mm <= v <= 10 mm` need when the
//! candidate value arrives in meters.
//!
//! ```rust
//! use beamline_core::units::{value_compatible, Quantity, MILLIMETER, METER, SECOND};
//!
//! let v = Quantity::new(5.0, MILLIMETER);
//! assert!(value_compatible(&v, &METER));
//! assert!(!value_compatible(&v, &SECOND));
//! assert_eq!(v.to(METER).magnitude(), 0.005);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Physical dimension of a unit. Units are compatible iff dimensions match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Length,
    Angle,
    Time,
    Energy,
    Velocity,
    AngularVelocity,
    Temperature,
    Dimensionless,
}

/// A unit of measurement: display symbol, dimension and scale to SI base.
#[derive(Debug, Clone, Copy)]
pub struct Unit {
    symbol: &'static str,
    dimension: Dimension,
    scale: f64,
}

impl Unit {
    /// Define a unit. `scale` converts one of this unit into the SI base unit
    /// of `dimension`.
    pub const fn new(symbol: &'static str, dimension: Dimension, scale: f64) -> Self {
        Self {
            symbol,
            dimension,
            scale,
        }
    }

    pub fn symbol(&self) -> &'static str {
        self.symbol
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Look up one of the predefined units by symbol.
    pub fn from_symbol(symbol: &str) -> Option<Unit> {
        KNOWN_UNITS.iter().copied().find(|u| u.symbol == symbol)
    }

    /// Whether values in `other` can be used where `self` is expected.
    pub fn is_compatible_with(&self, other: &Unit) -> bool {
        self.dimension == other.dimension
    }
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.symbol == other.symbol && self.dimension == other.dimension
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol)
    }
}

pub const METER: Unit = Unit::new("m", Dimension::Length, 1.0);
pub const MILLIMETER: Unit = Unit::new("mm", Dimension::Length, 1e-3);
pub const MICROMETER: Unit = Unit::new("um", Dimension::Length, 1e-6);
pub const NANOMETER: Unit = Unit::new("nm", Dimension::Length, 1e-9);
pub const RADIAN: Unit = Unit::new("rad", Dimension::Angle, 1.0);
pub const DEGREE: Unit = Unit::new("deg", Dimension::Angle, std::f64::consts::PI / 180.0);
pub const SECOND: Unit = Unit::new("s", Dimension::Time, 1.0);
pub const MILLISECOND: Unit = Unit::new("ms", Dimension::Time, 1e-3);
pub const ELECTRONVOLT: Unit = Unit::new("eV", Dimension::Energy, 1.602_176_634e-19);
pub const KILOELECTRONVOLT: Unit = Unit::new("keV", Dimension::Energy, 1.602_176_634e-16);
pub const METER_PER_SECOND: Unit = Unit::new("m/s", Dimension::Velocity, 1.0);
pub const MILLIMETER_PER_SECOND: Unit = Unit::new("mm/s", Dimension::Velocity, 1e-3);
pub const DEGREE_PER_SECOND: Unit = Unit::new(
    "deg/s",
    Dimension::AngularVelocity,
    std::f64::consts::PI / 180.0,
);
pub const KELVIN: Unit = Unit::new("K", Dimension::Temperature, 1.0);
pub const COUNT: Unit = Unit::new("count", Dimension::Dimensionless, 1.0);

const KNOWN_UNITS: &[Unit] = &[
    METER,
    MILLIMETER,
    MICROMETER,
    NANOMETER,
    RADIAN,
    DEGREE,
    SECOND,
    MILLISECOND,
    ELECTRONVOLT,
    KILOELECTRONVOLT,
    METER_PER_SECOND,
    MILLIMETER_PER_SECOND,
    DEGREE_PER_SECOND,
    KELVIN,
    COUNT,
];

// =============================================================================
// Quantity
// =============================================================================

/// A magnitude tagged with a unit.
///
/// Serialized as `{"magnitude": 5.0, "unit": "mm"}`; only predefined unit
/// symbols deserialize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "QuantityRepr", into = "QuantityRepr")]
pub struct Quantity {
    magnitude: f64,
    unit: Unit,
}

#[derive(Serialize, Deserialize)]
struct QuantityRepr {
    magnitude: f64,
    unit: String,
}

impl TryFrom<QuantityRepr> for Quantity {
    type Error = String;

    fn try_from(repr: QuantityRepr) -> Result<Self, Self::Error> {
        let unit =
            Unit::from_symbol(&repr.unit).ok_or_else(|| format!("unknown unit `{}'", repr.unit))?;
        Ok(Quantity::new(repr.magnitude, unit))
    }
}

impl From<Quantity> for QuantityRepr {
    fn from(q: Quantity) -> Self {
        Self {
            magnitude: q.magnitude,
            unit: q.unit.symbol.to_string(),
        }
    }
}

impl Quantity {
    pub const fn new(magnitude: f64, unit: Unit) -> Self {
        Self { magnitude, unit }
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Express this quantity in `unit`.
    ///
    /// Dimensions are not checked; callers convert only between compatible
    /// units (see [`Quantity::checked_to`]).
    pub fn to(&self, unit: Unit) -> Quantity {
        if self.unit == unit {
            return *self;
        }
        Quantity::new(self.magnitude * self.unit.scale / unit.scale, unit)
    }

    /// Express this quantity in `unit` if the dimensions match.
    pub fn checked_to(&self, unit: Unit) -> Option<Quantity> {
        self.unit.is_compatible_with(&unit).then(|| self.to(unit))
    }

    /// Sum in the unit of `self`, or `None` for mismatched dimensions.
    pub fn checked_add(&self, other: &Quantity) -> Option<Quantity> {
        let other = other.checked_to(self.unit)?;
        Some(Quantity::new(self.magnitude + other.magnitude, self.unit))
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let other = other.checked_to(self.unit)?;
        self.magnitude.partial_cmp(&other.magnitude)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.magnitude, self.unit)
    }
}

// =============================================================================
// ParameterValue
// =============================================================================

/// Values a [`Parameter`](crate::parameter::Parameter) can carry.
///
/// The bounds cover what the framework needs: cloning into setters, crossing
/// threads, display for logs and tables, and JSON for generic access.
pub trait ParameterValue:
    Clone + fmt::Debug + fmt::Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Whether this value may be written to a parameter declaring `unit`.
    fn is_compatible(&self, unit: &Unit) -> bool;
}

impl ParameterValue for Quantity {
    fn is_compatible(&self, unit: &Unit) -> bool {
        self.unit.is_compatible_with(unit)
    }
}

macro_rules! unitless_value {
    ($($ty:ty),*) => {
        $(
            impl ParameterValue for $ty {
                fn is_compatible(&self, _unit: &Unit) -> bool {
                    false
                }
            }
        )*
    };
}

unitless_value!(f64, i64, u32, bool, String);

/// Check if `value` is compatible with `unit`.
pub fn value_compatible<T: ParameterValue>(value: &T, unit: &Unit) -> bool {
    value.is_compatible(unit)
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_within_dimension() {
        let q = Quantity::new(1500.0, MILLIMETER).to(METER);
        assert_eq!(q.magnitude(), 1.5);
        assert_eq!(q.unit(), METER);
        assert!(Quantity::new(1.0, METER).checked_to(SECOND).is_none());
    }

    #[test]
    fn test_ordering_across_units() {
        let limit = Quantity::new(10.0, MILLIMETER);
        assert!(Quantity::new(0.005, METER) < limit);
        assert!(Quantity::new(0.05, METER) > limit);
        assert_eq!(Quantity::new(5.0, SECOND).partial_cmp(&limit), None);
    }

    #[test]
    fn test_compatibility() {
        assert!(value_compatible(&Quantity::new(5.0, MILLIMETER), &METER));
        assert!(!value_compatible(&Quantity::new(5.0, SECOND), &MILLIMETER));
        assert!(!value_compatible(&5.0_f64, &MILLIMETER));
        assert!(!value_compatible(&"5".to_string(), &MILLIMETER));
    }

    #[test]
    fn test_checked_add() {
        let sum = Quantity::new(1.0, MILLIMETER)
            .checked_add(&Quantity::new(0.002, METER))
            .unwrap();
        assert_eq!(sum, Quantity::new(3.0, MILLIMETER));
        assert!(Quantity::new(1.0, MILLIMETER)
            .checked_add(&Quantity::new(1.0, SECOND))
            .is_none());
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(Quantity::new(5.0, MILLIMETER)).unwrap();
        assert_eq!(json, serde_json::json!({"magnitude": 5.0, "unit": "mm"}));

        let back: Quantity = serde_json::from_value(json).unwrap();
        assert_eq!(back, Quantity::new(5.0, MILLIMETER));

        let bad = serde_json::from_value::<Quantity>(serde_json::json!({
            "magnitude": 1.0,
            "unit": "furlong"
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Quantity::new(5.0, MILLIMETER).to_string(), "5 mm");
    }
}
