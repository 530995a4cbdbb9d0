//! Fixed-point resource quantities.
//!
//! A [`Quantity`] is a non-negative amount stored as a count of milli-units,
//! so `500m` CPU and `8Gi` of memory share one representation without any
//! floating point. Parsing accepts the usual cluster notation:
//!
//! - plain integers and decimals: `4`, `0.5`
//! - milli suffix: `250m`
//! - decimal SI suffixes: `k`, `M`, `G`, `T`, `P`, `E`
//! - binary suffixes: `Ki`, `Mi`, `Gi`, `Ti`, `Pi`, `Ei`
//!
//! Amounts finer than one milli-unit are rejected rather than rounded.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ResourceError;

/// Milli-units per whole unit.
const MILLI: u128 = 1_000;

/// Fixed-point precision used when applying a floating point factor.
const MICRO: u128 = 1_000_000;

/// Longest fractional part accepted by the parser.
const MAX_FRACTION_DIGITS: usize = 18;

/// A non-negative resource amount with milli-unit precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(u128);

impl Quantity {
    /// The zero quantity.
    pub const ZERO: Quantity = Quantity(0);

    /// Creates a quantity of whole units (cores, bytes, ...).
    #[must_use]
    pub const fn from_units(units: u64) -> Self {
        Self(units as u128 * MILLI)
    }

    /// Creates a quantity from a raw milli-unit count.
    #[must_use]
    pub const fn from_milli(milli: u128) -> Self {
        Self(milli)
    }

    /// Returns the raw milli-unit count.
    #[must_use]
    pub const fn milli(&self) -> u128 {
        self.0
    }

    /// Returns the whole units, rounding down.
    #[must_use]
    pub const fn units(&self) -> u128 {
        self.0 / MILLI
    }

    /// Returns true if the quantity is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Subtracts `rhs`, returning `None` if the result would be negative.
    #[must_use]
    pub fn checked_sub(self, rhs: Quantity) -> Option<Quantity> {
        self.0.checked_sub(rhs.0).map(Quantity)
    }

    /// Adds `rhs`, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, rhs: Quantity) -> Option<Quantity> {
        self.0.checked_add(rhs.0).map(Quantity)
    }

    /// Multiplies by a factor expressed in millionths, flooring to milli-units.
    /// Returns `None` on overflow.
    #[must_use]
    pub(crate) fn checked_scale_micro(self, factor_micro: u128) -> Option<Quantity> {
        self.0.checked_mul(factor_micro).map(|v| Quantity(v / MICRO))
    }

    /// Integer division by `divisor`, flooring to milli-units.
    ///
    /// Dividing by zero yields zero.
    #[must_use]
    pub fn div_floor(self, divisor: u64) -> Quantity {
        if divisor == 0 {
            return Quantity::ZERO;
        }
        Quantity(self.0 / divisor as u128)
    }

    /// Floors the quantity to a multiple of `granularity`.
    #[must_use]
    pub fn floor_to(self, granularity: Quantity) -> Quantity {
        if granularity.is_zero() {
            return self;
        }
        Quantity(self.0 / granularity.0 * granularity.0)
    }
}

/// Largest factor accepted for scaling: its millionths must fit in 64 bits.
pub const MAX_SCALE_FACTOR: f64 = u64::MAX as f64 / MICRO as f64;

/// Converts a floating point factor into millionths.
pub(crate) fn factor_to_micro(factor: f64) -> Result<u128, ResourceError> {
    check_scale_factor(factor)?;
    Ok((factor * MICRO as f64).round() as u128)
}

/// Checks that `factor` is finite, non-negative and at most [`MAX_SCALE_FACTOR`].
pub fn check_scale_factor(factor: f64) -> Result<(), ResourceError> {
    if !factor.is_finite() || !(0.0..=MAX_SCALE_FACTOR).contains(&factor) {
        return Err(ResourceError::InvalidFactor(factor));
    }
    Ok(())
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % MILLI == 0 {
            write!(f, "{}", self.0 / MILLI)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

/// Milli-units per one unit of the given suffix.
fn suffix_multiplier(suffix: &str) -> Option<u128> {
    let multiplier = match suffix {
        "" => MILLI,
        "m" => 1,
        "k" => MILLI * 1_000,
        "M" => MILLI * 1_000_000,
        "G" => MILLI * 1_000_000_000,
        "T" => MILLI * 1_000_000_000_000,
        "P" => MILLI * 1_000_000_000_000_000,
        "E" => MILLI * 1_000_000_000_000_000_000,
        "Ki" => MILLI << 10,
        "Mi" => MILLI << 20,
        "Gi" => MILLI << 30,
        "Ti" => MILLI << 40,
        "Pi" => MILLI << 50,
        "Ei" => MILLI << 60,
        _ => return None,
    };
    Some(multiplier)
}

impl FromStr for Quantity {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.is_empty() {
            return Err(ResourceError::Empty);
        }
        if input.starts_with('-') {
            return Err(ResourceError::invalid(s, "quantity cannot be negative"));
        }
        let unsigned = input.strip_prefix('+').unwrap_or(input);

        let split = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(split);

        if number.is_empty() || number == "." {
            return Err(ResourceError::invalid(s, "missing numeric part"));
        }

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if fraction.contains('.') {
            return Err(ResourceError::invalid(s, "more than one decimal point"));
        }
        if fraction.len() > MAX_FRACTION_DIGITS {
            return Err(ResourceError::invalid(s, "too many fractional digits"));
        }

        let multiplier = suffix_multiplier(suffix)
            .ok_or_else(|| ResourceError::invalid(s, format!("unknown suffix '{suffix}'")))?;

        let overflow = || ResourceError::invalid(s, "quantity is too large");
        let whole_value: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| overflow())?
        };
        let fraction_value: u128 = if fraction.is_empty() {
            0
        } else {
            fraction.parse().map_err(|_| overflow())?
        };

        let denominator = 10u128.pow(fraction.len() as u32);
        let scaled = whole_value
            .checked_mul(denominator)
            .and_then(|v| v.checked_add(fraction_value))
            .and_then(|v| v.checked_mul(multiplier))
            .ok_or_else(overflow)?;

        if scaled % denominator != 0 {
            return Err(ResourceError::invalid(
                s,
                "precision finer than one milli-unit",
            ));
        }

        Ok(Quantity(scaled / denominator))
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantityVisitor;

        impl Visitor<'_> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a quantity string such as \"500m\" or \"8Gi\", or a whole number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
                Ok(Quantity::from_units(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
                u64::try_from(v)
                    .map(Quantity::from_units)
                    .map_err(|_| E::custom("quantity cannot be negative"))
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}
