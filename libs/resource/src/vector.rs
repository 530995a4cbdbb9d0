//! Multidimensional resource vectors.
//!
//! A [`ResourceVector`] maps resource names to quantities. A missing
//! dimension is zero; the vector keeps itself in canonical form (zero
//! entries are never stored) so that derived equality agrees with that rule.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::quantity::factor_to_micro;
use crate::{Quantity, ResourceError};

/// Well-known CPU dimension, measured in cores.
pub const CPU: &str = "cpu";

/// Well-known memory dimension, measured in bytes.
pub const MEMORY: &str = "memory";

/// A mapping from resource name to a non-negative quantity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Quantity>")]
pub struct ResourceVector(BTreeMap<String, Quantity>);

impl ResourceVector {
    /// Returns the zero vector.
    #[must_use]
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style setter, replacing any existing value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, quantity: Quantity) -> Self {
        self.set(name, quantity);
        self
    }

    /// Returns the quantity for `name`, zero if absent.
    pub fn get(&self, name: &str) -> Quantity {
        self.0.get(name).copied().unwrap_or(Quantity::ZERO)
    }

    /// Sets the quantity for `name`. Setting zero removes the dimension.
    pub fn set(&mut self, name: impl Into<String>, quantity: Quantity) {
        let name = name.into();
        if quantity.is_zero() {
            self.0.remove(&name);
        } else {
            self.0.insert(name, quantity);
        }
    }

    /// CPU quantity in cores.
    pub fn cpu(&self) -> Quantity {
        self.get(CPU)
    }

    /// Memory quantity in bytes.
    pub fn memory(&self) -> Quantity {
        self.get(MEMORY)
    }

    /// Returns true if every dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the non-zero dimensions in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.0.iter().map(|(name, quantity)| (name.as_str(), *quantity))
    }

    /// Elementwise sum. The empty vector is the identity.
    ///
    /// Fails with [`ResourceError::Overflow`] if a dimension does not fit.
    pub fn add(&self, other: &ResourceVector) -> Result<ResourceVector, ResourceError> {
        let mut sum = self.clone();
        for (name, quantity) in &other.0 {
            let total = self
                .get(name)
                .checked_add(*quantity)
                .ok_or_else(|| ResourceError::overflow(name))?;
            sum.0.insert(name.clone(), total);
        }
        Ok(sum)
    }

    /// Adds `other` into `self` in place. On overflow `self` is unchanged.
    pub fn accumulate(&mut self, other: &ResourceVector) -> Result<(), ResourceError> {
        *self = self.add(other)?;
        Ok(())
    }

    /// Sums a sequence of vectors.
    pub fn try_sum<'a, I>(vectors: I) -> Result<ResourceVector, ResourceError>
    where
        I: IntoIterator<Item = &'a ResourceVector>,
    {
        vectors
            .into_iter()
            .try_fold(ResourceVector::empty(), |acc, v| acc.add(v))
    }

    /// Elementwise difference.
    ///
    /// Fails with [`ResourceError::Underflow`] if any dimension of `other`
    /// exceeds the corresponding dimension of `self`; `self` is never
    /// modified.
    pub fn subtract(&self, other: &ResourceVector) -> Result<ResourceVector, ResourceError> {
        let mut diff = self.clone();
        for (name, subtrahend) in &other.0 {
            let minuend = self.get(name);
            let remaining =
                minuend
                    .checked_sub(*subtrahend)
                    .ok_or_else(|| ResourceError::Underflow {
                        resource: name.clone(),
                        minuend,
                        subtrahend: *subtrahend,
                    })?;
            diff.set(name.as_str(), remaining);
        }
        Ok(diff)
    }

    /// Elementwise maximum.
    #[must_use]
    pub fn max(&self, other: &ResourceVector) -> ResourceVector {
        let mut max = self.clone();
        for (name, quantity) in &other.0 {
            let entry = max.0.entry(name.clone()).or_insert(Quantity::ZERO);
            if *quantity > *entry {
                *entry = *quantity;
            }
        }
        max
    }

    /// True iff every dimension of `self` is at most the matching dimension
    /// of `other`, treating absent dimensions as zero.
    pub fn less_equal(&self, other: &ResourceVector) -> bool {
        self.0
            .iter()
            .all(|(name, quantity)| *quantity <= other.get(name))
    }

    /// Elementwise multiplication by `factor`, flooring to milli-units.
    pub fn scale(&self, factor: f64) -> Result<ResourceVector, ResourceError> {
        let factor_micro = factor_to_micro(factor)?;
        self.iter()
            .map(|(name, quantity)| {
                quantity
                    .checked_scale_micro(factor_micro)
                    .map(|scaled| (name, scaled))
                    .ok_or_else(|| ResourceError::overflow(name))
            })
            .collect()
    }

    /// Elementwise integer division. Dividing by zero yields the empty vector.
    #[must_use]
    pub fn divide_by(&self, divisor: u64) -> ResourceVector {
        self.iter()
            .map(|(name, quantity)| (name, quantity.div_floor(divisor)))
            .collect()
    }

    /// Floors the memory dimension to a multiple of `granularity`.
    #[must_use]
    pub fn floor_memory(&self, granularity: Quantity) -> ResourceVector {
        let mut floored = self.clone();
        floored.set(MEMORY, self.memory().floor_to(granularity));
        floored
    }
}

impl From<BTreeMap<String, Quantity>> for ResourceVector {
    fn from(map: BTreeMap<String, Quantity>) -> Self {
        Self(map.into_iter().filter(|(_, q)| !q.is_zero()).collect())
    }
}

impl<K: Into<String>> FromIterator<(K, Quantity)> for ResourceVector {
    fn from_iter<I: IntoIterator<Item = (K, Quantity)>>(iter: I) -> Self {
        let mut vector = ResourceVector::empty();
        for (name, quantity) in iter {
            vector.set(name, quantity);
        }
        vector
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, quantity)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {quantity}")?;
        }
        f.write_str("}")
    }
}
