//! Error types for resource arithmetic and quantity parsing.

use thiserror::Error;

use crate::Quantity;

/// Errors that can occur when parsing quantities or combining resource vectors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourceError {
    /// A subtraction would make a dimension negative.
    #[error("resource <{resource}> underflow: minuend {minuend} is less than subtrahend {subtrahend}")]
    Underflow {
        resource: String,
        minuend: Quantity,
        subtrahend: Quantity,
    },

    /// The quantity string is empty.
    #[error("quantity cannot be empty")]
    Empty,

    /// The quantity string could not be parsed.
    #[error("invalid quantity '{input}': {reason}")]
    InvalidQuantity { input: String, reason: String },

    /// A scale factor was negative, not finite, or too large.
    #[error("invalid scale factor: {0}")]
    InvalidFactor(f64),

    /// A sum or product does not fit in a quantity.
    #[error("resource <{resource}> overflow")]
    Overflow { resource: String },
}

impl ResourceError {
    /// Returns true if this error is a subtraction underflow.
    pub fn is_underflow(&self) -> bool {
        matches!(self, ResourceError::Underflow { .. })
    }

    pub(crate) fn overflow(resource: &str) -> Self {
        ResourceError::Overflow {
            resource: resource.to_string(),
        }
    }

    pub(crate) fn invalid(input: &str, reason: impl Into<String>) -> Self {
        ResourceError::InvalidQuantity {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}
