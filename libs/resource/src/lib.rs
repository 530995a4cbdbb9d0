//! # clusterinfo-resource
//!
//! Resource quantities and multidimensional resource arithmetic shared by
//! the cluster ledger controller and the scheduler's admission gate.
//!
//! ## Design Principles
//!
//! - Quantities are fixed-point (milli-units) and never negative
//! - Arithmetic never clamps: subtraction that would go negative is an error
//! - Addition and scaling never wrap: overflow is an error
//! - A missing dimension is exactly the same as a zero dimension
//!
//! ## Operations
//!
//! | Operation | Method |
//! |---|---|
//! | Add | [`ResourceVector::add`] |
//! | Subtract | [`ResourceVector::subtract`] |
//! | Max | [`ResourceVector::max`] |
//! | LessEqual | [`ResourceVector::less_equal`] |
//! | Scale | [`ResourceVector::scale`] |
//! | Empty | [`ResourceVector::empty`] |

mod error;
mod quantity;
mod vector;

pub use error::ResourceError;
pub use quantity::{check_scale_factor, Quantity, MAX_SCALE_FACTOR};
pub use vector::{ResourceVector, CPU, MEMORY};

/// One decimal gigabyte, the granularity published memory totals are floored to.
///
/// Deliberately 1e9, not the 1e6 (megabyte) flooring some controllers apply.
pub const GIGABYTE: Quantity = Quantity::from_units(1_000_000_000);
