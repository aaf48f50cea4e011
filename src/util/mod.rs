//! Utility types shared across the crate.
//!
//! - [`TracerError`] / [`Result`] - Error handling
//! - Math type re-exports from glam and the device texel type

mod error;
mod math;

pub use error::*;
pub use math::*;
