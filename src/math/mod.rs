//! Mathematical primitives for fedfim.
//!
//! - [`norms`] - sum/mean of squares and parameter-map distance

pub mod norms;

pub use norms::{mean_square, param_distance, sum_square};
