//! Norm and moment computations over parameter tensors.
//!
//! Used by the FIM estimator and penalty (mean of squared gradients) and by round
//! metrics (L2 distance between successive global models).

use ndarray::Array2;

use crate::model::ParamMap;

/// Squared L2 norm of a tensor, treated as a flat vector.
pub fn sum_square(t: &Array2<f32>) -> f32 {
    t.iter().map(|x| x * x).sum()
}

/// Mean of squared elements; 0.0 for an empty tensor.
pub fn mean_square(t: &Array2<f32>) -> f32 {
    if t.is_empty() {
        return 0.0;
    }
    sum_square(t) / t.len() as f32
}

/// L2 norm of the element-wise difference between two parameter maps.
///
/// Names present in only one map are skipped.
pub fn param_distance(a: &ParamMap, b: &ParamMap) -> f32 {
    let sq: f32 = a
        .iter()
        .filter_map(|(name, ta)| b.get(name).map(|tb| (ta, tb)))
        .filter(|(ta, tb)| ta.dim() == tb.dim())
        .map(|(ta, tb)| ta.iter().zip(tb.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f32>())
        .sum();
    sq.sqrt()
}
