//! Loss functions over class logits.

use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{FedError, Result};

/// A differentiable loss over a batch of logits.
pub trait LossFn: Send + Sync {
    /// Mean loss over the batch and its gradient w.r.t. `logits`.
    fn loss_and_grad(
        &self,
        logits: ArrayView2<f32>,
        labels: &[usize],
    ) -> Result<(f32, Array2<f32>)>;

    /// Mean loss over the batch without the gradient.
    fn loss(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<f32> {
        self.loss_and_grad(logits, labels).map(|(l, _)| l)
    }
}

impl<T: LossFn + ?Sized> LossFn for &T {
    fn loss_and_grad(
        &self,
        logits: ArrayView2<f32>,
        labels: &[usize],
    ) -> Result<(f32, Array2<f32>)> {
        (**self).loss_and_grad(logits, labels)
    }
}

/// Softmax cross-entropy, averaged over the batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrossEntropy;

/// Row-wise numerically stable softmax.
pub fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut probs = logits.to_owned();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

impl LossFn for CrossEntropy {
    fn loss_and_grad(
        &self,
        logits: ArrayView2<f32>,
        labels: &[usize],
    ) -> Result<(f32, Array2<f32>)> {
        let (n, classes) = logits.dim();
        if n != labels.len() {
            return Err(FedError::ShapeMismatch(format!(
                "{} logit rows vs {} labels",
                n,
                labels.len()
            )));
        }
        if n == 0 {
            return Err(FedError::EmptyDataset("cross-entropy over empty batch".into()));
        }

        let mut grad = softmax(logits);
        let mut total = 0.0f32;
        for (i, &label) in labels.iter().enumerate() {
            if label >= classes {
                return Err(FedError::LabelOutOfRange {
                    label,
                    num_classes: classes,
                });
            }
            total -= grad[[i, label]].max(f32::MIN_POSITIVE).ln();
            grad[[i, label]] -= 1.0;
        }

        let n = n as f32;
        grad.mapv_inplace(|g| g / n);
        Ok((total / n, grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let p = softmax(array![[1.0, 2.0, 3.0], [1000.0, 0.0, -1000.0]].view());
        for row in p.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!(p.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_uniform_logits_loss_is_ln_c() {
        let (loss, _) = CrossEntropy
            .loss_and_grad(array![[0.0, 0.0, 0.0, 0.0]].view(), &[2])
            .unwrap();
        assert!((loss - 4.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let logits = array![[0.3f32, -1.2, 0.8], [1.5, 0.1, -0.4]];
        let labels = [2, 0];
        let (_, grad) = CrossEntropy.loss_and_grad(logits.view(), &labels).unwrap();

        let eps = 1e-3;
        for i in 0..2 {
            for j in 0..3 {
                let mut plus = logits.clone();
                plus[[i, j]] += eps;
                let mut minus = logits.clone();
                minus[[i, j]] -= eps;
                let numeric = (CrossEntropy.loss(plus.view(), &labels).unwrap()
                    - CrossEntropy.loss(minus.view(), &labels).unwrap())
                    / (2.0 * eps);
                assert!(
                    (numeric - grad[[i, j]]).abs() < 1e-3,
                    "grad[{},{}]: analytic {} numeric {}",
                    i,
                    j,
                    grad[[i, j]],
                    numeric
                );
            }
        }
    }

    #[test]
    fn test_label_mismatch() {
        assert!(CrossEntropy.loss(array![[0.0, 1.0]].view(), &[0, 1]).is_err());
        assert!(CrossEntropy.loss(array![[0.0, 1.0]].view(), &[2]).is_err());
    }
}
