//! Models, losses and the diagonal Fisher-information estimator.
//!
//! Parameters are addressed by name everywhere (`layers.0.weight`, ...);
//! nothing in the crate relies on iteration order to line tensors up.
//!
//! The [`Differentiable`] trait is the only capability the training loop
//! needs from a model: a forward pass, a backward pass that accumulates
//! gradients, and access to the named parameter and gradient maps. Any
//! numeric backend able to provide first-order gradients can implement it.

pub mod loss;
pub mod mlp;

pub use loss::{CrossEntropy, LossFn};
pub use mlp::Mlp;

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView2};

use crate::data::Batch;
use crate::error::{FedError, Result};
use crate::math::mean_square;

/// Named parameter (or gradient) tensors.
pub type ParamMap = BTreeMap<String, Array2<f32>>;

/// Per-parameter diagonal FIM proxy: mean squared gradient of each tensor.
pub type FimMap = BTreeMap<String, f32>;

/// Check that two parameter maps have identical names and shapes.
pub fn check_compatible(expected: &ParamMap, actual: &ParamMap) -> Result<()> {
    if expected.len() != actual.len() || expected.keys().zip(actual.keys()).any(|(a, b)| a != b) {
        return Err(FedError::ShapeMismatch(format!(
            "parameter names differ: expected {:?}, got {:?}",
            expected.keys().collect::<Vec<_>>(),
            actual.keys().collect::<Vec<_>>()
        )));
    }
    for (name, tensor) in expected {
        let other = &actual[name];
        if tensor.dim() != other.dim() {
            return Err(FedError::ShapeMismatch(format!(
                "{}: expected {:?}, got {:?}",
                name,
                tensor.dim(),
                other.dim()
            )));
        }
    }
    Ok(())
}

/// Gradient-capable model with named parameters.
pub trait Differentiable: Clone + Send + Sync {
    /// Class logits for a batch of inputs. Pure in the parameters.
    fn forward(&self, inputs: ArrayView2<f32>) -> Result<Array2<f32>>;

    /// Back-propagate `grad_output` (d loss / d logits) for `inputs`,
    /// adding the result into the gradient buffers.
    fn backward(&mut self, inputs: ArrayView2<f32>, grad_output: ArrayView2<f32>) -> Result<()>;

    /// Current parameters.
    fn parameters(&self) -> &ParamMap;

    /// Current gradient buffers, same names and shapes as the parameters.
    fn gradients(&self) -> &ParamMap;

    /// Mutable parameters and gradient buffers at once, for optimiser steps
    /// and penalty terms.
    fn params_and_grads_mut(&mut self) -> (&mut ParamMap, &mut ParamMap);

    /// Reset every gradient buffer to zero.
    fn zero_grad(&mut self) {
        let (_, grads) = self.params_and_grads_mut();
        for g in grads.values_mut() {
            g.fill(0.0);
        }
    }

    /// Overwrite all parameters; names and shapes must match exactly.
    fn load_parameters(&mut self, params: &ParamMap) -> Result<()> {
        check_compatible(self.parameters(), params)?;
        let (own, _) = self.params_and_grads_mut();
        for (name, tensor) in own.iter_mut() {
            tensor.assign(&params[name]);
        }
        Ok(())
    }

    /// Diagonal Fisher-information proxy on one batch.
    ///
    /// Clears the gradient buffers, back-propagates `loss` once and returns
    /// the mean squared gradient of each parameter tensor. The gradient
    /// buffers hold this batch's gradients afterwards, so any optimiser
    /// step must recompute them.
    fn compute_fim<L: LossFn>(&mut self, batch: &Batch, loss: &L) -> Result<FimMap> {
        self.zero_grad();
        let logits = self.forward(batch.features.view())?;
        let (_, grad_logits) = loss.loss_and_grad(logits.view(), &batch.labels)?;
        self.backward(batch.features.view(), grad_logits.view())?;
        Ok(self
            .gradients()
            .iter()
            .map(|(name, g)| (name.clone(), mean_square(g)))
            .collect())
    }
}
