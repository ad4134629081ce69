//! Fully connected ReLU network with hand-written back-propagation.

use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use super::{Differentiable, ParamMap};
use crate::error::{FedError, Result};

/// Multi-layer perceptron mapping features to class logits.
///
/// Layer `i` owns `layers.{i}.weight` (`fan_in x fan_out`) and
/// `layers.{i}.bias` (`1 x fan_out`). Hidden layers use ReLU; the last
/// layer emits raw logits.
#[derive(Clone, Debug)]
pub struct Mlp {
    layer_sizes: Vec<usize>,
    params: ParamMap,
    grads: ParamMap,
}

fn weight_name(layer: usize) -> String {
    format!("layers.{}.weight", layer)
}

fn bias_name(layer: usize) -> String {
    format!("layers.{}.bias", layer)
}

impl Mlp {
    /// Build a network with `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` init.
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        hidden: &[usize],
        num_classes: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let mut layer_sizes = Vec::with_capacity(hidden.len() + 2);
        layer_sizes.push(input_dim);
        layer_sizes.extend_from_slice(hidden);
        layer_sizes.push(num_classes);
        if layer_sizes.iter().any(|&s| s == 0) {
            return Err(FedError::Configuration(format!(
                "layer sizes must be > 0, got {:?}",
                layer_sizes
            )));
        }

        let mut params = ParamMap::new();
        for (i, pair) in layer_sizes.windows(2).enumerate() {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let bound = 1.0 / (fan_in as f32).sqrt();
            let dist = Uniform::new_inclusive(-bound, bound);
            params.insert(
                weight_name(i),
                Array2::from_shape_fn((fan_in, fan_out), |_| dist.sample(rng)),
            );
            params.insert(
                bias_name(i),
                Array2::from_shape_fn((1, fan_out), |_| dist.sample(rng)),
            );
        }

        Ok(Self::from_parts(layer_sizes, params))
    }

    /// Rebuild a network from a parameter map, inferring layer sizes from
    /// the `layers.{i}.weight` shapes.
    pub fn from_parameters(params: ParamMap) -> Result<Self> {
        let mut layer_sizes = Vec::new();
        let mut layer = 0;
        while let Some(w) = params.get(&weight_name(layer)) {
            let (fan_in, fan_out) = w.dim();
            match layer_sizes.last() {
                None => layer_sizes.push(fan_in),
                Some(&prev) if prev != fan_in => {
                    return Err(FedError::ShapeMismatch(format!(
                        "{} expects {} inputs, previous layer emits {}",
                        weight_name(layer),
                        fan_in,
                        prev
                    )))
                }
                Some(_) => {}
            }
            match params.get(&bias_name(layer)) {
                Some(b) if b.dim() == (1, fan_out) => {}
                _ => {
                    return Err(FedError::ShapeMismatch(format!(
                        "{} missing or not 1x{}",
                        bias_name(layer),
                        fan_out
                    )))
                }
            }
            layer_sizes.push(fan_out);
            layer += 1;
        }

        if layer == 0 || params.len() != 2 * layer {
            return Err(FedError::ShapeMismatch(format!(
                "expected {} MLP tensors, found {}",
                2 * layer,
                params.len()
            )));
        }
        Ok(Self::from_parts(layer_sizes, params))
    }

    fn from_parts(layer_sizes: Vec<usize>, params: ParamMap) -> Self {
        let grads = params
            .iter()
            .map(|(name, p)| (name.clone(), Array2::zeros(p.dim())))
            .collect();
        Self {
            layer_sizes,
            params,
            grads,
        }
    }

    /// Input, hidden and output widths.
    pub fn layer_sizes(&self) -> &[usize] {
        &self.layer_sizes
    }

    fn num_layers(&self) -> usize {
        self.layer_sizes.len() - 1
    }

    fn param(&self, name: &str) -> Result<&Array2<f32>> {
        self.params
            .get(name)
            .ok_or_else(|| FedError::ShapeMismatch(format!("missing parameter {}", name)))
    }

    /// Pre-activations of every layer for `inputs`.
    fn pre_activations(&self, inputs: ArrayView2<f32>) -> Result<Vec<Array2<f32>>> {
        if inputs.ncols() != self.layer_sizes[0] {
            return Err(FedError::ShapeMismatch(format!(
                "input has {} features, model expects {}",
                inputs.ncols(),
                self.layer_sizes[0]
            )));
        }
        let mut zs: Vec<Array2<f32>> = Vec::with_capacity(self.num_layers());
        for layer in 0..self.num_layers() {
            let w = self.param(&weight_name(layer))?;
            let b = self.param(&bias_name(layer))?;
            let z = match zs.last() {
                None => inputs.dot(w) + b,
                Some(prev) => prev.mapv(relu).dot(w) + b,
            };
            zs.push(z);
        }
        Ok(zs)
    }
}

fn relu(v: f32) -> f32 {
    v.max(0.0)
}

impl Differentiable for Mlp {
    fn forward(&self, inputs: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.pre_activations(inputs)?
            .pop()
            .ok_or_else(|| FedError::ShapeMismatch("model has no layers".into()))
    }

    fn backward(&mut self, inputs: ArrayView2<f32>, grad_output: ArrayView2<f32>) -> Result<()> {
        let zs = self.pre_activations(inputs)?;
        let out_dim = self.layer_sizes[self.num_layers()];
        if grad_output.dim() != (inputs.nrows(), out_dim) {
            return Err(FedError::ShapeMismatch(format!(
                "grad_output {:?}, expected {:?}",
                grad_output.dim(),
                (inputs.nrows(), out_dim)
            )));
        }

        let mut delta = grad_output.to_owned();
        for layer in (0..self.num_layers()).rev() {
            let activation = if layer == 0 {
                inputs.to_owned()
            } else {
                zs[layer - 1].mapv(relu)
            };

            let grad_w = activation.t().dot(&delta);
            let grad_b = delta.sum_axis(Axis(0)).insert_axis(Axis(0));

            if layer > 0 {
                let upstream = delta.dot(&self.param(&weight_name(layer))?.t());
                let mask = zs[layer - 1].mapv(|z| if z > 0.0 { 1.0 } else { 0.0 });
                delta = upstream * mask;
            }

            if let Some(g) = self.grads.get_mut(&weight_name(layer)) {
                *g += &grad_w;
            }
            if let Some(g) = self.grads.get_mut(&bias_name(layer)) {
                *g += &grad_b;
            }
        }
        Ok(())
    }

    fn parameters(&self) -> &ParamMap {
        &self.params
    }

    fn gradients(&self) -> &ParamMap {
        &self.grads
    }

    fn params_and_grads_mut(&mut self) -> (&mut ParamMap, &mut ParamMap) {
        (&mut self.params, &mut self.grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CrossEntropy, LossFn};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn net() -> Mlp {
        Mlp::new(3, &[5, 4], 3, &mut StdRng::seed_from_u64(17)).unwrap()
    }

    #[test]
    fn test_parameter_names_and_shapes() {
        let m = net();
        assert_eq!(m.layer_sizes(), &[3, 5, 4, 3]);
        assert_eq!(m.parameters().len(), 6);
        assert_eq!(m.parameters()["layers.0.weight"].dim(), (3, 5));
        assert_eq!(m.parameters()["layers.1.bias"].dim(), (1, 4));
        assert_eq!(m.parameters()["layers.2.weight"].dim(), (4, 3));
    }

    #[test]
    fn test_forward_shape_and_determinism() {
        let m = net();
        let x = array![[0.1, 0.2, 0.3], [-1.0, 0.5, 2.0]];
        let a = m.forward(x.view()).unwrap();
        let b = m.forward(x.view()).unwrap();
        assert_eq!(a.dim(), (2, 3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let m = net();
        assert!(m.forward(array![[1.0, 2.0]].view()).is_err());
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut m = net();
        let x = array![[0.3, -0.7, 1.1], [0.9, 0.4, -0.2]];
        let labels = [2, 0];

        let logits = m.forward(x.view()).unwrap();
        let (_, g) = CrossEntropy.loss_and_grad(logits.view(), &labels).unwrap();
        m.zero_grad();
        m.backward(x.view(), g.view()).unwrap();
        let analytic = m.gradients().clone();

        let eps = 1e-3f32;
        for name in ["layers.0.weight", "layers.1.bias", "layers.2.weight"] {
            let shape = m.parameters()[name].dim();
            for idx in [(0, 0), (shape.0 - 1, shape.1 - 1)] {
                let mut plus = m.clone();
                plus.params.get_mut(name).unwrap()[idx] += eps;
                let mut minus = m.clone();
                minus.params.get_mut(name).unwrap()[idx] -= eps;
                let lp = CrossEntropy
                    .loss(plus.forward(x.view()).unwrap().view(), &labels)
                    .unwrap();
                let lm = CrossEntropy
                    .loss(minus.forward(x.view()).unwrap().view(), &labels)
                    .unwrap();
                let numeric = (lp - lm) / (2.0 * eps);
                let got = analytic[name][idx];
                assert!(
                    (numeric - got).abs() < 5e-3,
                    "{}{:?}: analytic {} numeric {}",
                    name,
                    idx,
                    got,
                    numeric
                );
            }
        }
    }

    #[test]
    fn test_backward_accumulates() {
        let mut m = net();
        let x = array![[1.0, 1.0, 1.0]];
        let g = array![[0.1, -0.2, 0.1]];
        m.zero_grad();
        m.backward(x.view(), g.view()).unwrap();
        let once = m.gradients()["layers.2.bias"].clone();
        m.backward(x.view(), g.view()).unwrap();
        let twice = &m.gradients()["layers.2.bias"];
        assert!(twice.iter().zip(once.iter()).all(|(t, o)| (t - 2.0 * o).abs() < 1e-6));
    }

    #[test]
    fn test_from_parameters_roundtrip() {
        let m = net();
        let rebuilt = Mlp::from_parameters(m.parameters().clone()).unwrap();
        assert_eq!(rebuilt.layer_sizes(), m.layer_sizes());
        let x = array![[0.5, 0.5, -0.5]];
        assert_eq!(m.forward(x.view()).unwrap(), rebuilt.forward(x.view()).unwrap());
    }

    #[test]
    fn test_from_parameters_rejects_gaps() {
        let mut params = net().parameters().clone();
        params.remove("layers.1.weight");
        assert!(Mlp::from_parameters(params).is_err());
    }

    #[test]
    fn test_zero_width_rejected() {
        assert!(Mlp::new(3, &[0], 2, &mut StdRng::seed_from_u64(0)).is_err());
    }
}
