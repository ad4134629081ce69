//! First-order optimisers over named parameter maps.
//!
//! Optimiser state (momentum, Adam moments) is keyed by parameter name and
//! created lazily on the first step. Clients get a fresh optimiser for
//! every local pass, so no state crosses rounds or clients.

use ndarray::Array2;

use crate::config::OptimizerKind;
use crate::error::Result;
use crate::model::{check_compatible, ParamMap};

/// One update rule applied to all parameters.
pub trait Optimizer: Send {
    /// Apply one step of `grads` to `params` in place.
    fn step(&mut self, params: &mut ParamMap, grads: &ParamMap) -> Result<()>;
}

/// Stochastic gradient descent with optional heavy-ball momentum.
#[derive(Clone, Debug)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocity: ParamMap,
}

impl Sgd {
    /// Create an SGD optimiser; `momentum = 0.0` gives plain SGD.
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocity: ParamMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut ParamMap, grads: &ParamMap) -> Result<()> {
        check_compatible(params, grads)?;
        for (name, p) in params.iter_mut() {
            let g = &grads[name];
            if self.momentum > 0.0 {
                let v = self
                    .velocity
                    .entry(name.clone())
                    .or_insert_with(|| Array2::zeros(g.dim()));
                *v *= self.momentum;
                *v += g;
                p.scaled_add(-self.lr, v);
            } else {
                p.scaled_add(-self.lr, g);
            }
        }
        Ok(())
    }
}

/// Adam (Kingma & Ba, 2015) with bias correction.
#[derive(Clone, Debug)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    m: ParamMap,
    v: ParamMap,
}

impl Adam {
    /// Create Adam with betas (0.9, 0.999) and eps 1e-8.
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: ParamMap::new(),
            v: ParamMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut ParamMap, grads: &ParamMap) -> Result<()> {
        check_compatible(params, grads)?;
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t);
        let bc2 = 1.0 - self.beta2.powi(self.t);
        let (b1, b2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);

        for (name, p) in params.iter_mut() {
            let g = &grads[name];
            let m = self
                .m
                .entry(name.clone())
                .or_insert_with(|| Array2::zeros(g.dim()));
            let v = self
                .v
                .entry(name.clone())
                .or_insert_with(|| Array2::zeros(g.dim()));

            ndarray::Zip::from(p)
                .and(m)
                .and(v)
                .and(g)
                .for_each(|p, m, v, &g| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    let m_hat = *m / bc1;
                    let v_hat = *v / bc2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
        Ok(())
    }
}

/// Build a fresh optimiser of the configured kind.
pub fn build_optimizer(kind: OptimizerKind, lr: f32) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Sgd { momentum } => Box::new(Sgd::new(lr, momentum)),
        OptimizerKind::Adam => Box::new(Adam::new(lr)),
    }
}
