//! Local client training with a Fisher-weighted penalty.
//!
//! A client starts from a private copy of the broadcast global model,
//! runs `local_epochs` of drop-last minibatch descent over its partition
//! and returns the resulting parameters plus its average FIM estimate.
//! The broadcast model is never mutated.
//!
//! Loss per minibatch:
//!
//! ```text
//! L = CE(f(x), y) + lambda * sum_p [F_p > 0] * F_p * ||theta_p||^2
//! ```
//!
//! where `F` is the global FIM from previous rounds (empty on round 0).
//! After each optimiser step the FIM is re-estimated on the same batch
//! with the updated parameters and added to a running sum.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ExperimentConfig, OptimizerKind};
use crate::data::{full_batches, ClientPartition, Dataset};
use crate::error::{FedError, Result};
use crate::math::sum_square;
use crate::model::{Differentiable, FimMap, LossFn, ParamMap};
use crate::optim::build_optimizer;

/// Hyperparameters of one client's local pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalTrainingConfig {
    /// Minibatch size (trailing partial batch is dropped)
    pub batch_size: usize,
    /// Passes over the partition
    pub local_epochs: usize,
    /// Optimiser learning rate
    pub learning_rate: f32,
    /// FIM penalty strength
    pub fim_lambda: f32,
    /// Optimiser created fresh for the pass
    pub optimizer: OptimizerKind,
    /// Reshuffle the partition every epoch
    pub shuffle: bool,
}

impl From<&ExperimentConfig> for LocalTrainingConfig {
    fn from(c: &ExperimentConfig) -> Self {
        Self {
            batch_size: c.batch_size,
            local_epochs: c.local_epochs,
            learning_rate: c.learning_rate,
            fim_lambda: c.fim_lambda,
            optimizer: c.optimizer,
            shuffle: c.shuffle,
        }
    }
}

/// Result of one client's local pass.
#[derive(Clone, Debug)]
pub struct ClientUpdate {
    /// Client index
    pub client: usize,
    /// Parameters after the last local step
    pub params: ParamMap,
    /// Per-parameter FIM averaged over every processed minibatch
    pub fim: FimMap,
    /// Minibatches processed across all local epochs
    pub batches: usize,
    /// Mean total (cross-entropy + penalty) loss over those minibatches
    pub mean_loss: f32,
    /// Mean penalty contribution over those minibatches
    pub mean_penalty: f32,
}

/// FIM penalty `lambda * sum F_p * ||theta_p||^2` over parameters with
/// `F_p > 0`. Zero when `global_fim` is empty.
pub fn fim_penalty(params: &ParamMap, global_fim: &FimMap, lambda: f32) -> f32 {
    if global_fim.is_empty() || lambda == 0.0 {
        return 0.0;
    }
    params
        .iter()
        .filter_map(|(name, p)| {
            global_fim
                .get(name)
                .filter(|&&f| f > 0.0)
                .map(|&f| f * sum_square(p))
        })
        .sum::<f32>()
        * lambda
}

/// Add the penalty's gradient `2 * lambda * F_p * theta_p` into the
/// model's gradient buffers and return the penalty value.
fn apply_fim_penalty<M: Differentiable>(model: &mut M, global_fim: &FimMap, lambda: f32) -> f32 {
    let penalty = fim_penalty(model.parameters(), global_fim, lambda);
    if penalty == 0.0 {
        return 0.0;
    }
    let (params, grads) = model.params_and_grads_mut();
    for (name, p) in params.iter() {
        if let (Some(&f), Some(g)) = (global_fim.get(name), grads.get_mut(name)) {
            if f > 0.0 {
                g.scaled_add(2.0 * lambda * f, p);
            }
        }
    }
    penalty
}

/// Runs local passes over client partitions of one shared dataset.
pub struct ClientTrainer<'a, L: LossFn> {
    dataset: &'a Dataset,
    loss: L,
    config: LocalTrainingConfig,
}

impl<'a, L: LossFn> ClientTrainer<'a, L> {
    /// Create a trainer over `dataset`.
    pub fn new(dataset: &'a Dataset, loss: L, config: LocalTrainingConfig) -> Self {
        Self {
            dataset,
            loss,
            config,
        }
    }

    /// Local hyperparameters.
    pub fn config(&self) -> &LocalTrainingConfig {
        &self.config
    }

    /// Train a private copy of `global` on `partition`.
    ///
    /// Fails with [`FedError::EmptyPartition`] when the partition holds
    /// fewer examples than one minibatch, and with
    /// [`FedError::Configuration`] when `local_epochs` is zero.
    pub fn train<M: Differentiable, R: Rng + ?Sized>(
        &self,
        global: &M,
        partition: &ClientPartition,
        global_fim: &FimMap,
        rng: &mut R,
    ) -> Result<ClientUpdate> {
        let batch_size = self.config.batch_size;
        let per_epoch = full_batches(partition.len(), batch_size);
        if per_epoch == 0 {
            return Err(FedError::EmptyPartition {
                client: partition.client,
                examples: partition.len(),
                batch_size,
            });
        }
        if self.config.local_epochs == 0 {
            return Err(FedError::Configuration(format!(
                "client {} would process no minibatches: local_epochs is 0",
                partition.client
            )));
        }

        let mut model = global.clone();
        let mut optimizer = build_optimizer(self.config.optimizer, self.config.learning_rate);
        let mut fim_sum = FimMap::new();
        let mut order = partition.indices.clone();
        let (mut batches, mut loss_sum, mut penalty_sum) = (0usize, 0.0f32, 0.0f32);

        for epoch in 0..self.config.local_epochs {
            if self.config.shuffle {
                order.shuffle(rng);
            }
            let mut epoch_loss = 0.0f32;

            for batch in self.dataset.batches(&order, batch_size, true) {
                model.zero_grad();
                let logits = model.forward(batch.features.view())?;
                let (base, grad_logits) = self.loss.loss_and_grad(logits.view(), &batch.labels)?;
                model.backward(batch.features.view(), grad_logits.view())?;
                let penalty = apply_fim_penalty(&mut model, global_fim, self.config.fim_lambda);

                {
                    let (params, grads) = model.params_and_grads_mut();
                    optimizer.step(params, grads)?;
                }

                // Post-step curvature on the same batch
                for (name, value) in model.compute_fim(&batch, &self.loss)? {
                    *fim_sum.entry(name).or_insert(0.0) += value;
                }

                epoch_loss += base + penalty;
                penalty_sum += penalty;
                batches += 1;
            }

            loss_sum += epoch_loss;
            debug!(
                client = partition.client,
                epoch,
                loss = epoch_loss / per_epoch as f32,
                "Local epoch complete"
            );
        }

        let n = batches as f32;
        for value in fim_sum.values_mut() {
            *value /= n;
        }

        Ok(ClientUpdate {
            client: partition.client,
            params: model.parameters().clone(),
            fim: fim_sum,
            batches,
            mean_loss: loss_sum / n,
            mean_penalty: penalty_sum / n,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CrossEntropy, Mlp};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn dataset() -> Dataset {
        Dataset::new(
            array![
                [1.0, 0.0],
                [0.9, 0.1],
                [0.0, 1.0],
                [0.1, 0.9],
                [1.1, -0.1],
                [-0.1, 1.1]
            ],
            vec![0, 0, 1, 1, 0, 1],
            2,
        )
        .unwrap()
    }

    fn config(lambda: f32) -> LocalTrainingConfig {
        LocalTrainingConfig {
            batch_size: 2,
            local_epochs: 2,
            learning_rate: 0.1,
            fim_lambda: lambda,
            optimizer: OptimizerKind::default(),
            shuffle: false,
        }
    }

    fn model() -> Mlp {
        Mlp::new(2, &[3], 2, &mut StdRng::seed_from_u64(2)).unwrap()
    }

    fn partition(indices: Vec<usize>) -> ClientPartition {
        ClientPartition { client: 0, indices }
    }

    #[test]
    fn test_penalty_zero_without_global_fim() {
        let m = model();
        assert_eq!(fim_penalty(m.parameters(), &FimMap::new(), 10.0), 0.0);
    }

    #[test]
    fn test_penalty_value() {
        let mut params = ParamMap::new();
        params.insert("a".into(), array![[1.0, 2.0]]);
        params.insert("b".into(), array![[3.0]]);
        params.insert("c".into(), array![[4.0]]);
        let mut fim = FimMap::new();
        fim.insert("a".into(), 0.5);
        fim.insert("b".into(), 0.0); // not engaged
        // 2.0 * (0.5 * (1 + 4))
        assert!((fim_penalty(&params, &fim, 2.0) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_train_does_not_mutate_global() {
        let ds = dataset();
        let global = model();
        let before = global.parameters().clone();
        let trainer = ClientTrainer::new(&ds, CrossEntropy, config(0.0));
        let mut rng = StdRng::seed_from_u64(0);
        let update = trainer
            .train(&global, &partition(vec![0, 1, 2, 3]), &FimMap::new(), &mut rng)
            .unwrap();
        assert_eq!(&before, global.parameters());
        assert_ne!(before, update.params);
    }

    #[test]
    fn test_batch_count_and_fim() {
        let ds = dataset();
        let trainer = ClientTrainer::new(&ds, CrossEntropy, config(0.0));
        // 5 examples, batch 2 -> 2 full batches per epoch, 2 epochs
        let mut rng = StdRng::seed_from_u64(0);
        let update = trainer
            .train(&model(), &partition(vec![0, 1, 2, 3, 4]), &FimMap::new(), &mut rng)
            .unwrap();
        assert_eq!(update.batches, 4);
        assert_eq!(update.fim.len(), 4);
        assert!(update.fim.values().all(|&v| v >= 0.0 && v.is_finite()));
        assert_eq!(update.mean_penalty, 0.0);
    }

    #[test]
    fn test_empty_partition_error() {
        let ds = dataset();
        let trainer = ClientTrainer::new(&ds, CrossEntropy, config(0.0));
        let mut rng = StdRng::seed_from_u64(0);
        let err = trainer
            .train(&model(), &partition(vec![0]), &FimMap::new(), &mut rng)
            .unwrap_err();
        assert!(matches!(
            err,
            FedError::EmptyPartition { client: 0, examples: 1, batch_size: 2 }
        ));
    }

    #[test]
    fn test_penalty_shrinks_weights() {
        let ds = dataset();
        let global = model();
        let mut fim = FimMap::new();
        for name in global.parameters().keys() {
            fim.insert(name.clone(), 1.0);
        }
        let idx = vec![0, 1, 2, 3];

        let free = ClientTrainer::new(&ds, CrossEntropy, config(0.0))
            .train(&global, &partition(idx.clone()), &fim, &mut StdRng::seed_from_u64(0))
            .unwrap();
        let held = ClientTrainer::new(&ds, CrossEntropy, config(1.0))
            .train(&global, &partition(idx), &fim, &mut StdRng::seed_from_u64(0))
            .unwrap();

        let norm = |p: &ParamMap| p.values().map(sum_square).sum::<f32>();
        assert!(norm(&held.params) < norm(&free.params));
        assert!(held.mean_penalty > 0.0);
    }

    #[test]
    fn test_deterministic_given_seed() {
        let ds = dataset();
        let mut cfg = config(0.0);
        cfg.shuffle = true;
        let trainer = ClientTrainer::new(&ds, CrossEntropy, cfg);
        let p = partition(vec![0, 1, 2, 3, 4, 5]);
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            trainer.train(&model(), &p, &FimMap::new(), &mut rng).unwrap()
        };
        let (a, b) = (run(4), run(4));
        assert_eq!(a.params, b.params);
        assert_eq!(a.fim, b.fim);
    }

    #[test]
    fn test_zero_local_epochs_rejected() {
        let ds = dataset();
        let trainer = ClientTrainer::new(
            &ds,
            CrossEntropy,
            LocalTrainingConfig {
                local_epochs: 0,
                ..config(0.0)
            },
        );
        let mut rng = StdRng::seed_from_u64(0);
        let err = trainer
            .train(&model(), &partition(vec![0, 1, 2, 3]), &FimMap::new(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, FedError::Configuration(_)));
    }

    #[test]
    fn test_fim_is_post_step_mean_over_all_batches() {
        let ds = dataset();
        let global = model();
        let trainer = ClientTrainer::new(&ds, CrossEntropy, config(0.0));
        let mut rng = StdRng::seed_from_u64(0);
        let update = trainer
            .train(&global, &partition(vec![0, 1, 2, 3]), &FimMap::new(), &mut rng)
            .unwrap();
        assert_eq!(update.batches, 4);

        // 2 epochs x 2 batches, no shuffling, plain SGD at lr 0.1
        let mut replay = global.clone();
        let mut expected = FimMap::new();
        for _ in 0..2 {
            for chunk in [[0usize, 1], [2, 3]] {
                let batch = ds.gather(&chunk);
                replay.zero_grad();
                let logits = replay.forward(batch.features.view()).unwrap();
                let (_, g) = CrossEntropy.loss_and_grad(logits.view(), &batch.labels).unwrap();
                replay.backward(batch.features.view(), g.view()).unwrap();
                let (params, grads) = replay.params_and_grads_mut();
                for (name, p) in params.iter_mut() {
                    p.scaled_add(-0.1, &grads[name]);
                }
                for (name, v) in replay.compute_fim(&batch, &CrossEntropy).unwrap() {
                    *expected.entry(name).or_insert(0.0) += v;
                }
            }
        }

        assert_eq!(update.fim.len(), expected.len());
        for (name, sum) in &expected {
            let want = sum / 4.0;
            let got = update.fim[name];
            assert!(
                (got - want).abs() <= 1e-5 * want.abs().max(1e-3),
                "{}: got {} expected {}",
                name,
                got,
                want
            );
        }
    }
}
