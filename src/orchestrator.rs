//! Synchronous round loop.
//!
//! The [`Orchestrator`] exclusively owns the global model and the global
//! FIM. Each round it broadcasts the current parameters, trains every
//! client on a private copy (sequentially or on the rayon pool), waits for
//! all of them, then commits the aggregate exactly once, evaluates and
//! emits metrics.
//!
//! ```text
//! Idle -> RoundInProgress -> Aggregating -> Evaluating -> Idle | Done
//! ```

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::aggregators::{Aggregator, GlobalFim};
use crate::checkpoint::{Checkpoint, CheckpointSink};
use crate::client::{ClientTrainer, ClientUpdate, LocalTrainingConfig};
use crate::config::ExperimentConfig;
use crate::data::{full_batches, gaussian_clusters, partition_by_class, ClientPartition, Dataset};
use crate::error::{FedError, Result};
use crate::eval::{evaluate, Evaluation};
use crate::math::param_distance;
use crate::metrics::{MetricsSink, RoundMetrics};
use crate::model::{CrossEntropy, Differentiable, LossFn, Mlp};

/// Where the orchestrator is in its round cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundPhase {
    /// Between rounds, ready to broadcast
    Idle,
    /// Clients are training
    RoundInProgress,
    /// Client results are being combined
    Aggregating,
    /// The new global model is being evaluated
    Evaluating,
    /// All configured rounds completed
    Done,
}

/// Drives federated rounds over a fixed set of client partitions.
pub struct Orchestrator<M: Differentiable, L: LossFn> {
    config: ExperimentConfig,
    model: M,
    global_fim: GlobalFim,
    train: Dataset,
    test: Dataset,
    partitions: Vec<ClientPartition>,
    loss: L,
    aggregator: Aggregator,
    phase: RoundPhase,
    round: usize,
}

impl Orchestrator<Mlp, CrossEntropy> {
    /// Build a complete experiment from config: synthetic data, an MLP
    /// sized to it and cross-entropy loss.
    pub fn from_config(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        let split = gaussian_clusters(&config.data, config.seed)?;
        let mut init_rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        let model = Mlp::new(
            split.train.num_features(),
            &config.hidden_sizes,
            split.train.num_classes(),
            &mut init_rng,
        )?;
        Self::new(config, model, split.train, split.test, CrossEntropy)
    }
}

impl<M: Differentiable, L: LossFn> Orchestrator<M, L> {
    /// Validate the configuration, partition `train` and check that every
    /// client can form at least one minibatch.
    pub fn new(
        config: ExperimentConfig,
        model: M,
        train: Dataset,
        test: Dataset,
        loss: L,
    ) -> Result<Self> {
        config.validate()?;
        if train.is_empty() {
            return Err(FedError::EmptyDataset("training set has no examples".into()));
        }
        if test.is_empty() {
            return Err(FedError::EmptyDataset("test set has no examples".into()));
        }
        let probe = model.forward(train.gather(&[0]).features.view())?;
        if probe.ncols() != train.num_classes() {
            return Err(FedError::Configuration(format!(
                "model emits {} logits for {} classes",
                probe.ncols(),
                train.num_classes()
            )));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let partitions =
            partition_by_class(train.labels(), train.num_classes(), config.num_clients, &mut rng)?;
        for p in &partitions {
            if full_batches(p.len(), config.batch_size) == 0 {
                return Err(FedError::EmptyPartition {
                    client: p.client,
                    examples: p.len(),
                    batch_size: config.batch_size,
                });
            }
        }

        let aggregator = Aggregator::new(config.fim_decay)?;
        info!(
            clients = partitions.len(),
            train = train.len(),
            test = test.len(),
            rounds = config.rounds,
            parallel = config.parallel_clients,
            "Orchestrator ready"
        );

        Ok(Self {
            config,
            model,
            global_fim: GlobalFim::new(),
            train,
            test,
            partitions,
            loss,
            aggregator,
            phase: RoundPhase::Idle,
            round: 0,
        })
    }

    /// Current phase.
    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Rounds completed so far.
    pub fn rounds_completed(&self) -> usize {
        self.round
    }

    /// The canonical global model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The persistent global FIM.
    pub fn global_fim(&self) -> &GlobalFim {
        &self.global_fim
    }

    /// Client partitions of the training set.
    pub fn partitions(&self) -> &[ClientPartition] {
        &self.partitions
    }

    /// Training dataset shared by all clients.
    pub fn train_set(&self) -> &Dataset {
        &self.train
    }

    /// Held-out evaluation dataset.
    pub fn test_set(&self) -> &Dataset {
        &self.test
    }

    /// Experiment configuration.
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Seed of the shuffling RNG for `client` in `round`.
    ///
    /// Depends only on the experiment seed, the round and the client, so
    /// sequential and parallel execution see identical batch orders.
    pub fn client_seed(&self, round: usize, client: usize) -> u64 {
        self.config.seed
            ^ (round as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (client as u64 + 1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
    }

    fn set_phase(&mut self, phase: RoundPhase) {
        debug!(round = self.round, from = ?self.phase, to = ?phase, "Phase transition");
        self.phase = phase;
    }

    /// Train every client against the current global state. Returns only
    /// once all clients are done.
    fn train_clients(&self) -> Result<Vec<ClientUpdate>> {
        let trainer = ClientTrainer::new(
            &self.train,
            &self.loss,
            LocalTrainingConfig::from(&self.config),
        );
        let fim = self.global_fim.values();
        let run = |p: &ClientPartition| -> Result<ClientUpdate> {
            let mut rng = StdRng::seed_from_u64(self.client_seed(self.round, p.client));
            let update = trainer.train(&self.model, p, fim, &mut rng)?;
            debug!(
                round = self.round,
                client = p.client,
                batches = update.batches,
                loss = update.mean_loss,
                penalty = update.mean_penalty,
                "Client finished"
            );
            Ok(update)
        };

        if self.config.parallel_clients {
            self.partitions.par_iter().map(run).collect()
        } else {
            self.partitions.iter().map(run).collect()
        }
    }

    /// Run one full round and return its metrics.
    pub fn run_round(&mut self) -> Result<RoundMetrics> {
        if self.phase == RoundPhase::Done {
            return Err(FedError::Configuration(format!(
                "all {} rounds already completed",
                self.config.rounds
            )));
        }

        self.set_phase(RoundPhase::RoundInProgress);
        let updates = self.train_clients()?;
        let n_clients = updates.len();
        let mean_train_loss =
            updates.iter().map(|u| u.mean_loss).sum::<f32>() / n_clients.max(1) as f32;

        self.set_phase(RoundPhase::Aggregating);
        // Model and global FIM are committed together or not at all
        let mut next_fim = self.global_fim.clone();
        let aggregate = self.aggregator.aggregate(updates, &mut next_fim)?;
        let update_norm = param_distance(self.model.parameters(), &aggregate.params);
        self.model.load_parameters(&aggregate.params)?;
        self.global_fim = next_fim;

        self.set_phase(RoundPhase::Evaluating);
        let eval = self.evaluate()?;

        let metrics = RoundMetrics {
            round: self.round,
            test_loss: eval.loss,
            test_accuracy: eval.accuracy,
            mean_train_loss,
            update_norm,
            n_clients,
            global_fim: self.global_fim.values().clone(),
        };
        info!(
            round = self.round,
            test_loss = eval.loss,
            test_accuracy = eval.accuracy,
            train_loss = mean_train_loss,
            update_norm,
            "Round complete"
        );

        self.round += 1;
        let next = if self.round >= self.config.rounds {
            RoundPhase::Done
        } else {
            RoundPhase::Idle
        };
        self.set_phase(next);
        Ok(metrics)
    }

    /// Run all remaining rounds, recording each in `metrics`, then persist
    /// the final parameters to `checkpoints`. Returns the final round's
    /// metrics.
    pub fn run(
        &mut self,
        metrics: &mut dyn MetricsSink,
        checkpoints: &mut dyn CheckpointSink,
    ) -> Result<RoundMetrics> {
        let mut last = None;
        while self.phase != RoundPhase::Done {
            let round = self.run_round()?;
            metrics.record(&round)?;
            last = Some(round);
        }
        metrics.flush()?;
        let last = last.ok_or_else(|| FedError::Configuration("no rounds left to run".into()))?;
        self.persist(checkpoints)?;
        Ok(last)
    }

    /// Evaluate the current global model on the test set.
    pub fn evaluate(&self) -> Result<Evaluation> {
        evaluate(&self.model, &self.test, &self.loss, self.config.eval_batch_size)
    }

    /// Snapshot of the global parameters.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            rounds_completed: self.round,
            params: self.model.parameters().clone(),
        }
    }

    /// Persist the global parameters to `sink`.
    pub fn persist(&self, sink: &mut dyn CheckpointSink) -> Result<Checkpoint> {
        let checkpoint = self.checkpoint();
        sink.persist(&checkpoint)?;
        Ok(checkpoint)
    }
}
