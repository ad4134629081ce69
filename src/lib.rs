//! # fedfim: Federated Learning with Fisher-Information Regularisation
//!
//! Simulates synchronous federated training of a shared classifier across
//! class-balanced client partitions. Each client's local loss carries an
//! elastic-weight-consolidation style penalty weighted by the global
//! diagonal Fisher Information Matrix (FIM), and the server keeps an
//! exponentially decayed memory of client FIM estimates.
//!
//! ## Round
//!
//! 1. Broadcast the global parameters and global FIM
//! 2. [`ClientTrainer::train`] on every partition (sequential or parallel)
//! 3. [`aggregate_models`] (FedAvg) and [`aggregate_fim`]
//! 4. [`GlobalFim::update`]: `G' = gamma * G + (1 - gamma) * F`
//! 5. [`evaluate`] on the held-out set and emit [`RoundMetrics`]
//!
//! ## High-Level API
//!
//! Use [`Orchestrator`] to run a full experiment from an
//! [`ExperimentConfig`].

#![deny(missing_docs)]

pub mod aggregators;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod math;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod orchestrator;

// Re-exports
pub use aggregators::{aggregate_fim, aggregate_models, Aggregator, GlobalFim};
pub use checkpoint::{Checkpoint, CheckpointSink, FileCheckpointSink};
pub use client::{ClientTrainer, ClientUpdate, LocalTrainingConfig};
pub use config::ExperimentConfig;
pub use data::{partition_by_class, ClientPartition, Dataset};
pub use error::FedError;
pub use eval::{evaluate, Evaluation};
pub use metrics::{JsonLinesSink, MetricsSink, RoundLog, RoundMetrics};
pub use model::{CrossEntropy, Differentiable, FimMap, Mlp, ParamMap};
pub use orchestrator::{Orchestrator, RoundPhase};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
