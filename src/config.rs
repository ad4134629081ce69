//! Experiment configuration.
//!
//! All hyperparameters are plain scalars or lists loaded from TOML. Every
//! field has a serde default, so a config file only needs to name the
//! values it overrides. [`ExperimentConfig::validate`] runs before the
//! first round; any violation is a [`FedError::Configuration`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FedError, Result};

/// Optimiser used for local client training.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Plain stochastic gradient descent with optional momentum
    Sgd {
        /// Momentum coefficient (0.0 disables momentum)
        #[serde(default)]
        momentum: f32,
    },
    /// Adam with the usual (0.9, 0.999) moment decay
    Adam,
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::Sgd { momentum: 0.0 }
    }
}

/// Synthetic dataset settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Number of label classes
    pub num_classes: usize,
    /// Feature dimension of every example
    pub num_features: usize,
    /// Training examples generated per class
    pub samples_per_class: usize,
    /// Held-out test examples generated per class
    pub test_samples_per_class: usize,
    /// Standard deviation of each class cluster around its centre
    pub cluster_spread: f32,
    /// Standardise features with training-set mean/std
    pub standardize: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            num_features: 32,
            samples_per_class: 200,
            test_samples_per_class: 50,
            cluster_spread: 1.0,
            standardize: true,
        }
    }
}

/// Where round metrics and the final checkpoint are written.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// JSON-lines metrics file; metrics are kept in memory only when unset
    pub metrics_path: Option<PathBuf>,
    /// Final parameter checkpoint; skipped when unset
    pub checkpoint_path: Option<PathBuf>,
}

/// Full configuration of one federated experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Minibatch size for local training
    pub batch_size: usize,
    /// Minibatch size for evaluation (partial last batch is kept)
    pub eval_batch_size: usize,
    /// Number of global rounds
    pub rounds: usize,
    /// Local optimiser learning rate
    pub learning_rate: f32,
    /// FIM penalty strength (lambda)
    pub fim_lambda: f32,
    /// Number of simulated clients
    pub num_clients: usize,
    /// Hidden layer widths of the MLP
    pub hidden_sizes: Vec<usize>,
    /// Local epochs per client per round
    pub local_epochs: usize,
    /// Global FIM memory decay (gamma)
    pub fim_decay: f32,
    /// Seed for data generation, partitioning, init and shuffling
    pub seed: u64,
    /// Local optimiser
    pub optimizer: OptimizerKind,
    /// Train clients on the rayon pool instead of one after another
    pub parallel_clients: bool,
    /// Shuffle each client's partition at the start of every local epoch
    pub shuffle: bool,
    /// Synthetic data source
    pub data: DataConfig,
    /// Metrics and checkpoint destinations
    pub output: OutputConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            eval_batch_size: 256,
            rounds: 10,
            learning_rate: 0.01,
            fim_lambda: 0.1,
            num_clients: 5,
            hidden_sizes: vec![64, 32],
            local_epochs: 2,
            fim_decay: 0.5,
            seed: 42,
            optimizer: OptimizerKind::default(),
            parallel_clients: false,
            shuffle: true,
            data: DataConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Parse a config from TOML text and validate it.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| FedError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        info!(
            path = %path.display(),
            clients = config.num_clients,
            rounds = config.rounds,
            "Loaded experiment config"
        );
        Ok(config)
    }

    /// Check every constraint the training core relies on.
    ///
    /// Collects all violations into one error message.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.num_clients == 0 {
            errors.push("num_clients must be > 0".to_string());
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be > 0".to_string());
        }
        if self.eval_batch_size == 0 {
            errors.push("eval_batch_size must be > 0".to_string());
        }
        if self.rounds == 0 {
            errors.push("rounds must be > 0".to_string());
        }
        if self.local_epochs == 0 {
            errors.push("local_epochs must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.fim_decay) {
            errors.push(format!("fim_decay {} outside [0, 1]", self.fim_decay));
        }
        if !self.fim_lambda.is_finite() || self.fim_lambda < 0.0 {
            errors.push(format!("fim_lambda {} must be finite and >= 0", self.fim_lambda));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            errors.push(format!("learning_rate {} must be finite and > 0", self.learning_rate));
        }
        if let OptimizerKind::Sgd { momentum } = self.optimizer {
            if !(0.0..1.0).contains(&momentum) {
                errors.push(format!("sgd momentum {} outside [0, 1)", momentum));
            }
        }
        if self.hidden_sizes.iter().any(|&h| h == 0) {
            errors.push("hidden_sizes entries must be > 0".to_string());
        }
        if self.data.num_classes < 2 {
            errors.push("data.num_classes must be >= 2".to_string());
        }
        if self.data.num_features == 0 {
            errors.push("data.num_features must be > 0".to_string());
        }
        if !self.data.cluster_spread.is_finite() || self.data.cluster_spread < 0.0 {
            errors.push("data.cluster_spread must be finite and >= 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FedError::Configuration(errors.join("; ")))
        }
    }
}
