//! Synthetic Gaussian-cluster data source.
//!
//! Every class gets a random centre; examples are the centre plus
//! isotropic Gaussian noise. Train and test splits share the centres.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use super::Dataset;
use crate::config::DataConfig;
use crate::error::{FedError, Result};

/// Standard deviation of the class centres around the origin.
const CENTRE_SCALE: f32 = 3.0;

/// Train and held-out test split drawn from the same clusters.
#[derive(Clone, Debug)]
pub struct SyntheticSplit {
    /// Training examples, to be partitioned across clients
    pub train: Dataset,
    /// Held-out evaluation examples
    pub test: Dataset,
}

/// Generate a seeded train/test split of Gaussian clusters.
///
/// When `config.standardize` is set, both splits are standardised with
/// the training split's statistics.
pub fn gaussian_clusters(config: &DataConfig, seed: u64) -> Result<SyntheticSplit> {
    let mut rng = StdRng::seed_from_u64(seed);
    let centre_dist = Normal::new(0.0f32, CENTRE_SCALE)
        .map_err(|e| FedError::Configuration(e.to_string()))?;
    let noise = Normal::new(0.0f32, config.cluster_spread)
        .map_err(|e| FedError::Configuration(e.to_string()))?;

    let centres = Array2::from_shape_fn((config.num_classes, config.num_features), |_| {
        centre_dist.sample(&mut rng)
    });

    let mut draw = |per_class: usize| -> Result<Dataset> {
        let n = per_class * config.num_classes;
        // Interleave classes so that any prefix is roughly balanced
        let labels: Vec<usize> = (0..n).map(|i| i % config.num_classes).collect();
        let features = Array2::from_shape_fn((n, config.num_features), |(row, col)| {
            centres[[labels[row], col]] + noise.sample(&mut rng)
        });
        Dataset::new(features, labels, config.num_classes)
    };

    let mut train = draw(config.samples_per_class)?;
    let mut test = draw(config.test_samples_per_class)?;

    if config.standardize && !train.is_empty() {
        let stats = train.feature_stats()?;
        train.standardize(&stats)?;
        if !test.is_empty() {
            test.standardize(&stats)?;
        }
    }

    Ok(SyntheticSplit { train, test })
}
