//! Labelled datasets and minibatching.
//!
//! A [`Dataset`] is an immutable feature matrix (one row per example) plus
//! integer labels in `[0, num_classes)`. Client partitions are index lists
//! into a shared dataset, see [`partition`].

pub mod partition;
pub mod synthetic;

pub use partition::{partition_by_class, ClientPartition};
pub use synthetic::{gaussian_clusters, SyntheticSplit};

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{FedError, Result};

/// Fixed-size labelled dataset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    features: Array2<f32>,
    labels: Vec<usize>,
    num_classes: usize,
}

/// One minibatch gathered from a dataset.
#[derive(Clone, Debug)]
pub struct Batch {
    /// Features, one row per example
    pub features: Array2<f32>,
    /// Labels aligned with `features` rows
    pub labels: Vec<usize>,
}

impl Batch {
    /// Number of examples in the batch.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the batch has no examples.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Per-feature mean and standard deviation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureStats {
    /// Column means
    pub mean: Array1<f32>,
    /// Column standard deviations (floored to avoid division by zero)
    pub std: Array1<f32>,
}

impl Dataset {
    /// Build a dataset, checking row/label counts and label range.
    pub fn new(features: Array2<f32>, labels: Vec<usize>, num_classes: usize) -> Result<Self> {
        if features.nrows() != labels.len() {
            return Err(FedError::ShapeMismatch(format!(
                "{} feature rows vs {} labels",
                features.nrows(),
                labels.len()
            )));
        }
        if let Some(&label) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(FedError::LabelOutOfRange { label, num_classes });
        }
        Ok(Self {
            features,
            labels,
            num_classes,
        })
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the dataset has no examples.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Feature dimension.
    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    /// Number of label classes.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// All labels, in example order.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// The full feature matrix.
    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    /// Gather the examples at `indices` into a batch.
    ///
    /// Panics if an index is out of bounds; callers index with partitions
    /// built from this dataset.
    pub fn gather(&self, indices: &[usize]) -> Batch {
        Batch {
            features: self.features.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// Column statistics over the whole dataset.
    pub fn feature_stats(&self) -> Result<FeatureStats> {
        let mean = self
            .features
            .mean_axis(Axis(0))
            .ok_or_else(|| FedError::EmptyDataset("cannot compute feature statistics".into()))?;
        let std = self.features.std_axis(Axis(0), 0.0).mapv(|s| s.max(1e-6));
        Ok(FeatureStats { mean, std })
    }

    /// Standardise features in place using externally supplied statistics
    /// (normally those of the training split).
    pub fn standardize(&mut self, stats: &FeatureStats) -> Result<()> {
        if stats.mean.len() != self.num_features() || stats.std.len() != self.num_features() {
            return Err(FedError::ShapeMismatch(format!(
                "stats for {} features, dataset has {}",
                stats.mean.len(),
                self.num_features()
            )));
        }
        self.features -= &stats.mean;
        self.features /= &stats.std;
        Ok(())
    }

    /// Consecutive batches over `indices` in order.
    ///
    /// With `drop_last` the trailing partial batch is skipped.
    pub fn batches<'a>(
        &'a self,
        indices: &'a [usize],
        batch_size: usize,
        drop_last: bool,
    ) -> impl Iterator<Item = Batch> + 'a {
        indices
            .chunks(batch_size.max(1))
            .filter(move |chunk| !drop_last || chunk.len() == batch_size)
            .map(move |chunk| self.gather(chunk))
    }
}

/// Number of full batches `examples` yields under drop-last.
pub fn full_batches(examples: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        0
    } else {
        examples / batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn tiny() -> Dataset {
        Dataset::new(
            array![[0.0, 1.0], [2.0, 3.0], [4.0, 5.0], [6.0, 7.0], [8.0, 9.0]],
            vec![0, 1, 0, 1, 0],
            2,
        )
        .unwrap()
    }

    #[test]
    fn test_label_out_of_range() {
        let err = Dataset::new(array![[0.0], [1.0]], vec![0, 3], 2).unwrap_err();
        assert!(matches!(err, FedError::LabelOutOfRange { label: 3, num_classes: 2 }));
    }

    #[test]
    fn test_row_label_mismatch() {
        assert!(Dataset::new(array![[0.0], [1.0]], vec![0], 2).is_err());
    }

    #[test]
    fn test_gather() {
        let ds = tiny();
        let batch = ds.gather(&[3, 0]);
        assert_eq!(batch.labels, vec![1, 0]);
        assert_eq!(batch.features, array![[6.0, 7.0], [0.0, 1.0]]);
    }

    #[test]
    fn test_batches_drop_last() {
        let ds = tiny();
        let idx: Vec<usize> = (0..5).collect();
        assert_eq!(ds.batches(&idx, 2, true).count(), 2);
        let kept: Vec<usize> = ds.batches(&idx, 2, false).map(|b| b.len()).collect();
        assert_eq!(kept, vec![2, 2, 1]);
        assert_eq!(full_batches(5, 2), 2);
        assert_eq!(full_batches(1, 2), 0);
    }

    #[test]
    fn test_standardize() {
        let mut ds = tiny();
        let stats = ds.feature_stats().unwrap();
        ds.standardize(&stats).unwrap();
        let mean = ds.features().mean_axis(Axis(0)).unwrap();
        assert!(mean.iter().all(|m| m.abs() < 1e-5));
        let std = ds.features().std_axis(Axis(0), 0.0);
        assert!(std.iter().all(|s| (s - 1.0).abs() < 1e-4));
    }
}
