//! Class-balanced client partitioning.
//!
//! Each class's indices are shuffled independently and cut into
//! `num_clients` contiguous chunks of `floor(count / num_clients)`
//! examples; chunk `i` goes to client `i`. The per-class remainder is
//! dropped, so partitions are disjoint and equal-sized per class but may
//! not cover the whole dataset.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FedError, Result};

/// Dataset indices owned by one client for the whole experiment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPartition {
    /// Client index in `0..num_clients`
    pub client: usize,
    /// Indices into the training dataset
    pub indices: Vec<usize>,
}

impl ClientPartition {
    /// Number of examples owned by this client.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the client owns no examples.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Split a labelled dataset into `num_clients` disjoint, class-balanced
/// partitions.
///
/// # Arguments
///
/// * `labels` - Label of every example, each in `[0, num_classes)`
/// * `num_classes` - Number of classes
/// * `num_clients` - Number of partitions to produce (must be > 0)
/// * `rng` - Source of the per-class shuffles
///
/// A class with fewer examples than clients contributes nothing to any
/// partition; this is logged, not an error.
pub fn partition_by_class<R: Rng + ?Sized>(
    labels: &[usize],
    num_classes: usize,
    num_clients: usize,
    rng: &mut R,
) -> Result<Vec<ClientPartition>> {
    if num_clients == 0 {
        return Err(FedError::Configuration("num_clients must be > 0".into()));
    }

    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); num_classes];
    for (idx, &label) in labels.iter().enumerate() {
        let bucket = by_class
            .get_mut(label)
            .ok_or(FedError::LabelOutOfRange { label, num_classes })?;
        bucket.push(idx);
    }

    let mut partitions: Vec<ClientPartition> = (0..num_clients)
        .map(|client| ClientPartition {
            client,
            indices: Vec::new(),
        })
        .collect();

    for (class, mut indices) in by_class.into_iter().enumerate() {
        indices.shuffle(rng);
        let chunk = indices.len() / num_clients;
        let dropped = indices.len() - chunk * num_clients;

        if chunk == 0 && !indices.is_empty() {
            warn!(
                class,
                examples = indices.len(),
                num_clients,
                "Class has fewer examples than clients; it is absent from every partition"
            );
        } else if dropped > 0 {
            debug!(class, dropped, "Dropping per-class remainder");
        }

        for (partition, slice) in partitions.iter_mut().zip(indices.chunks_exact(chunk.max(1))) {
            if chunk > 0 {
                partition.indices.extend_from_slice(slice);
            }
        }
    }

    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn labels(num_classes: usize, per_class: usize) -> Vec<usize> {
        (0..num_classes * per_class).map(|i| i % num_classes).collect()
    }

    #[test]
    fn test_even_split() {
        let labels = labels(3, 8);
        let mut rng = StdRng::seed_from_u64(1);
        let parts = partition_by_class(&labels, 3, 4, &mut rng).unwrap();

        assert_eq!(parts.len(), 4);
        for p in &parts {
            assert_eq!(p.len(), 6);
            let classes: HashSet<usize> = p.indices.iter().map(|&i| labels[i]).collect();
            assert_eq!(classes.len(), 3, "client {} is missing a class", p.client);
        }
    }

    #[test]
    fn test_disjoint_and_bounded() {
        let labels = labels(4, 10);
        let mut rng = StdRng::seed_from_u64(7);
        let parts = partition_by_class(&labels, 4, 3, &mut rng).unwrap();

        let mut seen = HashSet::new();
        for p in &parts {
            for &i in &p.indices {
                assert!(seen.insert(i), "index {} assigned twice", i);
            }
        }
        // 10 per class / 3 clients -> 3 each, 1 dropped per class
        assert_eq!(seen.len(), 36);
        assert!(seen.len() <= labels.len());
    }

    #[test]
    fn test_zero_clients() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = partition_by_class(&[0, 1], 2, 0, &mut rng).unwrap_err();
        assert!(matches!(err, FedError::Configuration(_)));
    }

    #[test]
    fn test_more_clients_than_class_examples() {
        // class 1 has a single example
        let labels = vec![0, 0, 0, 0, 1];
        let mut rng = StdRng::seed_from_u64(3);
        let parts = partition_by_class(&labels, 2, 2, &mut rng).unwrap();

        assert_eq!(parts.len(), 2);
        for p in &parts {
            assert_eq!(p.len(), 2);
            assert!(p.indices.iter().all(|&i| labels[i] == 0));
        }
    }

    #[test]
    fn test_clients_exceed_every_class() {
        let labels = vec![0, 1];
        let mut rng = StdRng::seed_from_u64(3);
        let parts = partition_by_class(&labels, 2, 5, &mut rng).unwrap();
        assert_eq!(parts.len(), 5);
        assert!(parts.iter().all(|p| p.is_empty()));
    }

    #[test]
    fn test_seeded_partition_is_reproducible() {
        let labels = labels(5, 20);
        let a = partition_by_class(&labels, 5, 4, &mut StdRng::seed_from_u64(11)).unwrap();
        let b = partition_by_class(&labels, 5, 4, &mut StdRng::seed_from_u64(11)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_label_out_of_range() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(partition_by_class(&[0, 5], 2, 1, &mut rng).is_err());
    }
}
