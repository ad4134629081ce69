//! Held-out evaluation of the global model.

use ndarray::Axis;
use serde::{Deserialize, Serialize};

use crate::data::Dataset;
use crate::error::{FedError, Result};
use crate::model::{Differentiable, LossFn};

/// Loss and accuracy of a model on a dataset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Mean loss per batch
    pub loss: f32,
    /// Correct predictions / total examples
    pub accuracy: f32,
    /// Examples evaluated
    pub examples: usize,
}

/// Evaluate `model` on all of `dataset` in batches of `batch_size`.
///
/// Forward passes only: neither parameters nor gradient buffers are
/// touched. The trailing partial batch is included.
pub fn evaluate<M: Differentiable, L: LossFn>(
    model: &M,
    dataset: &Dataset,
    loss: &L,
    batch_size: usize,
) -> Result<Evaluation> {
    if dataset.is_empty() {
        return Err(FedError::EmptyDataset("test set has no examples".into()));
    }
    if batch_size == 0 {
        return Err(FedError::Configuration("eval batch size must be > 0".into()));
    }

    let indices: Vec<usize> = (0..dataset.len()).collect();
    let (mut loss_sum, mut batches, mut correct) = (0.0f32, 0usize, 0usize);

    for batch in dataset.batches(&indices, batch_size, false) {
        let logits = model.forward(batch.features.view())?;
        loss_sum += loss.loss(logits.view(), &batch.labels)?;
        batches += 1;

        correct += logits
            .axis_iter(Axis(0))
            .zip(&batch.labels)
            .filter(|(row, &label)| argmax(row.iter().copied()) == Some(label))
            .count();
    }

    Ok(Evaluation {
        loss: loss_sum / batches as f32,
        accuracy: correct as f32 / dataset.len() as f32,
        examples: dataset.len(),
    })
}

/// Index of the largest value; first index wins ties.
fn argmax(values: impl Iterator<Item = f32>) -> Option<usize> {
    values
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}
