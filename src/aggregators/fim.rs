//! Fisher-information aggregation and global memory decay.
//!
//! Client FIM estimates are averaged per parameter name (unweighted), then
//! blended into the persistent global FIM:
//!
//! ```text
//! G' = gamma * G + (1 - gamma) * F     (G non-empty)
//! G' = F                               (first round)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{FedError, Result};
use crate::model::FimMap;

fn same_names(a: &FimMap, b: &FimMap) -> bool {
    a.len() == b.len() && a.keys().zip(b.keys()).all(|(x, y)| x == y)
}

/// Unweighted per-parameter mean of client FIM estimates.
///
/// Every client must report the same parameter-name set.
pub fn aggregate_fim(client_fims: &[FimMap]) -> Result<FimMap> {
    let reference = client_fims.first().ok_or(FedError::EmptyUpdates)?;
    if let Some(i) = client_fims.iter().position(|f| !same_names(reference, f)) {
        return Err(FedError::ShapeMismatch(format!(
            "client {} reports FIM for {:?}, client 0 for {:?}",
            i,
            client_fims[i].keys().collect::<Vec<_>>(),
            reference.keys().collect::<Vec<_>>()
        )));
    }

    let n = client_fims.len() as f32;
    Ok(reference
        .keys()
        .map(|name| {
            let sum: f32 = client_fims.iter().map(|f| f[name]).sum();
            (name.clone(), sum / n)
        })
        .collect())
}

/// Exponential blend of a previous global FIM with a new aggregate.
///
/// An empty `previous` means there is nothing to decay from and `new` is
/// returned as is.
pub fn decay_blend(previous: &FimMap, new: &FimMap, gamma: f32) -> Result<FimMap> {
    if !(0.0..=1.0).contains(&gamma) {
        return Err(FedError::Configuration(format!(
            "FIM decay {} outside [0, 1]",
            gamma
        )));
    }
    if previous.is_empty() {
        return Ok(new.clone());
    }
    if !same_names(previous, new) {
        return Err(FedError::ShapeMismatch(
            "global FIM and round aggregate cover different parameters".into(),
        ));
    }
    Ok(previous
        .iter()
        .map(|(name, &g)| (name.clone(), gamma * g + (1.0 - gamma) * new[name]))
        .collect())
}

/// Global FIM state persisted across rounds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalFim {
    values: FimMap,
    rounds: usize,
}

impl GlobalFim {
    /// Empty global FIM (no prior).
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-parameter values.
    pub fn values(&self) -> &FimMap {
        &self.values
    }

    /// Whether no round has been blended in yet.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of aggregates blended in so far.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Blend a new round aggregate in with decay `gamma`.
    pub fn update(&mut self, aggregated: &FimMap, gamma: f32) -> Result<()> {
        self.values = decay_blend(&self.values, aggregated, gamma)?;
        self.rounds += 1;
        Ok(())
    }
}
