//! Server-side aggregation of client results.
//!
//! | Step | Rule |
//! |------|------|
//! | [`aggregate_models`] | unweighted FedAvg per parameter name |
//! | [`aggregate_fim`] | unweighted mean of client FIM scalars |
//! | [`GlobalFim::update`] | `G' = gamma * G + (1 - gamma) * F`, or `F` on the first round |

pub mod fedavg;
pub mod fim;

pub use fedavg::{aggregate_models, fedavg};
pub use fim::{aggregate_fim, decay_blend, GlobalFim};

use tracing::debug;

use crate::client::ClientUpdate;
use crate::error::{FedError, Result};
use crate::model::{FimMap, ParamMap};

/// Combined output of one aggregation step.
#[derive(Clone, Debug)]
pub struct RoundAggregate {
    /// New global parameters
    pub params: ParamMap,
    /// Client-average FIM for this round, before decay blending
    pub client_fim: FimMap,
}

/// Aggregator holding the FIM memory decay factor.
///
/// # Example
///
/// ```rust
/// use fedfim::aggregators::{Aggregator, GlobalFim};
/// use fedfim::client::ClientUpdate;
/// use fedfim::model::{FimMap, ParamMap};
/// use ndarray::array;
///
/// let update = |w: f32, f: f32| ClientUpdate {
///     client: 0,
///     params: ParamMap::from([("w".to_string(), array![[w]])]),
///     fim: FimMap::from([("w".to_string(), f)]),
///     batches: 1,
///     mean_loss: 0.0,
///     mean_penalty: 0.0,
/// };
///
/// let agg = Aggregator::new(0.5).unwrap();
/// let mut global = GlobalFim::new();
/// let round = agg.aggregate(vec![update(1.0, 0.2), update(3.0, 0.4)], &mut global).unwrap();
///
/// assert!((round.params["w"][[0, 0]] - 2.0).abs() < 1e-6);
/// assert!((global.values()["w"] - 0.3).abs() < 1e-6);
/// ```
#[derive(Clone, Debug)]
pub struct Aggregator {
    fim_decay: f32,
}

impl Aggregator {
    /// Create an aggregator; `fim_decay` must lie in `[0, 1]`.
    pub fn new(fim_decay: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&fim_decay) {
            return Err(FedError::Configuration(format!(
                "FIM decay {} outside [0, 1]",
                fim_decay
            )));
        }
        Ok(Self { fim_decay })
    }

    /// Memory decay factor.
    pub fn fim_decay(&self) -> f32 {
        self.fim_decay
    }

    /// Consume one round's client updates: average the models, average
    /// the FIMs and blend the result into `global_fim`.
    ///
    /// `global_fim` is only modified when every step succeeds.
    pub fn aggregate(
        &self,
        updates: Vec<ClientUpdate>,
        global_fim: &mut GlobalFim,
    ) -> Result<RoundAggregate> {
        if updates.is_empty() {
            return Err(FedError::EmptyUpdates);
        }
        let n_clients = updates.len();
        let (states, fims): (Vec<ParamMap>, Vec<FimMap>) =
            updates.into_iter().map(|u| (u.params, u.fim)).unzip();

        let params = aggregate_models(&states)?;
        let client_fim = aggregate_fim(&fims)?;
        global_fim.update(&client_fim, self.fim_decay)?;

        debug!(
            n_clients,
            n_params = params.len(),
            decay = self.fim_decay,
            "Aggregated round"
        );
        Ok(RoundAggregate { params, client_fim })
    }
}
