//! FedAvg aggregation over named parameter maps.
//!
//! Standard federated averaging as described by McMahan et al. (2017),
//! unweighted: every client contributes equally regardless of partition
//! size. Tensors are matched by parameter name, never by position.

use ndarray::Array2;
use rayon::prelude::*;

use crate::error::{FedError, Result};
use crate::model::{check_compatible, ParamMap};

/// Element-wise arithmetic mean of same-shaped tensors.
pub fn fedavg(updates: &[&Array2<f32>]) -> Result<Array2<f32>> {
    let first = updates.first().ok_or(FedError::EmptyUpdates)?;
    let dim = first.dim();
    for update in &updates[1..] {
        if update.dim() != dim {
            return Err(FedError::ShapeMismatch(format!(
                "tensor {:?} vs {:?}",
                update.dim(),
                dim
            )));
        }
    }

    let n = updates.len() as f32;
    let sum = updates
        .iter()
        .fold(Array2::<f32>::zeros(dim), |acc, update| acc + *update);
    Ok(sum / n)
}

/// Average client parameter maps into a new global parameter map.
///
/// All maps must share identical names and shapes; otherwise the round
/// is aborted with [`FedError::ShapeMismatch`]. Parameters are averaged
/// in parallel.
pub fn aggregate_models(client_states: &[ParamMap]) -> Result<ParamMap> {
    let reference = client_states.first().ok_or(FedError::EmptyUpdates)?;
    for (i, state) in client_states.iter().enumerate().skip(1) {
        check_compatible(reference, state)
            .map_err(|e| FedError::ShapeMismatch(format!("client {}: {}", i, e)))?;
    }

    reference
        .keys()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|name| {
            let tensors: Vec<&Array2<f32>> = client_states.iter().map(|s| &s[name]).collect();
            fedavg(&tensors).map(|mean| (name.clone(), mean))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn state(w: Array2<f32>, b: Array2<f32>) -> ParamMap {
        let mut m = ParamMap::new();
        m.insert("w".to_string(), w);
        m.insert("b".to_string(), b);
        m
    }

    #[test]
    fn test_fedavg_unweighted() {
        let a = array![[1.0, 2.0]];
        let b = array![[3.0, 4.0]];
        let result = fedavg(&[&a, &b]).unwrap();
        assert!((result[[0, 0]] - 2.0).abs() < 1e-6);
        assert!((result[[0, 1]] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_fedavg_empty() {
        assert!(matches!(fedavg(&[]), Err(FedError::EmptyUpdates)));
    }

    #[test]
    fn test_fedavg_dimension_mismatch() {
        let a = array![[1.0, 2.0]];
        let b = array![[1.0]];
        assert!(matches!(fedavg(&[&a, &b]), Err(FedError::ShapeMismatch(_))));
    }

    #[test]
    fn test_single_client_is_identity() {
        let s = state(array![[0.25, -7.5], [1.0, 3.0]], array![[42.0, 7.0]]);
        let result = aggregate_models(&[s.clone()]).unwrap();
        assert_eq!(result, s);
    }

    #[test]
    fn test_identical_clients_unchanged() {
        let s = state(array![[0.1, 0.2]], array![[0.3]]);
        let result = aggregate_models(&vec![s.clone(); 5]).unwrap();
        for (name, t) in &s {
            let r = &result[name];
            assert!(r.iter().zip(t.iter()).all(|(a, b)| (a - b).abs() < 1e-6));
        }
    }

    #[test]
    fn test_mean_by_name() {
        let a = state(array![[1.0, 1.0]], array![[0.0]]);
        let b = state(array![[3.0, 5.0]], array![[2.0]]);
        let result = aggregate_models(&[a, b]).unwrap();
        assert_eq!(result["w"], array![[2.0, 3.0]]);
        assert_eq!(result["b"], array![[1.0]]);
    }

    #[test]
    fn test_name_set_mismatch() {
        let a = state(array![[1.0]], array![[0.0]]);
        let mut b = a.clone();
        let t = b.remove("b").unwrap();
        b.insert("bias".to_string(), t);
        assert!(matches!(
            aggregate_models(&[a, b]),
            Err(FedError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let a = state(array![[1.0, 2.0]], array![[0.0]]);
        let b = state(array![[1.0], [2.0]], array![[0.0]]);
        assert!(aggregate_models(&[a, b]).is_err());
    }

    #[test]
    fn test_no_clients() {
        assert!(matches!(aggregate_models(&[]), Err(FedError::EmptyUpdates)));
    }
}
