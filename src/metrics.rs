//! Per-round metrics and append-only sinks.
//!
//! The core only writes; it never reads metrics back. [`RoundLog`] keeps
//! everything in memory, [`JsonLinesSink`] appends one JSON object per
//! round to a file.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::FimMap;

/// Metrics emitted once per completed round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundMetrics {
    /// Round number (0-indexed)
    pub round: usize,
    /// Mean test loss per batch
    pub test_loss: f32,
    /// Test accuracy
    pub test_accuracy: f32,
    /// Mean local training loss across clients
    pub mean_train_loss: f32,
    /// L2 distance between the previous and new global parameters
    pub update_norm: f32,
    /// Number of clients aggregated
    pub n_clients: usize,
    /// Global FIM value per parameter after this round's decay update
    pub global_fim: FimMap,
}

impl RoundMetrics {
    /// Flatten into scalar entries; FIM values are keyed `fim/<param>`.
    pub fn to_scalars(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        out.insert("round".to_string(), self.round as f64);
        out.insert("test_loss".to_string(), self.test_loss as f64);
        out.insert("test_accuracy".to_string(), self.test_accuracy as f64);
        out.insert("mean_train_loss".to_string(), self.mean_train_loss as f64);
        out.insert("update_norm".to_string(), self.update_norm as f64);
        out.insert("n_clients".to_string(), self.n_clients as f64);
        for (name, value) in &self.global_fim {
            out.insert(format!("fim/{}", name), *value as f64);
        }
        out
    }
}

/// Append-only destination for round metrics.
pub trait MetricsSink {
    /// Record one round.
    fn record(&mut self, metrics: &RoundMetrics) -> Result<()>;

    /// Flush buffered output; called once after the last round.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory log of every round.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoundLog {
    entries: Vec<RoundMetrics>,
}

impl RoundLog {
    /// Create a new, empty log.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Get all entries.
    pub fn entries(&self) -> &[RoundMetrics] {
        &self.entries
    }

    /// Number of recorded rounds.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent round, if any.
    pub fn last(&self) -> Option<&RoundMetrics> {
        self.entries.last()
    }

    /// Serialize the log to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl MetricsSink for RoundLog {
    fn record(&mut self, metrics: &RoundMetrics) -> Result<()> {
        self.entries.push(metrics.clone());
        Ok(())
    }
}

/// Appends each round's flattened scalars as one JSON line.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonLinesSink {
    fn record(&mut self, metrics: &RoundMetrics) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &metrics.to_scalars())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(round: usize) -> RoundMetrics {
        RoundMetrics {
            round,
            test_loss: 0.5,
            test_accuracy: 0.75,
            mean_train_loss: 0.6,
            update_norm: 1.25,
            n_clients: 4,
            global_fim: FimMap::from([("layers.0.weight".to_string(), 0.01)]),
        }
    }

    #[test]
    fn test_round_log_push_and_len() {
        let mut log = RoundLog::new();
        assert!(log.is_empty());
        for i in 0..3 {
            log.record(&metrics(i)).unwrap();
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.last().unwrap().round, 2);
        assert_eq!(log.entries()[0].n_clients, 4);
    }

    #[test]
    fn test_scalars_include_fim() {
        let scalars = metrics(7).to_scalars();
        assert_eq!(scalars["round"], 7.0);
        assert!((scalars["fim/layers.0.weight"] - 0.01).abs() < 1e-6);
        assert!((scalars["test_accuracy"] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_metrics_serde() {
        let json = serde_json::to_string(&metrics(3)).unwrap();
        let restored: RoundMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, metrics(3));
    }

    #[test]
    fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("metrics.jsonl");
        {
            let mut sink = JsonLinesSink::create(&path).unwrap();
            sink.record(&metrics(0)).unwrap();
            sink.record(&metrics(1)).unwrap();
            sink.flush().unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: BTreeMap<String, f64> = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["round"], 1.0);
    }
}
