//! Error types for fedfim

use thiserror::Error;

/// All possible errors in fedfim
#[derive(Error, Debug)]
pub enum FedError {
    /// Invalid experiment configuration, detected before any round starts
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Parameter maps disagree on names or tensor shapes
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A client partition cannot produce a single full minibatch
    #[error("Client {client} has {examples} examples, fewer than one batch of {batch_size}")]
    EmptyPartition {
        /// Index of the offending client
        client: usize,
        /// Examples in the client's partition
        examples: usize,
        /// Configured minibatch size
        batch_size: usize,
    },

    /// No client updates were provided for aggregation
    #[error("Empty updates provided")]
    EmptyUpdates,

    /// A dataset or split has no examples
    #[error("Empty dataset: {0}")]
    EmptyDataset(String),

    /// A label falls outside `[0, num_classes)`
    #[error("Label {label} out of range for {num_classes} classes")]
    LabelOutOfRange {
        /// The offending label
        label: usize,
        /// Number of classes the model predicts
        num_classes: usize,
    },

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(String),

    /// Checkpoint or metrics (de)serialisation failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem error from a sink
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ndarray::ShapeError> for FedError {
    fn from(e: ndarray::ShapeError) -> Self {
        FedError::ShapeMismatch(e.to_string())
    }
}

impl From<bincode::Error> for FedError {
    fn from(e: bincode::Error) -> Self {
        FedError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FedError {
    fn from(e: serde_json::Error) -> Self {
        FedError::Serialization(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FedError>;
