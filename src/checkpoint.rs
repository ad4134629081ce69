//! Durable storage of global parameters.
//!
//! A [`Checkpoint`] is the parameter map keyed by name plus the round it
//! was taken after, serialised with bincode. Reloading yields exactly the
//! stored `f32` values.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::model::ParamMap;

/// Serialised global model state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Rounds completed when the checkpoint was taken
    pub rounds_completed: usize,
    /// Global parameters by name
    pub params: ParamMap,
}

impl Checkpoint {
    /// Encode to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Read from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}

/// Destination for the final global parameters.
pub trait CheckpointSink {
    /// Persist `checkpoint`.
    fn persist(&mut self, checkpoint: &Checkpoint) -> Result<()>;
}

/// Writes checkpoints to a fixed file path, overwriting.
#[derive(Clone, Debug)]
pub struct FileCheckpointSink {
    path: PathBuf,
}

impl FileCheckpointSink {
    /// Sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointSink for FileCheckpointSink {
    fn persist(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.save(&self.path)?;
        info!(
            path = %self.path.display(),
            rounds = checkpoint.rounds_completed,
            tensors = checkpoint.params.len(),
            "Saved checkpoint"
        );
        Ok(())
    }
}

/// Keeps the last persisted checkpoint in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpointSink {
    /// Most recently persisted checkpoint
    pub last: Option<Checkpoint>,
}

impl CheckpointSink for MemoryCheckpointSink {
    fn persist(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.last = Some(checkpoint.clone());
        Ok(())
    }
}
