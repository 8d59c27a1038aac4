//! Workflow checkpoint: accepted step outputs persisted for resume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ChannelError;
use crate::io::channel::{FileChannel, WriteMode};

/// Persisted progress of one workflow session (`checkpoint.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub workflow: String,
    /// Accepted step id to its output.
    #[serde(default)]
    pub completed: BTreeMap<String, Value>,
}

impl Checkpoint {
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            completed: BTreeMap::new(),
        }
    }
}

/// Where a workflow keeps its checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    channel: FileChannel,
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(channel: FileChannel, path: impl AsRef<Path>) -> Self {
        let path = channel.resolve(path);
        Self { channel, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint; `None` if none has been written yet.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        debug!(path = %self.path.display(), "loading checkpoint");
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read checkpoint {}", self.path.display()));
            }
        };
        let checkpoint: Checkpoint = serde_json::from_str(&contents)
            .with_context(|| format!("parse checkpoint {}", self.path.display()))?;
        debug!(completed = checkpoint.completed.len(), "checkpoint loaded");
        Ok(Some(checkpoint))
    }

    /// Atomically replace the checkpoint.
    pub async fn write(&self, checkpoint: &Checkpoint) -> Result<(), ChannelError> {
        debug!(path = %self.path.display(), completed = checkpoint.completed.len(), "writing checkpoint");
        self.channel
            .write_atomic(&self.path, checkpoint, WriteMode::Overwrite)
            .await
            .map(|_| ())
    }
}
