//! Durable checkpoints for suspend/resume.
//!
//! A checkpoint captures the trunk state and the pending frontier of a
//! suspended run. The executor talks to storage only through the
//! `Checkpointer` trait; implementations must be safe for concurrent access
//! since independent runs may save under different ids at the same time.
//!
//! The file implementation writes one JSON file per checkpoint id plus a
//! SHA-256 checksum sidecar, validated on load. The checksum lives in a
//! separate file to avoid baking it into the JSON it covers.

use crate::state::WorkflowState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Durable snapshot of a suspended execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Caller-supplied checkpoint id
    pub id: String,
    /// Trunk state at suspension
    pub state: WorkflowState,
    /// Node ids pending when the run suspended, suspending node first
    pub frontier: Vec<String>,
    /// Join bookkeeping at suspension
    #[serde(default)]
    pub joins: JoinSnapshot,
    /// When the checkpoint was created
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(id: impl Into<String>, state: WorkflowState, frontier: Vec<String>) -> Self {
        Self {
            id: id.into(),
            state,
            frontier,
            joins: JoinSnapshot::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_joins(mut self, joins: JoinSnapshot) -> Self {
        self.joins = joins;
        self
    }
}

/// Activation-group bookkeeping persisted alongside the frontier. Without it
/// a firing into a partially satisfied ALL group, or an ANY group's
/// once-per-execution latch, would be lost across suspend/resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinSnapshot {
    /// Edge indices with an unconsumed firing
    pub fired: Vec<usize>,
    /// Edge indices whose condition evaluated false
    pub declined: Vec<usize>,
    /// (target node, group name) pairs of latched ANY groups
    pub latched: Vec<(String, String)>,
}

/// Errors from checkpoint storage.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint '{0}' not found")]
    NotFound(String),

    #[error("checkpoint is corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("checkpoint checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("checkpoint storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable key-value store for checkpoints.
///
/// Saving under an id that already exists supersedes the previous record.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
    async fn load(&self, checkpoint_id: &str) -> Result<Checkpoint, CheckpointError>;
}

/// In-memory checkpointer for tests and embedded use.
#[derive(Default)]
pub struct MemoryCheckpointer {
    slots: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.slots
            .lock()
            .await
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Checkpoint, CheckpointError> {
        self.slots
            .lock()
            .await
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.to_string()))
    }
}

/// File-backed checkpointer: `<dir>/<id>.json` plus `<dir>/<id>.checksum`.
pub struct FileCheckpointer {
    base_dir: PathBuf,
}

impl FileCheckpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: dir.into() }
    }

    fn checkpoint_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.json"))
    }

    fn checksum_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.checksum"))
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| CheckpointError::Corrupted { reason: e.to_string() })?;
        let checksum = compute_checksum(&json);

        fs::create_dir_all(&self.base_dir).await?;

        // write to a scratch file first so a crash never leaves a torn record
        let path = self.checkpoint_path(&checkpoint.id);
        let scratch = self.base_dir.join(format!("{}.json.tmp", checkpoint.id));
        fs::write(&scratch, &json).await?;
        fs::rename(&scratch, &path).await?;
        fs::write(self.checksum_path(&checkpoint.id), &checksum).await?;

        info!(
            checkpoint = %checkpoint.id,
            bytes = json.len(),
            frontier = checkpoint.frontier.len(),
            "saved checkpoint"
        );
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.checkpoint_path(checkpoint_id);
        if !path.exists() {
            debug!(checkpoint = %checkpoint_id, "no checkpoint on disk");
            return Err(CheckpointError::NotFound(checkpoint_id.to_string()));
        }

        let json = fs::read_to_string(&path).await?;
        let expected = fs::read_to_string(self.checksum_path(checkpoint_id)).await?;
        let actual = compute_checksum(&json);
        if actual != expected.trim() {
            return Err(CheckpointError::ChecksumMismatch {
                expected: expected.trim().to_string(),
                actual,
            });
        }

        let checkpoint: Checkpoint = serde_json::from_str(&json)
            .map_err(|e| CheckpointError::Corrupted { reason: e.to_string() })?;

        info!(checkpoint = %checkpoint_id, "loaded checkpoint");
        Ok(checkpoint)
    }
}

fn compute_checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}
