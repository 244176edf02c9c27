//! Durable checkpoint service for workflow execution state.
//!
//! Wraps `WorkflowRepository` to snapshot a run at level boundaries. Each
//! checkpoint captures the execution context verbatim plus the completed and
//! pending step sets, which is everything resume needs to continue a run
//! without repeating finished work.
//!
//! Writes for the same execution are serialized through a per-execution lock
//! so concurrent checkpoint requests cannot interleave, and automatic
//! checkpoints are gated by the workflow's configured minimum interval.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;
use weft_types::event::{EventRecord, WorkflowEvent};
use weft_types::execution::{Checkpoint, ExecutionState};

use crate::repository::workflow::WorkflowRepository;

use super::context::ExecutionContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// Context could not be serialized for the snapshot.
    #[error("checkpoint serialization error: {0}")]
    Serialization(String),

    /// No checkpoint exists for the execution (for restore operations).
    #[error("no checkpoint found for execution {0}")]
    NotFound(Uuid),
}

// ---------------------------------------------------------------------------
// CheckpointService
// ---------------------------------------------------------------------------

/// Creates, gates, and restores execution checkpoints.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend
/// (SQLite, in-memory mock, etc.).
pub struct CheckpointService<R: WorkflowRepository> {
    repo: Arc<R>,
    /// Per-execution write lock. Checkpoint writes for one execution never
    /// interleave; different executions proceed independently.
    write_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Last automatic checkpoint time per execution, for interval gating.
    last_auto: DashMap<Uuid, Instant>,
}

impl<R: WorkflowRepository> CheckpointService<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            write_locks: DashMap::new(),
            last_auto: DashMap::new(),
        }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Snapshot an execution and persist it.
    ///
    /// The context is deep-copied into the snapshot; later mutations of the
    /// live context never affect an existing checkpoint. Also appends a
    /// `checkpoint_created` event to the durable event log.
    pub async fn create(
        &self,
        context: &ExecutionContext,
        state: ExecutionState,
        completed_steps: BTreeSet<String>,
        pending_steps: BTreeSet<String>,
        label: &str,
        created_by: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        let lock = self
            .write_locks
            .entry(context.execution_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let context_json = serde_json::to_value(context)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let size_bytes = serde_json::to_string(&context_json)
            .map(|s| s.len() as u64)
            .unwrap_or(0);

        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            execution_id: context.execution_id,
            state,
            context: context_json,
            completed_steps,
            pending_steps,
            label: label.to_string(),
            created_by: created_by.to_string(),
            size_bytes,
            created_at: Utc::now(),
        };

        self.repo
            .create_checkpoint(&checkpoint)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        let event = WorkflowEvent::CheckpointCreated {
            execution_id: checkpoint.execution_id,
            checkpoint_id: checkpoint.id,
            completed_steps: checkpoint.completed_steps.len() as u32,
            size_bytes: checkpoint.size_bytes,
        };
        self.repo
            .append_event(&EventRecord::from_event(&event))
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %checkpoint.execution_id,
            checkpoint_id = %checkpoint.id,
            completed = checkpoint.completed_steps.len(),
            size_bytes = checkpoint.size_bytes,
            label,
            "checkpoint created"
        );

        Ok(checkpoint)
    }

    /// Create an automatic checkpoint if at least `interval` has elapsed
    /// since the last one for this execution.
    ///
    /// A zero interval means a checkpoint after every call. Returns `None`
    /// when the interval has not yet elapsed.
    pub async fn create_if_due(
        &self,
        context: &ExecutionContext,
        state: ExecutionState,
        completed_steps: BTreeSet<String>,
        pending_steps: BTreeSet<String>,
        label: &str,
        interval: Duration,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        if let Some(last) = self.last_auto.get(&context.execution_id) {
            if last.elapsed() < interval {
                return Ok(None);
            }
        }

        let checkpoint = self
            .create(context, state, completed_steps, pending_steps, label, "engine")
            .await?;
        self.last_auto.insert(context.execution_id, Instant::now());
        Ok(Some(checkpoint))
    }

    /// Get a checkpoint by ID.
    pub async fn load(&self, checkpoint_id: &Uuid) -> Result<Checkpoint, CheckpointError> {
        self.repo
            .get_checkpoint(checkpoint_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::NotFound(*checkpoint_id))
    }

    /// The most recent checkpoint of an execution.
    pub async fn latest(&self, execution_id: &Uuid) -> Result<Checkpoint, CheckpointError> {
        self.repo
            .latest_checkpoint(execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::NotFound(*execution_id))
    }

    /// Restore the execution context captured in a checkpoint.
    pub fn restore_context(checkpoint: &Checkpoint) -> Result<ExecutionContext, CheckpointError> {
        serde_json::from_value(checkpoint.context.clone())
            .map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    /// Drop per-execution bookkeeping once a run reaches a terminal state.
    pub fn forget(&self, execution_id: &Uuid) {
        self.write_locks.remove(execution_id);
        self.last_auto.remove(execution_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
