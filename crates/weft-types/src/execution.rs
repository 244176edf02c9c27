//! Execution tracking types for Weft.
//!
//! Runtime records for a single workflow run: the `Execution` row, per-step
//! `StepExecution` logs, and immutable `Checkpoint` snapshots used for
//! pause/resume and crash recovery.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Execution State
// ---------------------------------------------------------------------------

/// Lifecycle state of a workflow execution.
///
/// `Completed`, `Failed`, and `Cancelled` are terminal; the legal transitions
/// between states are enforced by the state machine in `weft-core`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Parsing,
    Validating,
    BuildingGraph,
    Scheduling,
    Executing,
    AwaitingCompletion,
    CreatingCheckpoint,
    RestoringCheckpoint,
    AggregatingResults,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl ExecutionState {
    /// Whether this state is terminal (no further transitions allowed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

/// Status of an individual step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Scheduling priority of an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

// ---------------------------------------------------------------------------
// Execution (runtime instance)
// ---------------------------------------------------------------------------

/// A single runtime instance of a workflow definition.
///
/// Created when a run is requested, mutated by the engine as levels complete,
/// never deleted automatically (retention is an external policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    /// Name of the workflow being executed (denormalized for display).
    pub workflow_name: String,
    /// Version of the workflow being executed.
    pub workflow_version: String,
    /// Current lifecycle state.
    pub state: ExecutionState,
    /// JSON execution context (accumulated step outputs + variables).
    pub context: serde_json::Value,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Who or what requested this run (e.g. "manual", "api", "schedule").
    pub trigger: String,
    /// Parent execution (for nested or resumed runs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state (None if still running).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of times this execution has been resumed from a checkpoint.
    #[serde(default)]
    pub resume_count: u32,
}

// ---------------------------------------------------------------------------
// Step Execution
// ---------------------------------------------------------------------------

/// Execution log for a single step within a workflow run.
///
/// Created lazily when the step's level becomes eligible to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// UUIDv7 step execution ID.
    pub id: Uuid,
    /// Parent execution ID.
    pub execution_id: Uuid,
    /// Step key matching `StepDefinition.key`.
    pub step_key: String,
    /// Current step status.
    pub state: StepState,
    /// Attempt number (1-based, increments on retry).
    pub attempt: u32,
    /// Number of retries consumed (attempt - 1 once settled).
    pub retry_count: u32,
    /// Rendered prompt/payload passed to the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// JSON output produced by this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error message if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When step execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When step execution settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// An immutable point-in-time snapshot of an execution's state.
///
/// Created automatically after each completed level (subject to the
/// configured interval) and on pause. Consumed only by resume, which restores
/// `context` verbatim and skips every step key in `completed_steps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// UUIDv7 checkpoint ID.
    pub id: Uuid,
    /// Execution this snapshot belongs to.
    pub execution_id: Uuid,
    /// Execution state at capture time.
    pub state: ExecutionState,
    /// Deep copy of the execution context at capture time.
    pub context: serde_json::Value,
    /// Step keys completed at capture time. Ordered for stable serialization.
    pub completed_steps: BTreeSet<String>,
    /// Step keys still pending at capture time.
    pub pending_steps: BTreeSet<String>,
    /// Human-readable label (e.g. "after level 2", "pre-pause").
    pub label: String,
    /// Who created the checkpoint ("engine" for automatic ones).
    pub created_by: String,
    /// Serialized context size in bytes.
    pub size_bytes: u64,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Step Warning
// ---------------------------------------------------------------------------

/// Warning recorded when an optional step fails without aborting the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepWarning {
    /// The failed optional step.
    pub step_key: String,
    /// The failure message.
    pub message: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
