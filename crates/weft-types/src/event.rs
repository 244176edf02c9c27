//! Event types for the Weft workflow event bus and durable event log.
//!
//! `WorkflowEvent` is the unified event type broadcast during workflow
//! execution. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels. `EventRecord` is the append-only durable form written
//! through the persistence layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow execution.
///
/// Used by the event bus to communicate execution lifecycle to subscribers
/// and by the engine to append to the durable event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A workflow execution has started.
    WorkflowStarted {
        execution_id: Uuid,
        workflow_name: String,
        trigger: String,
    },

    /// A step has been dispatched to its agent.
    StepStarted {
        execution_id: Uuid,
        step_key: String,
        agent: String,
        attempt: u32,
    },

    /// A step completed successfully.
    StepCompleted {
        execution_id: Uuid,
        step_key: String,
        duration_ms: u64,
        retry_count: u32,
    },

    /// A step failed (after exhausting retries).
    StepFailed {
        execution_id: Uuid,
        step_key: String,
        error: String,
        optional: bool,
    },

    /// A checkpoint snapshot was persisted.
    CheckpointCreated {
        execution_id: Uuid,
        checkpoint_id: Uuid,
        completed_steps: u32,
        size_bytes: u64,
    },

    /// Execution paused at a level boundary.
    ExecutionPaused {
        execution_id: Uuid,
        checkpoint_id: Uuid,
    },

    /// Execution resumed from a checkpoint.
    ExecutionResumed {
        execution_id: Uuid,
        checkpoint_id: Uuid,
        resume_count: u32,
        skipped_steps: u32,
    },

    /// Execution was cancelled by an external request.
    ExecutionCancelled { execution_id: Uuid },

    /// The workflow execution completed successfully.
    WorkflowCompleted {
        execution_id: Uuid,
        workflow_name: String,
        duration_ms: u64,
        steps_completed: u32,
        warnings: u32,
    },

    /// The workflow execution failed.
    WorkflowFailed {
        execution_id: Uuid,
        workflow_name: String,
        error: String,
    },
}

impl WorkflowEvent {
    /// Stable identifier for the durable event log (`workflow_started`, ...).
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted { .. } => "workflow_started",
            WorkflowEvent::StepStarted { .. } => "step_started",
            WorkflowEvent::StepCompleted { .. } => "step_completed",
            WorkflowEvent::StepFailed { .. } => "step_failed",
            WorkflowEvent::CheckpointCreated { .. } => "checkpoint_created",
            WorkflowEvent::ExecutionPaused { .. } => "execution_paused",
            WorkflowEvent::ExecutionResumed { .. } => "execution_resumed",
            WorkflowEvent::ExecutionCancelled { .. } => "execution_cancelled",
            WorkflowEvent::WorkflowCompleted { .. } => "workflow_completed",
            WorkflowEvent::WorkflowFailed { .. } => "workflow_failed",
        }
    }

    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::WorkflowStarted { execution_id, .. }
            | WorkflowEvent::StepStarted { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::StepFailed { execution_id, .. }
            | WorkflowEvent::CheckpointCreated { execution_id, .. }
            | WorkflowEvent::ExecutionPaused { execution_id, .. }
            | WorkflowEvent::ExecutionResumed { execution_id, .. }
            | WorkflowEvent::ExecutionCancelled { execution_id }
            | WorkflowEvent::WorkflowCompleted { execution_id, .. }
            | WorkflowEvent::WorkflowFailed { execution_id, .. } => *execution_id,
        }
    }
}

/// Durable form of a workflow event in the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// UUIDv7 event ID (time-sortable, doubles as log order).
    pub id: Uuid,
    /// Execution the event belongs to.
    pub execution_id: Uuid,
    /// Stable event type identifier (e.g. "step_completed").
    pub event_type: String,
    /// Full event payload as JSON.
    pub payload: serde_json::Value,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Build a durable record from a broadcast event.
    pub fn from_event(event: &WorkflowEvent) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id: event.execution_id(),
            event_type: event.event_type().to_string(),
            payload: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_roundtrip() {
        let event = WorkflowEvent::StepCompleted {
            execution_id: Uuid::now_v7(),
            step_key: "gather".to_string(),
            duration_ms: 1200,
            retry_count: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_completed\""));
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, WorkflowEvent::StepCompleted { .. }));
    }

    #[test]
    fn test_event_type_identifiers() {
        let id = Uuid::now_v7();
        let event = WorkflowEvent::WorkflowStarted {
            execution_id: id,
            workflow_name: "wf".to_string(),
            trigger: "manual".to_string(),
        };
        assert_eq!(event.event_type(), "workflow_started");
        assert_eq!(event.execution_id(), id);

        let event = WorkflowEvent::CheckpointCreated {
            execution_id: id,
            checkpoint_id: Uuid::now_v7(),
            completed_steps: 2,
            size_bytes: 128,
        };
        assert_eq!(event.event_type(), "checkpoint_created");
    }

    #[test]
    fn test_event_record_from_event() {
        let event = WorkflowEvent::ExecutionCancelled {
            execution_id: Uuid::now_v7(),
        };
        let record = EventRecord::from_event(&event);
        assert_eq!(record.event_type, "execution_cancelled");
        assert_eq!(record.execution_id, event.execution_id());
        assert_eq!(record.payload["type"], "execution_cancelled");
    }
}
