//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, executions, step
//! logs, checkpoints, and events. The infrastructure layer (weft-infra)
//! implements this trait with SQLite persistence; tests use the in-memory
//! implementation from `memory`.

use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::event::EventRecord;
use weft_types::execution::{Checkpoint, Execution, ExecutionState, StepExecution, StepState};
use weft_types::workflow::WorkflowDefinition;

/// Repository trait for workflow persistence.
///
/// Covers five entity families:
/// - **Definitions:** CRUD for workflow definitions, keyed by name.
/// - **Executions:** create/update/query runtime instances.
/// - **Steps:** create/update/query individual step execution logs.
/// - **Checkpoints:** append-only execution snapshots for pause/resume.
/// - **Events:** append-only lifecycle event log per execution.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by name).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by name.
    fn get_definition(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List all workflow definitions, ordered by name.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a workflow definition by name. Returns `true` if it existed.
    fn delete_definition(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a new execution record.
    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update an execution's state (and optionally error message / context).
    ///
    /// Sets `completed_at` when `state` is terminal.
    fn update_execution_state(
        &self,
        execution_id: &Uuid,
        state: ExecutionState,
        error: Option<&str>,
        context: Option<&serde_json::Value>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Increment an execution's resume counter.
    fn increment_resume_count(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// List executions for a workflow name, ordered by started_at DESC.
    fn list_executions(
        &self,
        workflow_name: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// List executions left in a non-terminal state (crash recovery).
    fn list_interrupted_executions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Create a new step execution log entry.
    fn create_step_execution(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update a step's state and optionally its output/error/retry count.
    fn update_step_execution(
        &self,
        step_id: &Uuid,
        state: StepState,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
        retry_count: u32,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List all step logs for an execution, ordered by started_at ASC.
    fn list_step_executions(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    /// Step keys that completed successfully in an execution (for resume).
    fn completed_step_keys(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Persist a checkpoint snapshot.
    fn create_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a checkpoint by its UUID.
    fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// The most recent checkpoint of an execution, if any.
    fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// List all checkpoints of an execution, newest first.
    fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Append a lifecycle event to the execution's event log.
    fn append_event(
        &self,
        event: &EventRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List all events of an execution, oldest first.
    fn list_events(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<EventRecord>, RepositoryError>> + Send;
}
