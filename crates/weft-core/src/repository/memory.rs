//! In-memory repository implementation.
//!
//! Backs engine tests and embedded use without a database. Every table is a
//! mutex-guarded map; locks are held only for the duration of the operation,
//! never across an await point.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::event::EventRecord;
use weft_types::execution::{Checkpoint, Execution, ExecutionState, StepExecution, StepState};
use weft_types::workflow::WorkflowDefinition;

use super::workflow::WorkflowRepository;

/// Non-durable `WorkflowRepository` holding everything in process memory.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    definitions: Mutex<HashMap<String, WorkflowDefinition>>,
    executions: Mutex<HashMap<Uuid, Execution>>,
    steps: Mutex<HashMap<Uuid, StepExecution>>,
    checkpoints: Mutex<Vec<Checkpoint>>,
    events: Mutex<Vec<EventRecord>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>, RepositoryError> {
        mutex
            .lock()
            .map_err(|_| RepositoryError::Query("repository lock poisoned".to_string()))
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        Self::lock(&self.definitions)?.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(Self::lock(&self.definitions)?.get(name).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<_> = Self::lock(&self.definitions)?.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn delete_definition(&self, name: &str) -> Result<bool, RepositoryError> {
        Ok(Self::lock(&self.definitions)?.remove(name).is_some())
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut executions = Self::lock(&self.executions)?;
        if executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution_state(
        &self,
        execution_id: &Uuid,
        state: ExecutionState,
        error: Option<&str>,
        context: Option<&serde_json::Value>,
    ) -> Result<(), RepositoryError> {
        let mut executions = Self::lock(&self.executions)?;
        let execution = executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        execution.state = state;
        if let Some(error) = error {
            execution.error = Some(error.to_string());
        }
        if let Some(context) = context {
            execution.context = context.clone();
        }
        if state.is_terminal() {
            execution.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn increment_resume_count(&self, execution_id: &Uuid) -> Result<(), RepositoryError> {
        let mut executions = Self::lock(&self.executions)?;
        let execution = executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        execution.resume_count += 1;
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<Execution>, RepositoryError> {
        Ok(Self::lock(&self.executions)?.get(execution_id).cloned())
    }

    async fn list_executions(
        &self,
        workflow_name: &str,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut matches: Vec<_> = Self::lock(&self.executions)?
            .values()
            .filter(|e| e.workflow_name == workflow_name)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matches.truncate(limit as usize);
        Ok(matches)
    }

    async fn list_interrupted_executions(&self) -> Result<Vec<Execution>, RepositoryError> {
        Ok(Self::lock(&self.executions)?
            .values()
            .filter(|e| !e.state.is_terminal() && e.state != ExecutionState::Paused)
            .cloned()
            .collect())
    }

    async fn create_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        Self::lock(&self.steps)?.insert(step.id, step.clone());
        Ok(())
    }

    async fn update_step_execution(
        &self,
        step_id: &Uuid,
        state: StepState,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
        retry_count: u32,
    ) -> Result<(), RepositoryError> {
        let mut steps = Self::lock(&self.steps)?;
        let step = steps.get_mut(step_id).ok_or(RepositoryError::NotFound)?;
        step.state = state;
        step.retry_count = retry_count;
        step.attempt = retry_count + 1;
        if let Some(output) = output {
            step.output = Some(output.clone());
        }
        if let Some(error) = error {
            step.error = Some(error.to_string());
        }
        if matches!(
            state,
            StepState::Completed | StepState::Failed | StepState::Skipped
        ) {
            step.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_step_executions(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let mut matches: Vec<_> = Self::lock(&self.steps)?
            .values()
            .filter(|s| s.execution_id == *execution_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(matches)
    }

    async fn completed_step_keys(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<String>, RepositoryError> {
        Ok(Self::lock(&self.steps)?
            .values()
            .filter(|s| s.execution_id == *execution_id && s.state == StepState::Completed)
            .map(|s| s.step_key.clone())
            .collect())
    }

    async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        Self::lock(&self.checkpoints)?.push(checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(Self::lock(&self.checkpoints)?
            .iter()
            .find(|c| c.id == *checkpoint_id)
            .cloned())
    }

    async fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(Self::lock(&self.checkpoints)?
            .iter()
            .filter(|c| c.execution_id == *execution_id)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        let mut matches: Vec<_> = Self::lock(&self.checkpoints)?
            .iter()
            .filter(|c| c.execution_id == *execution_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches)
    }

    async fn append_event(&self, event: &EventRecord) -> Result<(), RepositoryError> {
        Self::lock(&self.events)?.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, execution_id: &Uuid) -> Result<Vec<EventRecord>, RepositoryError> {
        Ok(Self::lock(&self.events)?
            .iter()
            .filter(|e| e.execution_id == *execution_id)
            .cloned()
            .collect())
    }
}
