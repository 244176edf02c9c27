//! SQLite implementation of the workflow repository.
//!
//! Stores workflow definitions as JSON blobs keyed by name, and executions,
//! step logs, checkpoints, and events in their own tables. All reads go
//! through the reader pool, all writes through the single-connection writer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;
use weft_core::repository::WorkflowRepository;
use weft_types::error::RepositoryError;
use weft_types::event::EventRecord;
use weft_types::execution::{
    Checkpoint, Execution, ExecutionState, Priority, StepExecution, StepState,
};
use weft_types::workflow::WorkflowDefinition;

use super::pool::DatabasePool;

/// SQLite-backed workflow repository.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn db_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(s).map_err(|e| RepositoryError::Query(format!("invalid uuid '{s}': {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid timestamp '{s}': {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Serialize a status enum to its snake_case string form.
fn status_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    let v = serde_json::to_value(value)
        .map_err(|e| RepositoryError::Query(format!("status serialization: {e}")))?;
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| RepositoryError::Query("status did not serialize to a string".to_string()))
}

/// Parse a status enum from its snake_case string form.
fn parse_status<T: DeserializeOwned>(s: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| RepositoryError::Query(format!("invalid status '{s}': {e}")))
}

fn parse_json(s: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid json: {e}")))
}

fn to_json_string<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialization: {e}")))
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    workflow_name: String,
    workflow_version: String,
    state: String,
    context: String,
    priority: String,
    trigger_type: String,
    parent_execution_id: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
    resume_count: i64,
}

impl sqlx::FromRow<'_, SqliteRow> for ExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            workflow_version: row.try_get("workflow_version")?,
            state: row.try_get("state")?,
            context: row.try_get("context")?,
            priority: row.try_get("priority")?,
            trigger_type: row.try_get("trigger_type")?,
            parent_execution_id: row.try_get("parent_execution_id")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
            resume_count: row.try_get("resume_count")?,
        })
    }
}

impl ExecutionRow {
    fn into_execution(self) -> Result<Execution, RepositoryError> {
        Ok(Execution {
            id: parse_uuid(&self.id)?,
            workflow_name: self.workflow_name,
            workflow_version: self.workflow_version,
            state: parse_status::<ExecutionState>(&self.state)?,
            context: parse_json(&self.context)?,
            priority: parse_status::<Priority>(&self.priority)?,
            trigger: self.trigger_type,
            parent_execution_id: self
                .parent_execution_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error,
            resume_count: self.resume_count as u32,
        })
    }
}

struct StepRow {
    id: String,
    execution_id: String,
    step_key: String,
    state: String,
    attempt: i64,
    retry_count: i64,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl sqlx::FromRow<'_, SqliteRow> for StepRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step_key: row.try_get("step_key")?,
            state: row.try_get("state")?,
            attempt: row.try_get("attempt")?,
            retry_count: row.try_get("retry_count")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl StepRow {
    fn into_step_execution(self) -> Result<StepExecution, RepositoryError> {
        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_key: self.step_key,
            state: parse_status::<StepState>(&self.state)?,
            attempt: self.attempt as u32,
            retry_count: self.retry_count as u32,
            input: self.input,
            output: self.output.as_deref().map(parse_json).transpose()?,
            error: self.error,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct CheckpointRow {
    id: String,
    execution_id: String,
    state: String,
    context: String,
    completed_steps: String,
    pending_steps: String,
    label: String,
    created_by: String,
    size_bytes: i64,
    created_at: String,
}

impl sqlx::FromRow<'_, SqliteRow> for CheckpointRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            state: row.try_get("state")?,
            context: row.try_get("context")?,
            completed_steps: row.try_get("completed_steps")?,
            pending_steps: row.try_get("pending_steps")?,
            label: row.try_get("label")?,
            created_by: row.try_get("created_by")?,
            size_bytes: row.try_get("size_bytes")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        Ok(Checkpoint {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            state: parse_status::<ExecutionState>(&self.state)?,
            context: parse_json(&self.context)?,
            completed_steps: serde_json::from_str(&self.completed_steps)
                .map_err(|e| RepositoryError::Query(format!("invalid completed_steps: {e}")))?,
            pending_steps: serde_json::from_str(&self.pending_steps)
                .map_err(|e| RepositoryError::Query(format!("invalid pending_steps: {e}")))?,
            label: self.label,
            created_by: self.created_by,
            size_bytes: self.size_bytes as u64,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct EventRow {
    id: String,
    execution_id: String,
    event_type: String,
    payload: String,
    created_at: String,
}

impl sqlx::FromRow<'_, SqliteRow> for EventRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl EventRow {
    fn into_event_record(self) -> Result<EventRecord, RepositoryError> {
        Ok(EventRecord {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            event_type: self.event_type,
            payload: parse_json(&self.payload)?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Repository implementation
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let definition = to_json_string(def)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (name, version, definition, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(name) DO UPDATE SET
                version = excluded.version,
                definition = excluded.definition,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&def.name)
        .bind(&def.version)
        .bind(&definition)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_definition(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT definition FROM workflows WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(db_err)?;

        row.map(|(json,)| {
            serde_json::from_str(&json)
                .map_err(|e| RepositoryError::Query(format!("invalid definition blob: {e}")))
        })
        .transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT definition FROM workflows ORDER BY name ASC")
                .fetch_all(&self.pool.reader)
                .await
                .map_err(db_err)?;

        rows.into_iter()
            .map(|(json,)| {
                serde_json::from_str(&json)
                    .map_err(|e| RepositoryError::Query(format!("invalid definition blob: {e}")))
            })
            .collect()
    }

    async fn delete_definition(&self, name: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE name = ?1")
            .bind(name)
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, workflow_name, workflow_version, state, context, priority,
                 trigger_type, parent_execution_id, started_at, completed_at, error,
                 resume_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.workflow_name)
        .bind(&execution.workflow_version)
        .bind(status_str(&execution.state)?)
        .bind(to_json_string(&execution.context)?)
        .bind(status_str(&execution.priority)?)
        .bind(&execution.trigger)
        .bind(execution.parent_execution_id.map(|id| id.to_string()))
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(&execution.error)
        .bind(execution.resume_count as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("execution {} already exists", execution.id))
            }
            other => db_err(other),
        })?;

        Ok(())
    }

    async fn update_execution_state(
        &self,
        execution_id: &Uuid,
        state: ExecutionState,
        error: Option<&str>,
        context: Option<&serde_json::Value>,
    ) -> Result<(), RepositoryError> {
        let completed_at = state
            .is_terminal()
            .then(|| format_datetime(&Utc::now()));
        let context_json = context.map(to_json_string).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET state = ?1,
                error = COALESCE(?2, error),
                context = COALESCE(?3, context),
                completed_at = COALESCE(?4, completed_at)
            WHERE id = ?5
            "#,
        )
        .bind(status_str(&state)?)
        .bind(error)
        .bind(context_json)
        .bind(completed_at)
        .bind(execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn increment_resume_count(&self, execution_id: &Uuid) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE executions SET resume_count = resume_count + 1 WHERE id = ?1")
                .bind(execution_id.to_string())
                .execute(&self.pool.writer)
                .await
                .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<Execution>, RepositoryError> {
        let row: Option<ExecutionRow> =
            sqlx::query_as("SELECT * FROM executions WHERE id = ?1")
                .bind(execution_id.to_string())
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(db_err)?;

        row.map(ExecutionRow::into_execution).transpose()
    }

    async fn list_executions(
        &self,
        workflow_name: &str,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT * FROM executions
            WHERE workflow_name = ?1
            ORDER BY started_at DESC
            LIMIT ?2
            "#,
        )
        .bind(workflow_name)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    async fn list_interrupted_executions(&self) -> Result<Vec<Execution>, RepositoryError> {
        // Paused executions are excluded: they are waiting for an explicit
        // resume, not abandoned by a crash.
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT * FROM executions
            WHERE state NOT IN ('completed', 'failed', 'cancelled', 'paused')
            ORDER BY started_at ASC
            "#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    async fn create_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_steps
                (id, execution_id, step_key, state, attempt, retry_count, input,
                 output, error, started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(step.id.to_string())
        .bind(step.execution_id.to_string())
        .bind(&step.step_key)
        .bind(status_str(&step.state)?)
        .bind(step.attempt as i64)
        .bind(step.retry_count as i64)
        .bind(&step.input)
        .bind(step.output.as_ref().map(to_json_string).transpose()?)
        .bind(&step.error)
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

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
        let settled = matches!(
            state,
            StepState::Completed | StepState::Failed | StepState::Skipped
        );
        let completed_at = settled.then(|| format_datetime(&Utc::now()));
        let output_json = output.map(to_json_string).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET state = ?1,
                output = COALESCE(?2, output),
                error = COALESCE(?3, error),
                retry_count = ?4,
                attempt = ?4 + 1,
                completed_at = COALESCE(?5, completed_at)
            WHERE id = ?6
            "#,
        )
        .bind(status_str(&state)?)
        .bind(output_json)
        .bind(error)
        .bind(retry_count as i64)
        .bind(completed_at)
        .bind(step_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_step_executions(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows: Vec<StepRow> = sqlx::query_as(
            r#"
            SELECT * FROM workflow_steps
            WHERE execution_id = ?1
            ORDER BY started_at ASC
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(StepRow::into_step_execution).collect()
    }

    async fn completed_step_keys(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT step_key FROM workflow_steps
            WHERE execution_id = ?1 AND state = 'completed'
            ORDER BY started_at ASC
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints
                (id, execution_id, state, context, completed_steps, pending_steps,
                 label, created_by, size_bytes, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.execution_id.to_string())
        .bind(status_str(&checkpoint.state)?)
        .bind(to_json_string(&checkpoint.context)?)
        .bind(to_json_string(&checkpoint.completed_steps)?)
        .bind(to_json_string(&checkpoint.pending_steps)?)
        .bind(&checkpoint.label)
        .bind(&checkpoint.created_by)
        .bind(checkpoint.size_bytes as i64)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let row: Option<CheckpointRow> =
            sqlx::query_as("SELECT * FROM checkpoints WHERE id = ?1")
                .bind(checkpoint_id.to_string())
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(db_err)?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    async fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT * FROM checkpoints
            WHERE execution_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_err)?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    async fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT * FROM checkpoints
            WHERE execution_id = ?1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    async fn append_event(&self, event: &EventRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_events (id, execution_id, event_type, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.execution_id.to_string())
        .bind(&event.event_type)
        .bind(to_json_string(&event.payload)?)
        .bind(format_datetime(&event.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn list_events(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<EventRecord>, RepositoryError> {
        // UUIDv7 ids are time-ordered, so ordering by id gives append order.
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT * FROM workflow_events
            WHERE execution_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(EventRow::into_event_record).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
