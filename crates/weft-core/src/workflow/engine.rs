//! Level-by-level workflow engine with durable checkpointing.
//!
//! The `WorkflowEngine` drives a parsed workflow through its lifecycle:
//! validation, graph resolution, then execution of one dependency level at a
//! time. Steps within a level run concurrently via `tokio::JoinSet`, bounded
//! by the workflow's configured parallelism. The engine only advances past a
//! level once every step in it has settled (the level barrier), which keeps
//! checkpoints consistent: a checkpoint taken at a level boundary describes a
//! prefix of the run that never needs repeating.
//!
//! # Execution flow
//!
//! 1. Validate the definition and build the dependency graph (synchronous;
//!    failures here return an error before any record is created).
//! 2. Create the execution record and context, then spawn the run task and
//!    hand back an [`ExecutionHandle`].
//! 3. For each level: spawn all pending steps, render their prompts against
//!    the accumulated context, apply per-step timeout and retry policy.
//! 4. At the level boundary: merge outputs into the context, persist it,
//!    honor pause/cancel requests, and checkpoint if due.
//! 5. Settle into a terminal state (or `Paused`) and publish lifecycle events.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::event::{EventRecord, WorkflowEvent};
use weft_types::execution::{
    Execution, ExecutionState, Priority, StepExecution, StepState, StepWarning,
};
use weft_types::workflow::{RetryPolicy, StepDefinition, WorkflowDefinition};

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;

use super::checkpoint::{CheckpointError, CheckpointService};
use super::context::ExecutionContext;
use super::definition::{ensure_valid, WorkflowError};
use super::graph::DependencyGraph;
use super::retry::RetryHandler;
use super::state::{ExecutionStateMachine, InvalidTransition};
use super::step::{StepError, StepExecutor};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default step-level timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Options and result
// ---------------------------------------------------------------------------

/// Caller-supplied options for starting an execution.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Who or what requested this run (e.g. "manual", "api", "schedule").
    pub trigger: String,
    /// Scheduling priority, recorded on the execution.
    pub priority: Priority,
    /// Variables available to prompts under the `vars` namespace.
    pub variables: HashMap<String, Value>,
    /// Payload available to prompts under the `trigger` namespace.
    pub trigger_payload: Option<Value>,
    /// Parent execution for nested runs.
    pub parent_execution_id: Option<Uuid>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            trigger: "manual".to_string(),
            priority: Priority::Normal,
            variables: HashMap::new(),
            trigger_payload: None,
            parent_execution_id: None,
        }
    }
}

/// Final (or paused) outcome of a workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    /// The execution ID.
    pub execution_id: Uuid,
    /// State the run settled in: `Completed`, `Failed`, `Cancelled`, or
    /// `Paused`.
    pub state: ExecutionState,
    /// Accumulated context (step outputs, variables).
    pub context: ExecutionContext,
    /// Keys of steps that completed.
    pub completed_steps: Vec<String>,
    /// Warnings from optional or tolerated step failures.
    pub warnings: Vec<StepWarning>,
    /// Error message if the run failed.
    pub error: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run settled (None while paused).
    pub completed_at: Option<DateTime<Utc>>,
}

/// Handle to a running execution.
///
/// Returned by [`WorkflowEngine::execute`] and [`WorkflowEngine::resume`] as
/// soon as the run is admitted; the run itself proceeds on a spawned task.
/// Pause, cancel, and status requests can target `execution_id` while the
/// run is in flight, and `wait` yields the settled result.
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: Uuid,
    task: tokio::task::JoinHandle<Result<WorkflowResult, EngineError>>,
}

impl ExecutionHandle {
    /// ID of the execution this handle tracks.
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Await the settled result of the run.
    pub async fn wait(self) -> Result<WorkflowResult, EngineError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Join(e.to_string())),
        }
    }
}

/// Point-in-time status of an execution, with step counts.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    /// The persisted execution row.
    pub execution: Execution,
    /// Total number of steps in the workflow definition (falls back to the
    /// number of step log rows when the definition is not in the repository).
    pub total_steps: usize,
    /// Steps that have completed successfully.
    pub completed_steps: usize,
    /// Steps that have failed (including tolerated failures).
    pub failed_steps: usize,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while driving a workflow execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Workflow-level error (definition, graph, template).
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Checkpoint persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Illegal execution state transition.
    #[error(transparent)]
    State(#[from] InvalidTransition),

    /// Persistence failure. Fatal: the engine never continues a run whose
    /// state it cannot record.
    #[error("repository error: {0}")]
    Repository(String),

    /// Execution not found (for pause/resume/cancel/status).
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Workflow definition not found in the repository (for resume).
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    /// The execution is not currently running in this engine.
    #[error("execution {0} is not active")]
    NotActive(Uuid),

    /// The execution cannot be resumed from its current state.
    #[error("execution {execution_id} cannot be resumed from state {state:?}")]
    NotResumable {
        execution_id: Uuid,
        state: ExecutionState,
    },

    /// A spawned step task panicked or was aborted unexpectedly.
    #[error("step task join error: {0}")]
    Join(String),
}

fn repo_err(e: weft_types::error::RepositoryError) -> EngineError {
    EngineError::Repository(e.to_string())
}

// ---------------------------------------------------------------------------
// Internal run plumbing
// ---------------------------------------------------------------------------

/// How the level loop ended.
enum RunOutcome {
    /// Every level ran to the end.
    Finished,
    /// A cancel request was honored.
    Cancelled,
    /// A pause request was honored at a level boundary.
    Paused { checkpoint_id: Uuid },
    /// A required step failed (or the workflow timed out).
    Failed { error: String },
}

/// Settled result of a single spawned step task.
struct StepOutcome {
    step_key: String,
    optional: bool,
    result: Result<Value, String>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Level-by-level workflow engine.
///
/// Generic over the storage backend `R` and the step executor `E`, so the
/// same engine runs against SQLite in production and in-memory scripted
/// mocks in tests. The engine is cheap to clone; clones share the same run
/// registry, so a pause issued through one clone reaches a run started
/// through another.
pub struct WorkflowEngine<R: WorkflowRepository, E: StepExecutor> {
    inner: Arc<EngineInner<R, E>>,
}

impl<R: WorkflowRepository, E: StepExecutor> Clone for WorkflowEngine<R, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<R: WorkflowRepository, E: StepExecutor> {
    repo: Arc<R>,
    executor: Arc<E>,
    checkpoints: CheckpointService<R>,
    event_bus: EventBus,
    /// Cancellation tokens keyed by execution ID.
    cancel_tokens: DashMap<Uuid, CancellationToken>,
    /// Pause request flags keyed by execution ID. Honored at level boundaries.
    pause_tokens: DashMap<Uuid, CancellationToken>,
}

impl<R, E> WorkflowEngine<R, E>
where
    R: WorkflowRepository + 'static,
    E: StepExecutor,
{
    pub fn new(repo: Arc<R>, executor: Arc<E>, event_bus: EventBus) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                checkpoints: CheckpointService::new(Arc::clone(&repo)),
                repo,
                executor,
                event_bus,
                cancel_tokens: DashMap::new(),
                pause_tokens: DashMap::new(),
            }),
        }
    }

    /// Access the checkpoint service (for inspection and manual snapshots).
    pub fn checkpoints(&self) -> &CheckpointService<R> {
        &self.inner.checkpoints
    }

    /// Subscribe to lifecycle events of all runs on this engine.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.inner.event_bus.subscribe()
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Execute a workflow definition from the beginning.
    ///
    /// Validation and graph resolution happen synchronously: an invalid or
    /// cyclic definition is rejected with an `Err` before any record is
    /// created. A valid run is admitted, spawned onto its own task, and an
    /// [`ExecutionHandle`] is returned immediately. Step-level failures are
    /// reported through the awaited result, not as an `Err`; `Err` from
    /// `wait` means the engine itself could not make progress.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle, EngineError> {
        let mut sm = ExecutionStateMachine::new();

        sm.transition(ExecutionState::Parsing)?;
        sm.transition(ExecutionState::Validating)?;
        if let Err(e) = ensure_valid(definition) {
            sm.transition(ExecutionState::Failed)?;
            return Err(e.into());
        }

        sm.transition(ExecutionState::BuildingGraph)?;
        let graph = DependencyGraph::build(definition)?;

        sm.transition(ExecutionState::Scheduling)?;
        let execution_id = Uuid::now_v7();
        let mut context = ExecutionContext::new(execution_id, &definition.name);
        context.variables = options.variables;
        context.trigger_payload = options.trigger_payload;

        let started_at = Utc::now();
        let execution = Execution {
            id: execution_id,
            workflow_name: definition.name.clone(),
            workflow_version: definition.version.clone(),
            state: sm.current(),
            context: context_json(&context)?,
            priority: options.priority,
            trigger: options.trigger.clone(),
            parent_execution_id: options.parent_execution_id,
            started_at,
            completed_at: None,
            error: None,
            resume_count: 0,
        };
        self.inner
            .repo
            .create_execution(&execution)
            .await
            .map_err(repo_err)?;

        self.inner
            .record_event(&WorkflowEvent::WorkflowStarted {
                execution_id,
                workflow_name: definition.name.clone(),
                trigger: options.trigger.clone(),
            })
            .await?;

        tracing::info!(
            execution_id = %execution_id,
            workflow = definition.name.as_str(),
            steps = definition.steps.len(),
            levels = graph.levels.len(),
            "starting workflow execution"
        );

        let cancel = CancellationToken::new();
        let pause = CancellationToken::new();
        self.inner.cancel_tokens.insert(execution_id, cancel.clone());
        self.inner.pause_tokens.insert(execution_id, pause.clone());

        let inner = Arc::clone(&self.inner);
        let definition = definition.clone();
        let task = tokio::spawn(async move {
            inner
                .run(
                    definition,
                    graph,
                    execution_id,
                    sm,
                    context,
                    BTreeSet::new(),
                    Vec::new(),
                    cancel,
                    pause,
                    started_at,
                )
                .await
        });

        Ok(ExecutionHandle { execution_id, task })
    }

    /// Resume an execution from a specific checkpoint.
    ///
    /// Restores the checkpointed context verbatim and skips every step the
    /// checkpoint recorded as completed. Warnings from tolerated failures
    /// before the checkpoint are rebuilt from the step log. Like `execute`,
    /// this returns an [`ExecutionHandle`] once the run is admitted.
    pub async fn resume(&self, checkpoint_id: Uuid) -> Result<ExecutionHandle, EngineError> {
        let checkpoint = self.inner.checkpoints.load(&checkpoint_id).await?;
        let execution_id = checkpoint.execution_id;

        let execution = self
            .inner
            .repo
            .get_execution(&execution_id)
            .await
            .map_err(repo_err)?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        if execution.state.is_terminal() {
            return Err(EngineError::NotResumable {
                execution_id,
                state: execution.state,
            });
        }

        let definition = self
            .inner
            .repo
            .get_definition(&execution.workflow_name)
            .await
            .map_err(repo_err)?
            .ok_or_else(|| EngineError::DefinitionNotFound(execution.workflow_name.clone()))?;
        let graph = DependencyGraph::build(&definition)?;

        let context = CheckpointService::<R>::restore_context(&checkpoint)?;
        let completed = checkpoint.completed_steps.clone();

        // Tolerated failures from before the checkpoint are carried forward
        // so the final result still reports them.
        let warnings: Vec<StepWarning> = self
            .inner
            .repo
            .list_step_executions(&execution_id)
            .await
            .map_err(repo_err)?
            .into_iter()
            .filter(|s| matches!(s.state, StepState::Failed | StepState::Skipped))
            .map(|s| StepWarning {
                step_key: s.step_key,
                message: s.error.unwrap_or_default(),
            })
            .collect();

        let mut sm = ExecutionStateMachine::from_state(ExecutionState::Paused);
        sm.transition(ExecutionState::RestoringCheckpoint)?;
        self.inner
            .repo
            .increment_resume_count(&execution_id)
            .await
            .map_err(repo_err)?;

        self.inner
            .record_event(&WorkflowEvent::ExecutionResumed {
                execution_id,
                checkpoint_id: checkpoint.id,
                resume_count: execution.resume_count + 1,
                skipped_steps: completed.len() as u32,
            })
            .await?;

        tracing::info!(
            execution_id = %execution_id,
            workflow = definition.name.as_str(),
            checkpoint_id = %checkpoint.id,
            skipping = completed.len(),
            "resuming workflow execution"
        );

        let cancel = CancellationToken::new();
        let pause = CancellationToken::new();
        self.inner.cancel_tokens.insert(execution_id, cancel.clone());
        self.inner.pause_tokens.insert(execution_id, pause.clone());

        let inner = Arc::clone(&self.inner);
        let started_at = execution.started_at;
        let task = tokio::spawn(async move {
            inner
                .run(
                    definition,
                    graph,
                    execution_id,
                    sm,
                    context,
                    completed,
                    warnings,
                    cancel,
                    pause,
                    started_at,
                )
                .await
        });

        Ok(ExecutionHandle { execution_id, task })
    }

    /// Request a pause. Honored at the next level boundary, after which the
    /// run settles in `Paused` with a fresh checkpoint.
    pub fn pause(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let token = self
            .inner
            .pause_tokens
            .get(&execution_id)
            .ok_or(EngineError::NotActive(execution_id))?;
        token.cancel();
        tracing::info!(execution_id = %execution_id, "pause requested");
        Ok(())
    }

    /// Cancel an execution. In-flight steps are allowed to finish but their
    /// results are discarded; no new steps are dispatched.
    ///
    /// Running executions are cancelled cooperatively; a paused execution is
    /// moved to `Cancelled` directly.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        if let Some(token) = self.inner.cancel_tokens.get(&execution_id) {
            token.cancel();
            tracing::info!(execution_id = %execution_id, "cancel requested");
            return Ok(());
        }

        let execution = self
            .inner
            .repo
            .get_execution(&execution_id)
            .await
            .map_err(repo_err)?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        if execution.state != ExecutionState::Paused {
            return Err(EngineError::NotActive(execution_id));
        }

        self.inner
            .repo
            .update_execution_state(
                &execution_id,
                ExecutionState::Cancelled,
                Some("cancelled while paused"),
                None,
            )
            .await
            .map_err(repo_err)?;
        self.inner
            .record_event(&WorkflowEvent::ExecutionCancelled { execution_id })
            .await?;
        self.inner.checkpoints.forget(&execution_id);
        Ok(())
    }

    /// Current persisted state of an execution, with step counts.
    pub async fn status(&self, execution_id: Uuid) -> Result<ExecutionSummary, EngineError> {
        let execution = self
            .inner
            .repo
            .get_execution(&execution_id)
            .await
            .map_err(repo_err)?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        let steps = self
            .inner
            .repo
            .list_step_executions(&execution_id)
            .await
            .map_err(repo_err)?;
        let completed_steps = steps
            .iter()
            .filter(|s| s.state == StepState::Completed)
            .count();
        let failed_steps = steps.iter().filter(|s| s.state == StepState::Failed).count();

        let total_steps = match self
            .inner
            .repo
            .get_definition(&execution.workflow_name)
            .await
            .map_err(repo_err)?
        {
            Some(def) => def.steps.len(),
            None => steps.len(),
        };

        Ok(ExecutionSummary {
            execution,
            total_steps,
            completed_steps,
            failed_steps,
        })
    }
}

// ---------------------------------------------------------------------------
// Run task
// ---------------------------------------------------------------------------

impl<R, E> EngineInner<R, E>
where
    R: WorkflowRepository + 'static,
    E: StepExecutor,
{
    /// Body of the spawned run task: drive all levels, then settle.
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        definition: WorkflowDefinition,
        graph: DependencyGraph,
        execution_id: Uuid,
        mut sm: ExecutionStateMachine,
        mut context: ExecutionContext,
        mut completed: BTreeSet<String>,
        mut warnings: Vec<StepWarning>,
        cancel: CancellationToken,
        pause: CancellationToken,
        started_at: DateTime<Utc>,
    ) -> Result<WorkflowResult, EngineError> {
        let run_start = std::time::Instant::now();

        let outcome = self
            .drive(
                &definition,
                &graph,
                execution_id,
                &mut sm,
                &mut context,
                &mut completed,
                &mut warnings,
                &cancel,
                &pause,
            )
            .await;

        self.cancel_tokens.remove(&execution_id);
        self.pause_tokens.remove(&execution_id);

        let outcome = outcome?;
        self.settle(
            &definition, execution_id, &mut sm, context, completed, warnings, outcome,
            started_at, run_start,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Level loop
    // -----------------------------------------------------------------------

    /// Run all levels under the workflow-level timeout.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
        execution_id: Uuid,
        sm: &mut ExecutionStateMachine,
        context: &mut ExecutionContext,
        completed: &mut BTreeSet<String>,
        warnings: &mut Vec<StepWarning>,
        cancel: &CancellationToken,
        pause: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let workflow_timeout = Duration::from_secs(definition.config.timeout_secs);
        let levels: Vec<Vec<StepDefinition>> = graph
            .levels
            .iter()
            .map(|level| {
                level
                    .iter()
                    .filter_map(|key| definition.step(key).cloned())
                    .collect()
            })
            .collect();

        match tokio::time::timeout(
            workflow_timeout,
            self.run_levels(
                definition, &levels, graph, execution_id, sm, context, completed, warnings,
                cancel, pause,
            ),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Ok(RunOutcome::Failed {
                error: format!(
                    "workflow timed out after {}s",
                    definition.config.timeout_secs
                ),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_levels(
        &self,
        definition: &WorkflowDefinition,
        levels: &[Vec<StepDefinition>],
        graph: &DependencyGraph,
        execution_id: Uuid,
        sm: &mut ExecutionStateMachine,
        context: &mut ExecutionContext,
        completed: &mut BTreeSet<String>,
        warnings: &mut Vec<StepWarning>,
        cancel: &CancellationToken,
        pause: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let all_keys: BTreeSet<String> = graph.nodes.keys().cloned().collect();
        let semaphore = Arc::new(Semaphore::new(definition.config.parallelism));
        let checkpoint_interval = Duration::from_secs(definition.config.checkpoint_interval_secs);

        for (level_idx, level) in levels.iter().enumerate() {
            sm.transition(ExecutionState::Executing)?;

            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            if pause.is_cancelled() {
                return self
                    .pause_here(sm, context, completed, &all_keys, level_idx)
                    .await;
            }

            tracing::debug!(
                execution_id = %execution_id,
                level = level_idx,
                steps = level.len(),
                "processing level"
            );

            let mut join_set: JoinSet<Result<StepOutcome, EngineError>> = JoinSet::new();
            let mut level_error: Option<String> = None;

            for step in level {
                // Skip steps already completed (resume path).
                if completed.contains(&step.key) {
                    tracing::debug!(step_key = step.key.as_str(), "skipping completed step");
                    continue;
                }

                // Prompts are rendered sequentially against the context as it
                // stood at the end of the previous level.
                let prompt = match context.render_template(&step.prompt) {
                    Ok(prompt) => prompt,
                    Err(e) => {
                        let message = e.to_string();
                        self.record_step_skipped(execution_id, step, &message).await?;
                        if step.optional || definition.config.continue_on_error {
                            warnings.push(StepWarning {
                                step_key: step.key.clone(),
                                message,
                            });
                            continue;
                        }
                        level_error = Some(format!("step '{}' failed: {message}", step.key));
                        break;
                    }
                };

                self.spawn_step(
                    &mut join_set,
                    definition,
                    step.clone(),
                    prompt,
                    execution_id,
                    Arc::clone(&semaphore),
                    cancel.clone(),
                );
            }

            sm.transition(ExecutionState::AwaitingCompletion)?;

            // Level barrier: drain every spawned step before moving on, even
            // when one of them has already failed.
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        // Cooperative cancel: in-flight steps run to their
                        // natural end, but every result is discarded. Steps
                        // still queued on the semaphore observe the token and
                        // return without dispatching.
                        while join_set.join_next().await.is_some() {}
                        return Ok(RunOutcome::Cancelled);
                    }
                    next = join_set.join_next() => {
                        let Some(joined) = next else { break };
                        let outcome = joined.map_err(|e| EngineError::Join(e.to_string()))??;
                        match outcome.result {
                            Ok(output) => match context.set_step_output(&outcome.step_key, output) {
                                Ok(()) => {
                                    completed.insert(outcome.step_key);
                                }
                                Err(e) => {
                                    let message = e.to_string();
                                    if outcome.optional || definition.config.continue_on_error {
                                        warnings.push(StepWarning {
                                            step_key: outcome.step_key,
                                            message,
                                        });
                                    } else if level_error.is_none() {
                                        level_error = Some(format!(
                                            "step '{}' failed: {message}",
                                            outcome.step_key
                                        ));
                                    }
                                }
                            },
                            Err(message) => {
                                if outcome.optional || definition.config.continue_on_error {
                                    warnings.push(StepWarning {
                                        step_key: outcome.step_key,
                                        message,
                                    });
                                } else if level_error.is_none() {
                                    level_error = Some(format!(
                                        "step '{}' failed: {message}",
                                        outcome.step_key
                                    ));
                                }
                            }
                        }
                    }
                }
            }

            if let Some(error) = level_error {
                return Ok(RunOutcome::Failed { error });
            }

            // Persist the merged context at the level boundary.
            self.repo
                .update_execution_state(
                    &execution_id,
                    sm.current(),
                    None,
                    Some(&context_json(context)?),
                )
                .await
                .map_err(repo_err)?;

            if pause.is_cancelled() {
                return self
                    .pause_here(sm, context, completed, &all_keys, level_idx + 1)
                    .await;
            }

            // Automatic checkpoint, gated by the configured interval. Losing
            // one costs replay work on resume, not correctness, so a failure
            // here never aborts the run.
            sm.transition(ExecutionState::CreatingCheckpoint)?;
            let pending: BTreeSet<String> = all_keys.difference(completed).cloned().collect();
            if let Err(e) = self
                .checkpoints
                .create_if_due(
                    context,
                    sm.current(),
                    completed.clone(),
                    pending,
                    &format!("after level {level_idx}"),
                    checkpoint_interval,
                )
                .await
            {
                tracing::error!(
                    execution_id = %execution_id,
                    level = level_idx,
                    error = %e,
                    "automatic checkpoint failed, continuing"
                );
            }
            sm.transition(ExecutionState::AwaitingCompletion)?;
        }

        Ok(RunOutcome::Finished)
    }

    /// Checkpoint and settle into `Paused` at a level boundary.
    ///
    /// Unlike automatic checkpoints, the pre-pause checkpoint must succeed:
    /// a pause without a snapshot would have nothing to resume from.
    async fn pause_here(
        &self,
        sm: &mut ExecutionStateMachine,
        context: &ExecutionContext,
        completed: &BTreeSet<String>,
        all_keys: &BTreeSet<String>,
        next_level: usize,
    ) -> Result<RunOutcome, EngineError> {
        sm.transition(ExecutionState::CreatingCheckpoint)?;
        let pending: BTreeSet<String> = all_keys.difference(completed).cloned().collect();
        let checkpoint = self
            .checkpoints
            .create(
                context,
                ExecutionState::Paused,
                completed.clone(),
                pending,
                &format!("pause before level {next_level}"),
                "engine",
            )
            .await?;
        sm.transition(ExecutionState::Paused)?;
        Ok(RunOutcome::Paused {
            checkpoint_id: checkpoint.id,
        })
    }

    /// Spawn one step task: semaphore permit, prompt dispatch, per-step
    /// timeout, and the retry loop.
    fn spawn_step(
        &self,
        join_set: &mut JoinSet<Result<StepOutcome, EngineError>>,
        definition: &WorkflowDefinition,
        step: StepDefinition,
        prompt: String,
        execution_id: Uuid,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) {
        let executor = Arc::clone(&self.executor);
        let repo = Arc::clone(&self.repo);
        let bus = self.event_bus.clone();
        let policy = step.retry.clone().unwrap_or(RetryPolicy {
            max_retries: definition.config.max_retries,
            ..RetryPolicy::default()
        });
        let step_timeout =
            Duration::from_secs(step.timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS));

        join_set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Join(e.to_string()))?;
            if cancel.is_cancelled() {
                return Ok(StepOutcome {
                    step_key: step.key.clone(),
                    optional: step.optional,
                    result: Err("cancelled".to_string()),
                });
            }

            let record_id = Uuid::now_v7();
            repo.create_step_execution(&StepExecution {
                id: record_id,
                execution_id,
                step_key: step.key.clone(),
                state: StepState::Running,
                attempt: 1,
                retry_count: 0,
                input: Some(prompt.clone()),
                output: None,
                error: None,
                started_at: Some(Utc::now()),
                completed_at: None,
            })
            .await
            .map_err(repo_err)?;

            let handler = RetryHandler::new(policy);
            let mut retry_count: u32 = 0;
            let started = std::time::Instant::now();

            loop {
                bus.publish(WorkflowEvent::StepStarted {
                    execution_id,
                    step_key: step.key.clone(),
                    agent: step.agent.clone(),
                    attempt: retry_count + 1,
                });

                let result = match tokio::time::timeout(
                    step_timeout,
                    executor.execute(&step, &prompt, step_timeout),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(StepError::Timeout(step_timeout)),
                };

                match result {
                    Ok(output) => {
                        repo.update_step_execution(
                            &record_id,
                            StepState::Completed,
                            Some(&output),
                            None,
                            retry_count,
                        )
                        .await
                        .map_err(repo_err)?;

                        let event = WorkflowEvent::StepCompleted {
                            execution_id,
                            step_key: step.key.clone(),
                            duration_ms: started.elapsed().as_millis() as u64,
                            retry_count,
                        };
                        bus.publish(event.clone());
                        repo.append_event(&EventRecord::from_event(&event))
                            .await
                            .map_err(repo_err)?;

                        return Ok(StepOutcome {
                            step_key: step.key.clone(),
                            optional: step.optional,
                            result: Ok(output),
                        });
                    }
                    Err(err) => {
                        if err.is_retryable() && handler.should_retry(retry_count) {
                            let delay = handler.backoff_delay(retry_count);
                            tracing::warn!(
                                execution_id = %execution_id,
                                step_key = step.key.as_str(),
                                retry_count,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "step failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            retry_count += 1;
                            repo.update_step_execution(
                                &record_id,
                                StepState::Running,
                                None,
                                Some(&err.to_string()),
                                retry_count,
                            )
                            .await
                            .map_err(repo_err)?;
                            continue;
                        }

                        let message = err.to_string();
                        repo.update_step_execution(
                            &record_id,
                            StepState::Failed,
                            None,
                            Some(&message),
                            retry_count,
                        )
                        .await
                        .map_err(repo_err)?;

                        let event = WorkflowEvent::StepFailed {
                            execution_id,
                            step_key: step.key.clone(),
                            error: message.clone(),
                            optional: step.optional,
                        };
                        bus.publish(event.clone());
                        repo.append_event(&EventRecord::from_event(&event))
                            .await
                            .map_err(repo_err)?;

                        return Ok(StepOutcome {
                            step_key: step.key.clone(),
                            optional: step.optional,
                            result: Err(message),
                        });
                    }
                }
            }
        });
    }

    /// Record a step that never dispatched (template failure) as failed.
    async fn record_step_skipped(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
        error: &str,
    ) -> Result<(), EngineError> {
        self.repo
            .create_step_execution(&StepExecution {
                id: Uuid::now_v7(),
                execution_id,
                step_key: step.key.clone(),
                state: StepState::Failed,
                attempt: 0,
                retry_count: 0,
                input: None,
                output: None,
                error: Some(error.to_string()),
                started_at: Some(Utc::now()),
                completed_at: Some(Utc::now()),
            })
            .await
            .map_err(repo_err)?;

        let event = WorkflowEvent::StepFailed {
            execution_id,
            step_key: step.key.clone(),
            error: error.to_string(),
            optional: step.optional,
        };
        self.record_event(&event).await
    }

    // -----------------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------------

    /// Persist the outcome, publish lifecycle events, and build the result.
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        definition: &WorkflowDefinition,
        execution_id: Uuid,
        sm: &mut ExecutionStateMachine,
        context: ExecutionContext,
        completed: BTreeSet<String>,
        warnings: Vec<StepWarning>,
        outcome: RunOutcome,
        started_at: DateTime<Utc>,
        run_start: std::time::Instant,
    ) -> Result<WorkflowResult, EngineError> {
        let context_value = context_json(&context)?;

        let (state, error) = match outcome {
            RunOutcome::Finished => {
                sm.transition(ExecutionState::AggregatingResults)?;
                sm.transition(ExecutionState::Completed)?;
                self.record_event(&WorkflowEvent::WorkflowCompleted {
                    execution_id,
                    workflow_name: definition.name.clone(),
                    duration_ms: run_start.elapsed().as_millis() as u64,
                    steps_completed: completed.len() as u32,
                    warnings: warnings.len() as u32,
                })
                .await?;
                (ExecutionState::Completed, None)
            }
            RunOutcome::Failed { error } => {
                sm.transition(ExecutionState::Failed)?;
                self.record_event(&WorkflowEvent::WorkflowFailed {
                    execution_id,
                    workflow_name: definition.name.clone(),
                    error: error.clone(),
                })
                .await?;
                (ExecutionState::Failed, Some(error))
            }
            RunOutcome::Cancelled => {
                sm.transition(ExecutionState::Cancelled)?;
                self.record_event(&WorkflowEvent::ExecutionCancelled { execution_id })
                    .await?;
                (ExecutionState::Cancelled, Some("cancelled".to_string()))
            }
            RunOutcome::Paused { checkpoint_id } => {
                self.record_event(&WorkflowEvent::ExecutionPaused {
                    execution_id,
                    checkpoint_id,
                })
                .await?;
                (ExecutionState::Paused, None)
            }
        };

        self.repo
            .update_execution_state(&execution_id, state, error.as_deref(), Some(&context_value))
            .await
            .map_err(repo_err)?;

        if state.is_terminal() {
            self.checkpoints.forget(&execution_id);
        }

        tracing::info!(
            execution_id = %execution_id,
            workflow = definition.name.as_str(),
            state = ?state,
            completed = completed.len(),
            warnings = warnings.len(),
            duration_ms = run_start.elapsed().as_millis() as u64,
            "workflow execution settled"
        );

        Ok(WorkflowResult {
            execution_id,
            state,
            context,
            completed_steps: completed.into_iter().collect(),
            warnings,
            error,
            started_at,
            completed_at: state.is_terminal().then(Utc::now),
        })
    }

    /// Publish an event to the bus and append it to the durable log.
    async fn record_event(&self, event: &WorkflowEvent) -> Result<(), EngineError> {
        self.event_bus.publish(event.clone());
        self.repo
            .append_event(&EventRecord::from_event(event))
            .await
            .map_err(repo_err)
    }
}

fn context_json(context: &ExecutionContext) -> Result<Value, EngineError> {
    serde_json::to_value(context)
        .map_err(|e| EngineError::Workflow(WorkflowError::Execution(e.to_string())))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
