//! Workflow runner: sequential, fail-fast execution of one run.
//!
//! `WorkflowRunner` owns the run lifecycle `Pending -> Running ->
//! {Completed, Failed}`. Top-level steps run strictly in order, each one
//! validated immediately before it executes. `for_each` steps are expanded
//! here so that every child execution lands in the run log as its own entry,
//! tagged with the parent step id and the 0-based iteration.
//!
//! # Execution flow
//!
//! 1. Acquire the per-workflow run lock (skip or queue on overlap).
//! 2. Record the `running` run and seed the variable store with the trigger payload.
//! 3. For each top-level step: bump `steps_completed`, validate, execute,
//!    append a log entry, and bind `result_variable` on success.
//! 4. Stop at the first failure; finalize the run exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use stratum_types::config::{EngineSettings, OverlapPolicy};
use stratum_types::workflow::{
    ExecutionRun, RunStatus, StepConfig, StepDefinition, StepLogEntry, TriggerSource,
    WorkflowDefinition,
};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::workflow::{RunFinalization, WorkflowRepository};

use super::definition::validate_step;
use super::recorder::{RecorderError, RunRecorder};
use super::step_runner::{StepError, StepExecutionContext, StepRunner};
use super::template::resolve_list;
use super::variables::{VariableStore, truncate_output};

/// Failure message of a run stopped through [`WorkflowRunner::cancel`].
pub const CANCELLED_MESSAGE: &str = "run cancelled";

/// Failure message of a run that outlived `run_timeout_secs`.
pub const TIMEOUT_MESSAGE: &str = "run exceeded timeout";

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    /// `Completed` or `Failed`.
    pub status: RunStatus,
    pub steps_completed: u32,
    pub duration_ms: u64,
    pub result_data: Option<Value>,
    pub error: Option<String>,
}

/// Holds the workflow's run lock until dropped.
pub struct RunGuard {
    _guard: OwnedMutexGuard<()>,
}

/// A claim on a workflow's run lock, taken without waiting.
///
/// Either the lock is already held, or the claim owns the workflow's single
/// waiting slot until [`acquire`](Self::acquire) gets the lock.
pub struct LockReservation {
    lock: Arc<Mutex<()>>,
    ready: Option<OwnedMutexGuard<()>>,
    _waiting: Option<OwnedSemaphorePermit>,
}

impl LockReservation {
    /// Wait for the run lock. Returns at once if it was free when reserved.
    pub async fn acquire(self) -> RunGuard {
        let guard = match self.ready {
            Some(guard) => guard,
            None => self.lock.lock_owned().await,
        };
        RunGuard { _guard: guard }
    }
}

/// A run that is recorded as `running` but has not executed any step yet.
pub struct PreparedRun {
    run: ExecutionRun,
    token: CancellationToken,
    _guard: RunGuard,
}

impl PreparedRun {
    pub fn run_id(&self) -> Uuid {
        self.run.id
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Mutable state of one run while its steps execute.
struct Execution {
    run_id: Uuid,
    store: VariableStore,
    token: CancellationToken,
    deadline: tokio::time::Instant,
}

/// Where a child entry sits inside a `for_each`.
#[derive(Clone)]
struct LoopPosition {
    parent_step: String,
    iteration: u32,
}

/// The step whose failure ends the run.
struct StepFailure {
    step: String,
    error: StepError,
    /// Cancellation or timeout rather than a step-level error.
    interrupted: bool,
}

impl StepFailure {
    fn run_message(&self) -> String {
        if self.interrupted {
            self.error.to_string()
        } else {
            format!("step '{}' failed: {}", self.step, self.error)
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

/// Executes workflow runs against a repository and an execution context.
///
/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct WorkflowRunner<R: WorkflowRepository> {
    recorder: Arc<RunRecorder<R>>,
    step_runner: StepRunner,
    ctx: Arc<dyn StepExecutionContext>,
    settings: EngineSettings,
    /// At most one active run per workflow id.
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// One waiting slot per workflow id under the `Queue` policy.
    queue_slots: DashMap<Uuid, Arc<Semaphore>>,
    /// Cancellation tokens keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<R: WorkflowRepository + 'static> WorkflowRunner<R> {
    pub fn new(repo: R, ctx: Arc<dyn StepExecutionContext>, settings: EngineSettings) -> Self {
        Self {
            recorder: Arc::new(RunRecorder::new(repo)),
            step_runner: StepRunner::new(),
            ctx,
            settings,
            run_locks: DashMap::new(),
            queue_slots: DashMap::new(),
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn recorder(&self) -> &RunRecorder<R> {
        &self.recorder
    }

    pub fn repo(&self) -> &R {
        self.recorder.repo()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Acquire the run lock for a workflow.
    ///
    /// Under `Skip` an active run makes this fail with `AlreadyRunning`;
    /// under `Queue` it waits for the active run to finish.
    pub async fn acquire_run_lock(
        &self,
        def: &WorkflowDefinition,
    ) -> Result<RunGuard, ExecutorError> {
        Ok(self.reserve_run_lock(def)?.acquire().await)
    }

    /// Claim the run lock without waiting.
    ///
    /// A free lock is taken at once. Otherwise `Skip` fails with
    /// `AlreadyRunning`, and `Queue` takes the workflow's single waiting
    /// slot, failing with `QueueFull` when another run already holds it.
    pub fn reserve_run_lock(
        &self,
        def: &WorkflowDefinition,
    ) -> Result<LockReservation, ExecutorError> {
        let lock = self
            .run_locks
            .entry(def.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        if let Ok(guard) = Arc::clone(&lock).try_lock_owned() {
            return Ok(LockReservation {
                lock,
                ready: Some(guard),
                _waiting: None,
            });
        }

        match self.settings.overlap_policy {
            OverlapPolicy::Skip => Err(ExecutorError::AlreadyRunning(def.name.clone())),
            OverlapPolicy::Queue => {
                let slot = self
                    .queue_slots
                    .entry(def.id)
                    .or_insert_with(|| Arc::new(Semaphore::new(1)))
                    .clone();
                let permit = slot
                    .try_acquire_owned()
                    .map_err(|_| ExecutorError::QueueFull(def.name.clone()))?;
                tracing::debug!(workflow = def.name.as_str(), "run queued behind active run");
                Ok(LockReservation {
                    lock,
                    ready: None,
                    _waiting: Some(permit),
                })
            }
        }
    }

    /// Whether a run of the workflow holds its lock right now.
    pub fn is_running(&self, workflow_id: &Uuid) -> bool {
        self.run_locks
            .get(workflow_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Record a new `running` run without executing it.
    pub async fn prepare(
        &self,
        run_id: Uuid,
        def: &WorkflowDefinition,
        source: TriggerSource,
        payload: Value,
        guard: RunGuard,
    ) -> Result<PreparedRun, ExecutorError> {
        if def.steps.is_empty() {
            return Err(ExecutorError::EmptyWorkflow(def.name.clone()));
        }

        let run = ExecutionRun {
            id: run_id,
            workflow_id: def.id,
            workflow_name: def.name.clone(),
            status: RunStatus::Running,
            trigger_source: source,
            trigger_payload: payload,
            started_at: Utc::now(),
            completed_at: None,
            execution_duration_ms: None,
            steps_completed: 0,
            execution_log: Vec::new(),
            result_data: None,
            error_message: None,
        };
        self.recorder.start_run(&run).await.inspect_err(|e| {
            tracing::error!(run_id = %run_id, error = %e, "failed to record run start");
        })?;

        let token = CancellationToken::new();
        self.cancellation_tokens.insert(run_id, token.clone());

        Ok(PreparedRun {
            run,
            token,
            _guard: guard,
        })
    }

    /// Execute a prepared run to completion and finalize it.
    pub async fn run_prepared(
        &self,
        def: &WorkflowDefinition,
        prepared: PreparedRun,
    ) -> Result<RunOutcome, ExecutorError> {
        let PreparedRun { run, token, _guard } = prepared;
        let run_id = run.id;

        let mut store = VariableStore::new(def.name.clone(), run_id);
        store.seed_trigger(&run.trigger_payload);
        let mut exec = Execution {
            run_id,
            store,
            token,
            deadline: tokio::time::Instant::now()
                + Duration::from_secs(self.settings.run_timeout_secs),
        };

        tracing::info!(
            run_id = %run_id,
            workflow = def.name.as_str(),
            trigger = %run.trigger_source,
            "starting workflow run"
        );

        let run_start = Instant::now();
        let mut steps_completed = 0u32;
        let mut failure = None;
        for step in &def.steps {
            steps_completed += 1;
            if let Err(f) = self.progress(run_id, step, steps_completed).await {
                failure = Some(f);
                break;
            }
            if let Err(f) = self.run_step(step, &mut exec, None).await {
                failure = Some(f);
                break;
            }
        }

        self.cancellation_tokens.remove(&run_id);
        let duration_ms = run_start.elapsed().as_millis() as u64;

        let outcome = match failure {
            None => RunOutcome {
                run_id,
                status: RunStatus::Completed,
                steps_completed,
                duration_ms,
                result_data: Some(exec.store.snapshot()),
                error: None,
            },
            Some(f) => RunOutcome {
                run_id,
                status: RunStatus::Failed,
                steps_completed,
                duration_ms,
                result_data: None,
                error: Some(f.run_message()),
            },
        };

        let fin = RunFinalization {
            status: outcome.status,
            completed_at: Utc::now(),
            duration_ms,
            steps_completed,
            result_data: outcome.result_data.clone(),
            error_message: outcome.error.clone(),
        };
        self.recorder.finalize(run_id, &fin).await.inspect_err(|e| {
            tracing::error!(run_id = %run_id, error = %e, "failed to finalize run");
        })?;

        match &outcome.error {
            None => tracing::info!(
                run_id = %run_id,
                workflow = def.name.as_str(),
                duration_ms,
                steps_completed,
                "workflow run completed"
            ),
            Some(error) => tracing::info!(
                run_id = %run_id,
                workflow = def.name.as_str(),
                duration_ms,
                steps_completed,
                error = error.as_str(),
                "workflow run failed"
            ),
        }

        Ok(outcome)
    }

    /// Lock, record, and execute a run, waiting for it to finish.
    pub async fn execute(
        &self,
        def: &WorkflowDefinition,
        source: TriggerSource,
        payload: Value,
    ) -> Result<RunOutcome, ExecutorError> {
        let guard = self.acquire_run_lock(def).await?;
        let prepared = self
            .prepare(Uuid::now_v7(), def, source, payload, guard)
            .await?;
        self.run_prepared(def, prepared).await
    }

    /// Cancel an active run. Its in-flight step fails with "run cancelled".
    pub fn cancel(&self, run_id: &Uuid) -> Result<(), ExecutorError> {
        let token = self
            .cancellation_tokens
            .get(run_id)
            .ok_or(ExecutorError::RunNotFound(*run_id))?;
        token.cancel();
        tracing::info!(run_id = %run_id, "workflow run cancellation requested");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step execution
    // -----------------------------------------------------------------------

    fn run_step<'a>(
        &'a self,
        step: &'a StepDefinition,
        exec: &'a mut Execution,
        position: Option<LoopPosition>,
    ) -> BoxFuture<'a, Result<(), StepFailure>> {
        Box::pin(async move {
            let started_at = Utc::now();
            let start = Instant::now();

            tracing::debug!(
                run_id = %exec.run_id,
                step = step.id.as_str(),
                step_type = %step.step_type(),
                "step started"
            );

            let result = match validate_step(step) {
                Err(e) => Err(StepError::Validation(e.to_string())),
                Ok(()) => match &step.config {
                    StepConfig::ForEach {
                        source_variable,
                        child_steps,
                    } => {
                        return self
                            .run_for_each(step, source_variable, child_steps, exec, position, started_at)
                            .await;
                    }
                    _ => self.run_leaf(step, exec).await,
                },
            };

            let duration_ms = start.elapsed().as_millis() as u64;
            let mut entry = StepLogEntry {
                step: step.id.clone(),
                name: step.name.clone(),
                step_type: step.step_type(),
                duration_ms,
                success: true,
                error: None,
                output: None,
                parent_step: position.as_ref().map(|p| p.parent_step.clone()),
                iteration: position.as_ref().map(|p| p.iteration),
                started_at,
            };

            match result {
                Ok(output) => {
                    if let Some(name) = &output.store_as {
                        exec.store.set(name, output.value.clone());
                    }
                    entry.output = Some(truncate_output(output.value, self.settings.max_output_bytes));
                    self.append(exec.run_id, &entry).await?;
                    tracing::debug!(
                        run_id = %exec.run_id,
                        step = step.id.as_str(),
                        duration_ms,
                        "step completed"
                    );
                    Ok(())
                }
                Err(error) => {
                    let interrupted = is_interrupt(&error);
                    entry.success = false;
                    entry.error = Some(error.to_string());
                    self.append(exec.run_id, &entry).await?;

                    tracing::warn!(
                        run_id = %exec.run_id,
                        step = step.id.as_str(),
                        error = %error,
                        "step failed"
                    );

                    if !interrupted && self.is_best_effort(step) {
                        tracing::warn!(
                            run_id = %exec.run_id,
                            step = step.id.as_str(),
                            "best-effort notification failed, continuing run"
                        );
                        return Ok(());
                    }
                    Err(StepFailure {
                        step: step.id.clone(),
                        error,
                        interrupted,
                    })
                }
            }
        })
    }

    /// Run a leaf step, racing it against cancellation and the run deadline.
    async fn run_leaf(
        &self,
        step: &StepDefinition,
        exec: &Execution,
    ) -> Result<super::step_runner::StepOutput, StepError> {
        tokio::select! {
            biased;
            _ = exec.token.cancelled() => Err(StepError::Fatal(CANCELLED_MESSAGE.to_string())),
            _ = tokio::time::sleep_until(exec.deadline) => {
                Err(StepError::Fatal(TIMEOUT_MESSAGE.to_string()))
            }
            result = self.step_runner.run(step, &exec.store, &*self.ctx) => result,
        }
    }

    async fn run_for_each(
        &self,
        step: &StepDefinition,
        source_variable: &str,
        child_steps: &[StepDefinition],
        exec: &mut Execution,
        position: Option<LoopPosition>,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<(), StepFailure> {
        let start = Instant::now();
        let mut entry = StepLogEntry {
            step: step.id.clone(),
            name: step.name.clone(),
            step_type: step.step_type(),
            duration_ms: 0,
            success: false,
            error: None,
            output: None,
            parent_step: position.as_ref().map(|p| p.parent_step.clone()),
            iteration: position.as_ref().map(|p| p.iteration),
            started_at,
        };

        let items = match self.loop_items(source_variable, exec) {
            Ok(items) => items,
            Err(error) => {
                entry.duration_ms = start.elapsed().as_millis() as u64;
                entry.error = Some(error.to_string());
                self.append(exec.run_id, &entry).await?;
                tracing::warn!(run_id = %exec.run_id, step = step.id.as_str(), error = %error, "step failed");
                return Err(StepFailure {
                    step: step.id.clone(),
                    error,
                    interrupted: false,
                });
            }
        };

        let total = items.len();
        for (index, item) in items.into_iter().enumerate() {
            let child_position = LoopPosition {
                parent_step: step.id.clone(),
                iteration: index as u32,
            };
            exec.store.enter_loop(item);
            let mut failed = None;
            for child in child_steps {
                if let Err(f) = self.run_step(child, exec, Some(child_position.clone())).await {
                    failed = Some((child.id.clone(), f));
                    break;
                }
            }
            exec.store.exit_loop();

            if let Some((child_id, failure)) = failed {
                entry.duration_ms = start.elapsed().as_millis() as u64;
                entry.error = Some(format!("iteration {index} failed at step '{child_id}'"));
                self.append(exec.run_id, &entry).await?;
                return Err(failure);
            }
        }

        entry.duration_ms = start.elapsed().as_millis() as u64;
        entry.success = true;
        entry.output = Some(json!({ "iterations": total }));
        self.append(exec.run_id, &entry).await?;
        tracing::debug!(
            run_id = %exec.run_id,
            step = step.id.as_str(),
            iterations = total,
            "for_each completed"
        );
        Ok(())
    }

    /// Resolve a loop's source list and check the loop bounds.
    fn loop_items(&self, source_variable: &str, exec: &Execution) -> Result<Vec<Value>, StepError> {
        if exec.store.loop_depth() >= self.settings.max_loop_depth {
            return Err(StepError::Validation(format!(
                "for_each nesting exceeds the maximum depth of {}",
                self.settings.max_loop_depth
            )));
        }
        let items = resolve_list(source_variable, &exec.store)?;
        if items.len() > self.settings.max_iterations {
            return Err(StepError::Validation(format!(
                "'{source_variable}' has {} items, more than the {} iterations allowed",
                items.len(),
                self.settings.max_iterations
            )));
        }
        Ok(items)
    }

    fn is_best_effort(&self, step: &StepDefinition) -> bool {
        match &step.config {
            StepConfig::Notification { best_effort, .. } => {
                best_effort.unwrap_or(self.settings.notifications_best_effort)
            }
            _ => false,
        }
    }

    async fn progress(
        &self,
        run_id: Uuid,
        step: &StepDefinition,
        steps_completed: u32,
    ) -> Result<(), StepFailure> {
        self.recorder
            .progress(run_id, steps_completed)
            .await
            .map_err(|e| {
                tracing::error!(run_id = %run_id, error = %e, "failed to record run progress");
                StepFailure {
                    step: step.id.clone(),
                    error: StepError::Fatal(format!("failed to record run progress: {e}")),
                    interrupted: false,
                }
            })
    }

    async fn append(&self, run_id: Uuid, entry: &StepLogEntry) -> Result<(), StepFailure> {
        match self.recorder.append(run_id, entry).await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "failed to record step log");
                Err(StepFailure {
                    step: entry.step.clone(),
                    error: StepError::Fatal(format!("failed to record step log: {e}")),
                    interrupted: false,
                })
            }
        }
    }
}

fn is_interrupt(error: &StepError) -> bool {
    matches!(error, StepError::Fatal(m) if m == CANCELLED_MESSAGE || m == TIMEOUT_MESSAGE)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that prevent a run from starting or being recorded.
///
/// Step failures are not executor errors: they end the run as `Failed` and
/// are reported through [`RunOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("workflow '{0}' already has a run in progress")]
    AlreadyRunning(String),

    #[error("workflow '{0}' already has a run waiting to start")]
    QueueFull(String),

    #[error("workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    #[error("workflow '{0}' is disabled")]
    Disabled(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error("repository error: {0}")]
    Repository(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_support::{
        MemoryWorkflowRepo, RecordingContext, log_step, step, workflow,
    };
    use std::collections::BTreeMap;
    use stratum_types::data_source::Aggregation;
    use stratum_types::strategy::{StrategyTargetType, UpdateType};
    use stratum_types::work_item::WorkItemStatus;

    fn runner(ctx: Arc<RecordingContext>) -> (WorkflowRunner<MemoryWorkflowRepo>, MemoryWorkflowRepo) {
        runner_with(ctx, EngineSettings::default())
    }

    fn runner_with(
        ctx: Arc<RecordingContext>,
        settings: EngineSettings,
    ) -> (WorkflowRunner<MemoryWorkflowRepo>, MemoryWorkflowRepo) {
        let repo = MemoryWorkflowRepo::default();
        (WorkflowRunner::new(repo.clone(), ctx, settings), repo)
    }

    fn transform(id: &str, formula: &str, var: &str) -> StepDefinition {
        step(
            id,
            StepConfig::DataTransformation {
                formula: formula.to_string(),
                result_variable: Some(var.to_string()),
            },
        )
    }

    fn work_item(id: &str, title: &str) -> StepDefinition {
        step(
            id,
            StepConfig::CreateWorkItem {
                title: title.to_string(),
                description: None,
                status: WorkItemStatus::Todo,
                due_date: None,
                external_reference: None,
                result_variable: None,
            },
        )
    }

    fn for_each(id: &str, source: &str, children: Vec<StepDefinition>) -> StepDefinition {
        step(
            id,
            StepConfig::ForEach {
                source_variable: source.to_string(),
                child_steps: children,
            },
        )
    }

    async fn stored_run(repo: &MemoryWorkflowRepo, run_id: Uuid) -> ExecutionRun {
        repo.get_run(&run_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_log_order_matches_step_order() {
        let (runner, repo) = runner(Arc::new(RecordingContext::default()));
        let def = workflow(
            "ordered",
            vec![log_step("a", "first"), log_step("b", "second"), log_step("c", "third")],
        );

        let outcome = runner.execute(&def, TriggerSource::Manual, json!({})).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.steps_completed, 3);

        let run = stored_run(&repo, outcome.run_id).await;
        let steps: Vec<&str> = run.execution_log.iter().map(|e| e.step.as_str()).collect();
        assert_eq!(steps, vec!["a", "b", "c"]);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_variables_visible_only_to_later_steps() {
        let (runner, repo) = runner(Arc::new(RecordingContext::default()));
        let def = workflow(
            "visibility",
            vec![
                log_step("before", "x is {x}"),
                transform("define", "40 + 2", "x"),
                log_step("after", "x is {x}"),
            ],
        );

        let outcome = runner.execute(&def, TriggerSource::Manual, json!({})).await.unwrap();
        let run = stored_run(&repo, outcome.run_id).await;
        assert_eq!(run.execution_log[0].output.as_ref().unwrap()["message"], json!("x is {x}"));
        assert_eq!(run.execution_log[2].output.as_ref().unwrap()["message"], json!("x is 42"));
        assert_eq!(outcome.result_data.unwrap()["x"], json!(42));
    }

    #[tokio::test]
    async fn test_fail_fast_stops_at_failing_step() {
        let ctx = Arc::new(RecordingContext::default());
        let (runner, repo) = runner(ctx.clone());
        let def = workflow(
            "fail-fast",
            vec![
                work_item("one", "first"),
                step(
                    "two",
                    StepConfig::IntegrationAction {
                        integration_id: "broken".into(),
                        action: "count".into(),
                        parameters: BTreeMap::new(),
                        result_variable: None,
                        timeout_secs: None,
                    },
                ),
                work_item("three", "third"),
                work_item("four", "fourth"),
            ],
        );

        let outcome = runner.execute(&def, TriggerSource::Manual, json!({})).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.steps_completed, 2);
        assert_eq!(
            outcome.error.as_deref(),
            Some("step 'two' failed: remote returned 500: boom")
        );
        assert_eq!(ctx.work_item_titles(), vec!["first".to_string()]);

        let run = stored_run(&repo, outcome.run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.steps_completed, 2);
        assert_eq!(run.execution_log.len(), 2);
        assert_eq!(run.execution_log[1].error.as_deref(), Some("remote returned 500: boom"));
        assert_eq!(
            run.execution_log.iter().filter(|e| e.error.is_some()).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_progress_write_failure_fails_run() {
        let ctx = Arc::new(RecordingContext::default());
        let (runner, repo) = runner(ctx.clone());
        repo.fail_progress_updates();
        let def = workflow(
            "progress-fails",
            vec![
                step(
                    "count",
                    StepConfig::IntegrationAction {
                        integration_id: "crm".into(),
                        action: "count".into(),
                        parameters: BTreeMap::new(),
                        result_variable: None,
                        timeout_secs: None,
                    },
                ),
                work_item("follow-up", "never"),
            ],
        );

        let outcome = runner.execute(&def, TriggerSource::Manual, json!({})).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.steps_completed, 1);
        let error = outcome.error.unwrap();
        assert!(
            error.starts_with("step 'count' failed: failed to record run progress"),
            "{error}"
        );
        assert!(ctx.calls().is_empty());

        let run = stored_run(&repo, outcome.run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some(error.as_str()));
    }

    #[tokio::test]
    async fn test_division_by_zero_fails_run() {
        let (runner, _repo) = runner(Arc::new(RecordingContext::default()));
        let def = workflow(
            "ratio",
            vec![transform("zero", "0", "b"), transform("ratio", "{a}/{b}", "r")],
        );

        let outcome = runner
            .execute(&def, TriggerSource::Manual, json!({"a": 10}))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error.unwrap().contains("division by zero"));
    }

    #[tokio::test]
    async fn test_lead_count_sets_key_result() {
        let records = (0..42).map(|i| json!({"id": i})).collect();
        let ctx = Arc::new(RecordingContext::with_records(records));
        let (runner, repo) = runner(ctx.clone());
        let def = workflow(
            "leads",
            vec![
                step(
                    "count",
                    StepConfig::DataSourceQuery {
                        source_id: "leads".into(),
                        filters: vec![],
                        aggregation: Aggregation::Count,
                        aggregate_field: None,
                        limit: None,
                        result_variable: Some("leadCount".into()),
                    },
                ),
                step(
                    "update",
                    StepConfig::StrategyUpdate {
                        target_type: Some(StrategyTargetType::KeyResult),
                        target_id: Some("kr-leads".into()),
                        use_dynamic_target: false,
                        target_id_variable: None,
                        update_type: UpdateType::SetValue,
                        value: json!("{leadCount}"),
                        result_variable: None,
                    },
                ),
            ],
        );

        let outcome = runner.execute(&def, TriggerSource::Schedule, json!({})).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(
            *ctx.strategy_updates.lock().unwrap(),
            vec![("kr-leads".to_string(), UpdateType::SetValue, 42.0)]
        );

        let run = stored_run(&repo, outcome.run_id).await;
        assert_eq!(run.execution_log.len(), 2);
        assert!(run.execution_log.iter().all(|e| e.success));
    }

    #[tokio::test]
    async fn test_for_each_creates_work_items_in_order() {
        let ctx = Arc::new(RecordingContext::default());
        let (runner, repo) = runner(ctx.clone());
        let def = workflow(
            "follow-up",
            vec![for_each(
                "loop",
                "customers",
                vec![work_item("task", "Follow up: {{currentItem.name}}")],
            )],
        );

        let payload = json!({"customers": [{"id": 1, "name": "A"}, {"id": 2, "name": "B"}]});
        let outcome = runner.execute(&def, TriggerSource::Webhook, payload).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(
            ctx.work_item_titles(),
            vec!["Follow up: A".to_string(), "Follow up: B".to_string()]
        );

        let run = stored_run(&repo, outcome.run_id).await;
        let entries: Vec<(&str, Option<&str>, Option<u32>)> = run
            .execution_log
            .iter()
            .map(|e| (e.step.as_str(), e.parent_step.as_deref(), e.iteration))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("task", Some("loop"), Some(0)),
                ("task", Some("loop"), Some(1)),
                ("loop", None, None),
            ]
        );
        assert_eq!(run.execution_log[2].output, Some(json!({"iterations": 2})));
    }

    #[tokio::test]
    async fn test_current_item_not_visible_after_loop() {
        let (runner, repo) = runner(Arc::new(RecordingContext::default()));
        let def = workflow(
            "scoping",
            vec![
                for_each("loop", "items", vec![log_step("inner", "item {{currentItem.n}}")]),
                log_step("after", "item {{currentItem.n}}"),
            ],
        );

        let outcome = runner
            .execute(&def, TriggerSource::Manual, json!({"items": [{"n": 1}]}))
            .await
            .unwrap();
        let run = stored_run(&repo, outcome.run_id).await;
        assert_eq!(run.execution_log[0].output.as_ref().unwrap()["message"], json!("item 1"));
        assert_eq!(
            run.execution_log[2].output.as_ref().unwrap()["message"],
            json!("item {{currentItem.n}}")
        );
    }

    #[tokio::test]
    async fn test_nested_loops_restore_outer_item() {
        let ctx = Arc::new(RecordingContext::default());
        let (runner, _repo) = runner(ctx.clone());
        let def = workflow(
            "nested",
            vec![for_each(
                "outer",
                "teams",
                vec![
                    for_each(
                        "inner",
                        "{{currentItem.members}}",
                        vec![work_item("member", "member {{currentItem}}")],
                    ),
                    work_item("team", "team {{currentItem.name}}"),
                ],
            )],
        );

        let payload = json!({"teams": [
            {"name": "red", "members": ["ann", "bo"]},
            {"name": "blue", "members": ["cy"]},
        ]});
        let outcome = runner.execute(&def, TriggerSource::Manual, payload).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(
            ctx.work_item_titles(),
            vec!["member ann", "member bo", "team red", "member cy", "team blue"]
        );
    }

    #[tokio::test]
    async fn test_for_each_child_failure_aborts_run() {
        let ctx = Arc::new(RecordingContext::default());
        let (runner, repo) = runner(ctx.clone());
        let def = workflow(
            "loop-failure",
            vec![
                for_each(
                    "loop",
                    "values",
                    vec![step(
                        "ratio",
                        StepConfig::DataTransformation {
                            formula: "10 / {{currentItem}}".into(),
                            result_variable: None,
                        },
                    )],
                ),
                work_item("never", "never"),
            ],
        );

        let outcome = runner
            .execute(&def, TriggerSource::Manual, json!({"values": [5, 0, 2]}))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.steps_completed, 1);
        assert!(ctx.work_item_titles().is_empty());

        let run = stored_run(&repo, outcome.run_id).await;
        assert_eq!(run.execution_log.len(), 3);
        assert!(run.execution_log[0].success);
        assert!(!run.execution_log[1].success);
        assert_eq!(run.execution_log[1].iteration, Some(1));
        assert_eq!(
            run.execution_log[2].error.as_deref(),
            Some("iteration 1 failed at step 'ratio'")
        );
    }

    #[tokio::test]
    async fn test_for_each_requires_list() {
        let (runner, repo) = runner(Arc::new(RecordingContext::default()));
        let def = workflow("not-a-list", vec![for_each("loop", "count", vec![log_step("x", "x")])]);

        let outcome = runner
            .execute(&def, TriggerSource::Manual, json!({"count": 3}))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        let run = stored_run(&repo, outcome.run_id).await;
        assert_eq!(run.execution_log.len(), 1);
        assert!(run.execution_log[0].error.as_ref().unwrap().contains("not a list"));
    }

    #[tokio::test]
    async fn test_for_each_iteration_limit() {
        let settings = EngineSettings {
            max_iterations: 2,
            ..EngineSettings::default()
        };
        let ctx = Arc::new(RecordingContext::default());
        let (runner, _repo) = runner_with(ctx.clone(), settings);
        let def = workflow("big", vec![for_each("loop", "items", vec![work_item("t", "t")])]);

        let outcome = runner
            .execute(&def, TriggerSource::Manual, json!({"items": [1, 2, 3]}))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(ctx.work_item_titles().is_empty());
    }

    #[tokio::test]
    async fn test_step_validated_before_execution() {
        let (runner, repo) = runner(Arc::new(RecordingContext::default()));
        let def = workflow(
            "invalid",
            vec![
                log_step("ok", "fine"),
                step(
                    "bad",
                    StepConfig::StrategyUpdate {
                        target_type: Some(StrategyTargetType::KeyResult),
                        target_id: None,
                        use_dynamic_target: false,
                        target_id_variable: None,
                        update_type: UpdateType::SetValue,
                        value: json!(1),
                        result_variable: None,
                    },
                ),
            ],
        );

        let outcome = runner.execute(&def, TriggerSource::Manual, json!({})).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        let run = stored_run(&repo, outcome.run_id).await;
        assert!(run.execution_log[1].error.as_ref().unwrap().contains("target_id is required"));
    }

    #[tokio::test]
    async fn test_best_effort_notification_does_not_fail_run() {
        let ctx = Arc::new(RecordingContext::default());
        let (runner, repo) = runner(ctx.clone());
        let notify = |best_effort| {
            step(
                "notify",
                StepConfig::Notification {
                    channel: "pager".into(),
                    recipient: None,
                    subject: None,
                    message: "hi".into(),
                    best_effort,
                },
            )
        };

        let def = workflow("notify-soft", vec![notify(None), work_item("after", "after")]);
        let outcome = runner.execute(&def, TriggerSource::Manual, json!({})).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(ctx.work_item_titles(), vec!["after".to_string()]);
        let run = stored_run(&repo, outcome.run_id).await;
        assert!(!run.execution_log[0].success);

        let def = workflow("notify-hard", vec![notify(Some(false)), work_item("after", "after")]);
        let outcome = runner.execute(&def, TriggerSource::Manual, json!({})).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_large_outputs_truncated_in_log_only() {
        let settings = EngineSettings {
            max_output_bytes: 16,
            ..EngineSettings::default()
        };
        let records: Vec<Value> = (0..10).map(|i| json!({"id": i, "name": "customer"})).collect();
        let (runner, repo) = runner_with(Arc::new(RecordingContext::with_records(records)), settings);
        let def = workflow(
            "big-output",
            vec![step(
                "list",
                StepConfig::DataSourceQuery {
                    source_id: "customers".into(),
                    filters: vec![],
                    aggregation: Aggregation::List,
                    aggregate_field: None,
                    limit: None,
                    result_variable: Some("customers".into()),
                },
            )],
        );

        let outcome = runner.execute(&def, TriggerSource::Manual, json!({})).await.unwrap();
        let run = stored_run(&repo, outcome.run_id).await;
        assert_eq!(run.execution_log[0].output.as_ref().unwrap()["_truncated"], json!(true));
        assert_eq!(outcome.result_data.unwrap()["customers"].as_array().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_empty_workflow_rejected() {
        let (runner, _repo) = runner(Arc::new(RecordingContext::default()));
        let def = workflow("empty", vec![]);
        let err = runner.execute(&def, TriggerSource::Manual, json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::EmptyWorkflow(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_run_is_skipped() {
        let ctx = Arc::new(RecordingContext {
            slow_delay: Duration::from_secs(60),
            ..Default::default()
        });
        let (runner, repo) = runner(ctx.clone());
        let runner = Arc::new(runner);
        let def = workflow(
            "slow",
            vec![step(
                "call",
                StepConfig::IntegrationAction {
                    integration_id: "slow".into(),
                    action: "sync".into(),
                    parameters: BTreeMap::new(),
                    result_variable: None,
                    timeout_secs: None,
                },
            )],
        );

        let first = {
            let runner = runner.clone();
            let def = def.clone();
            tokio::spawn(async move { runner.execute(&def, TriggerSource::Schedule, json!({})).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(runner.is_running(&def.id));

        let second = runner.execute(&def, TriggerSource::Schedule, json!({})).await;
        assert!(matches!(second, Err(ExecutorError::AlreadyRunning(_))));

        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(repo.runs_for(def.id).len(), 1);
        assert!(!runner.is_running(&def.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_run_is_queued() {
        let settings = EngineSettings {
            overlap_policy: OverlapPolicy::Queue,
            ..EngineSettings::default()
        };
        let ctx = Arc::new(RecordingContext {
            slow_delay: Duration::from_secs(10),
            ..Default::default()
        });
        let (runner, repo) = runner_with(ctx.clone(), settings);
        let runner = Arc::new(runner);
        let def = workflow(
            "queued",
            vec![step(
                "call",
                StepConfig::IntegrationAction {
                    integration_id: "slow".into(),
                    action: "sync".into(),
                    parameters: BTreeMap::new(),
                    result_variable: None,
                    timeout_secs: None,
                },
            )],
        );

        let spawn = |runner: Arc<WorkflowRunner<MemoryWorkflowRepo>>, def: WorkflowDefinition| {
            tokio::spawn(async move { runner.execute(&def, TriggerSource::Schedule, json!({})).await })
        };
        let a = spawn(runner.clone(), def.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let b = spawn(runner.clone(), def.clone());

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.status, RunStatus::Completed);
        assert_eq!(b.status, RunStatus::Completed);

        let first = stored_run(&repo, a.run_id).await;
        let second = stored_run(&repo, b.run_id).await;
        assert!(second.started_at >= first.completed_at.unwrap());
        assert_eq!(first.execution_log.len(), 1);
        assert_eq!(second.execution_log.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fails_in_flight_step() {
        let ctx = Arc::new(RecordingContext {
            slow_delay: Duration::from_secs(60),
            ..Default::default()
        });
        let (runner, repo) = runner(ctx.clone());
        let runner = Arc::new(runner);
        let def = workflow(
            "cancellable",
            vec![
                step(
                    "call",
                    StepConfig::IntegrationAction {
                        integration_id: "slow".into(),
                        action: "sync".into(),
                        parameters: BTreeMap::new(),
                        result_variable: None,
                        timeout_secs: None,
                    },
                ),
                work_item("after", "after"),
            ],
        );

        let guard = runner.acquire_run_lock(&def).await.unwrap();
        let prepared = runner
            .prepare(Uuid::now_v7(), &def, TriggerSource::Manual, json!({}), guard)
            .await
            .unwrap();
        let run_id = prepared.run_id();
        let task = {
            let runner = runner.clone();
            let def = def.clone();
            tokio::spawn(async move { runner.run_prepared(&def, prepared).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        runner.cancel(&run_id).unwrap();
        let outcome = task.await.unwrap().unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(ctx.work_item_titles().is_empty());
        let run = stored_run(&repo, run_id).await;
        assert_eq!(run.execution_log[0].error.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(matches!(runner.cancel(&run_id), Err(ExecutorError::RunNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout() {
        let settings = EngineSettings {
            run_timeout_secs: 5,
            ..EngineSettings::default()
        };
        let ctx = Arc::new(RecordingContext {
            slow_delay: Duration::from_secs(60),
            ..Default::default()
        });
        let (runner, _repo) = runner_with(ctx, settings);
        let def = workflow(
            "timeout",
            vec![step(
                "call",
                StepConfig::IntegrationAction {
                    integration_id: "slow".into(),
                    action: "sync".into(),
                    parameters: BTreeMap::new(),
                    result_variable: None,
                    timeout_secs: None,
                },
            )],
        );

        let outcome = runner.execute(&def, TriggerSource::Manual, json!({})).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some(TIMEOUT_MESSAGE));
    }
}
