//! Trigger dispatch: turns manual, schedule, and webhook triggers into runs.
//!
//! `TriggerDispatcher` resolves the workflow, refuses disabled ones, applies
//! the overlap policy through the runner's run lock, and starts the run.
//! Webhook signature checks happen before dispatch, in the HTTP layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use stratum_types::config::OverlapPolicy;
use stratum_types::workflow::{TriggerConfig, TriggerSource, WebhookAuth, WorkflowDefinition};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::executor::{ExecutorError, RunOutcome, WorkflowRunner};
use super::scheduler::{CronCallback, CronScheduler, SchedulerError, trigger_cron};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("no enabled workflow listens on webhook '{0}'")]
    WebhookNotFound(String),
}

// ---------------------------------------------------------------------------
// TriggerDispatcher
// ---------------------------------------------------------------------------

pub struct TriggerDispatcher<R: WorkflowRepository> {
    runner: Arc<WorkflowRunner<R>>,
}

impl<R: WorkflowRepository + 'static> TriggerDispatcher<R> {
    pub fn new(runner: Arc<WorkflowRunner<R>>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &Arc<WorkflowRunner<R>> {
        &self.runner
    }

    /// Load an enabled workflow definition.
    async fn load_enabled(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, ExecutorError> {
        let def = self
            .runner
            .repo()
            .get_definition(&workflow_id)
            .await
            .map_err(|e| ExecutorError::Repository(e.to_string()))?
            .ok_or_else(|| ExecutorError::WorkflowNotFound(workflow_id.to_string()))?;
        if !def.is_enabled {
            return Err(ExecutorError::Disabled(def.name));
        }
        Ok(def)
    }

    /// Start a run in the background and return its id.
    ///
    /// Under the `skip` overlap policy the run is recorded before this
    /// returns, and an active run of the same workflow makes this fail with
    /// `AlreadyRunning`. Under `queue` at most one run waits behind the
    /// active one; it is recorded once the active run finishes, and further
    /// triggers fail with `QueueFull` until it starts.
    pub async fn start_run(
        &self,
        workflow_id: Uuid,
        source: TriggerSource,
        initial_context: Value,
    ) -> Result<Uuid, TriggerError> {
        let def = self.load_enabled(workflow_id).await?;
        let run_id = Uuid::now_v7();
        let runner = Arc::clone(&self.runner);
        let reservation = runner.reserve_run_lock(&def)?;

        match runner.settings().overlap_policy {
            OverlapPolicy::Skip => {
                let guard = reservation.acquire().await;
                let prepared = runner
                    .prepare(run_id, &def, source, initial_context, guard)
                    .await?;
                tokio::spawn(async move {
                    if let Err(e) = runner.run_prepared(&def, prepared).await {
                        tracing::error!(%run_id, error = %e, "workflow run aborted");
                    }
                });
            }
            OverlapPolicy::Queue => {
                tokio::spawn(async move {
                    let result: Result<RunOutcome, ExecutorError> = async {
                        let guard = reservation.acquire().await;
                        let prepared = runner
                            .prepare(run_id, &def, source, initial_context, guard)
                            .await?;
                        runner.run_prepared(&def, prepared).await
                    }
                    .await;
                    if let Err(e) = result {
                        tracing::error!(%run_id, error = %e, "queued workflow run aborted");
                    }
                });
            }
        }

        tracing::info!(%run_id, %workflow_id, trigger = %source, "workflow run dispatched");
        Ok(run_id)
    }

    /// Run a workflow to completion. Used by the CLI.
    pub async fn start_run_and_wait(
        &self,
        workflow_id: Uuid,
        source: TriggerSource,
        initial_context: Value,
    ) -> Result<RunOutcome, TriggerError> {
        let def = self.load_enabled(workflow_id).await?;
        Ok(self.runner.execute(&def, source, initial_context).await?)
    }

    /// Find the enabled workflow listening on a webhook identifier.
    ///
    /// Returns the workflow and its configured authentication, which the
    /// caller must verify before calling [`start_run`](Self::start_run).
    pub async fn find_webhook(
        &self,
        identifier: &str,
    ) -> Result<(WorkflowDefinition, Option<WebhookAuth>), TriggerError> {
        let defs = self
            .runner
            .repo()
            .list_definitions()
            .await
            .map_err(|e| ExecutorError::Repository(e.to_string()))?;

        defs.into_iter()
            .filter(|d| d.is_enabled)
            .find_map(|d| {
                let auth = match &d.trigger {
                    TriggerConfig::Webhook {
                        identifier: id,
                        auth,
                    } if id == identifier => auth.clone(),
                    _ => return None,
                };
                Some((d, auth))
            })
            .ok_or_else(|| TriggerError::WebhookNotFound(identifier.to_string()))
    }

    pub fn cancel(&self, run_id: &Uuid) -> Result<(), TriggerError> {
        Ok(self.runner.cancel(run_id)?)
    }

    /// Fail runs left `running` by a previous process.
    pub async fn recover_interrupted_runs(&self) -> Result<usize, TriggerError> {
        let recovered = self
            .runner
            .recorder()
            .recover_interrupted()
            .await
            .map_err(ExecutorError::from)?;
        if recovered > 0 {
            tracing::warn!(recovered, "recovered interrupted workflow runs");
        }
        Ok(recovered)
    }

    /// Register every enabled schedule-triggered workflow with the scheduler.
    ///
    /// Each tick dispatches a run with `{"scheduled_at": ...}` as its
    /// payload. Occurrences missed while the engine was down are logged,
    /// not replayed. Returns the number of workflows scheduled.
    pub async fn schedule_workflows(
        self: &Arc<Self>,
        scheduler: &CronScheduler,
    ) -> Result<usize, TriggerError> {
        let defs = self
            .runner
            .repo()
            .list_definitions()
            .await
            .map_err(|e| ExecutorError::Repository(e.to_string()))?;

        let mut scheduled = Vec::new();
        for def in defs.iter().filter(|d| d.is_enabled) {
            let cron = match trigger_cron(&def.trigger) {
                Ok(Some(cron)) => cron,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(workflow = def.name.as_str(), error = %e, "skipping invalid schedule");
                    continue;
                }
            };
            scheduler
                .schedule_workflow(def.id, &cron, self.cron_callback())
                .await?;

            let last_run = self
                .runner
                .repo()
                .list_runs(&def.id, 1)
                .await
                .ok()
                .and_then(|runs| runs.first().map(|r| r.started_at));
            scheduled.push((def.id, cron, last_run));
        }

        for (workflow_id, missed) in scheduler.check_missed_runs(&scheduled) {
            tracing::warn!(
                %workflow_id,
                missed = missed.len(),
                "schedule occurrences missed while the engine was stopped"
            );
        }
        Ok(scheduled.len())
    }

    /// Bring one workflow's scheduler registration in line with its definition.
    ///
    /// Called after a definition is saved or deleted while the server runs.
    /// Returns whether the workflow is scheduled afterwards.
    pub async fn sync_schedule(
        self: &Arc<Self>,
        scheduler: &CronScheduler,
        workflow_id: Uuid,
        def: Option<&WorkflowDefinition>,
    ) -> Result<bool, TriggerError> {
        if scheduler.cron_for(workflow_id).await.is_some() {
            scheduler.unschedule_workflow(workflow_id).await?;
        }
        let Some(def) = def.filter(|d| d.is_enabled) else {
            return Ok(false);
        };
        match trigger_cron(&def.trigger)? {
            Some(cron) => {
                scheduler
                    .schedule_workflow(def.id, &cron, self.cron_callback())
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn cron_callback(self: &Arc<Self>) -> CronCallback {
        let dispatcher = Arc::clone(self);
        Arc::new(move |workflow_id: Uuid, fired_at: DateTime<Utc>| -> BoxFuture<'static, ()> {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move {
                let payload = json!({ "scheduled_at": fired_at.to_rfc3339() });
                match dispatcher
                    .start_run(workflow_id, TriggerSource::Schedule, payload)
                    .await
                {
                    Ok(_) => {}
                    Err(TriggerError::Executor(ExecutorError::AlreadyRunning(name))) => {
                        tracing::info!(workflow = name.as_str(), "previous run still active, skipping tick");
                    }
                    Err(TriggerError::Executor(ExecutorError::QueueFull(name))) => {
                        tracing::info!(workflow = name.as_str(), "a run is already queued, skipping tick");
                    }
                    Err(e) => {
                        tracing::warn!(%workflow_id, error = %e, "scheduled dispatch failed");
                    }
                }
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
