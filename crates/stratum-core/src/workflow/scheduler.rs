//! Schedule evaluation and the cron scheduler for schedule-triggered workflows.
//!
//! Provides:
//! - Conversion of the frequency/time/day model to a 5-field cron expression
//! - "Is it time to fire" and "next occurrence" evaluation via `croner`
//! - Missed-run detection for logging after a restart
//! - Per-workflow job lifecycle on top of `tokio-cron-scheduler`

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use stratum_types::workflow::{ScheduleFrequency, TriggerConfig};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Failed to create or manipulate a cron job.
    #[error("scheduler error: {0}")]
    JobError(String),

    /// Invalid cron expression or schedule model.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Workflow not found in the scheduler.
    #[error("workflow {0} not registered in scheduler")]
    WorkflowNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Schedule model -> cron
// ---------------------------------------------------------------------------

/// Convert a 5-field cron expression into the 6-field (with seconds) form
/// used by `croner` and `tokio-cron-scheduler`.
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();
    let fields = trimmed.split_whitespace().count();
    if fields != 5 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "'{trimmed}' has {fields} fields, expected 5 (minute hour day month weekday)"
        )));
    }
    Ok(format!("0 {}", trimmed.split_whitespace().collect::<Vec<_>>().join(" ")))
}

/// Derive the 5-field cron expression for a frequency model.
pub fn frequency_to_cron(freq: &ScheduleFrequency) -> Result<String, SchedulerError> {
    match freq {
        ScheduleFrequency::Hourly { minute } => {
            if *minute > 59 {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "minute {minute} out of range 0-59"
                )));
            }
            Ok(format!("{minute} * * * *"))
        }
        ScheduleFrequency::Daily { time } => {
            let (hour, minute) = parse_time(time)?;
            Ok(format!("{minute} {hour} * * *"))
        }
        ScheduleFrequency::Weekly { day, time } => {
            let (hour, minute) = parse_time(time)?;
            Ok(format!("{minute} {hour} * * {}", day.cron_index()))
        }
        ScheduleFrequency::Monthly { day_of_month, time } => {
            if !(1..=31).contains(day_of_month) {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "day_of_month {day_of_month} out of range 1-31"
                )));
            }
            let (hour, minute) = parse_time(time)?;
            Ok(format!("{minute} {hour} {day_of_month} * *"))
        }
    }
}

/// Parse `HH:MM` (24-hour).
fn parse_time(time: &str) -> Result<(u32, u32), SchedulerError> {
    let invalid = || SchedulerError::InvalidSchedule(format!("time '{time}' is not HH:MM"));
    let (h, m) = time.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u32 = h.trim().parse().map_err(|_| invalid())?;
    let minute: u32 = m.trim().parse().map_err(|_| invalid())?;
    if hour < 24 && minute < 60 {
        Ok((hour, minute))
    } else {
        Err(invalid())
    }
}

/// The 5-field cron expression of a trigger, or `None` for non-schedule triggers.
///
/// An explicit `cron` wins over `frequency`.
pub fn trigger_cron(trigger: &TriggerConfig) -> Result<Option<String>, SchedulerError> {
    match trigger {
        TriggerConfig::Schedule {
            cron: Some(cron), ..
        } => Ok(Some(cron.trim().to_string())),
        TriggerConfig::Schedule {
            frequency: Some(freq),
            ..
        } => frequency_to_cron(freq).map(Some),
        TriggerConfig::Schedule { .. } => Err(SchedulerError::InvalidSchedule(
            "schedule trigger requires `cron` or `frequency`".to_string(),
        )),
        TriggerConfig::Manual {} | TriggerConfig::Webhook { .. } => Ok(None),
    }
}

/// Parse a 5-field cron expression.
pub fn parse_cron(expr: &str) -> Result<croner::Cron, SchedulerError> {
    normalize_schedule(expr)?
        .parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidSchedule(format!("'{}': {e}", expr.trim())))
}

/// Whether a 5-field cron expression has an occurrence in `(last_checked, now]`.
pub fn is_due(
    expr: &str,
    last_checked: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, SchedulerError> {
    let cron = parse_cron(expr)?;
    Ok(cron
        .iter_after(last_checked)
        .next()
        .is_some_and(|next| next <= now))
}

/// The first occurrence strictly after `from`.
pub fn next_fire_after(
    expr: &str,
    from: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    let cron = parse_cron(expr)?;
    Ok(cron.iter_after(from).next())
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Callback type invoked when a cron trigger fires.
pub type CronCallback =
    Arc<dyn Fn(Uuid, DateTime<Utc>) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

/// Tracks a registered cron job for a workflow.
struct ScheduledWorkflow {
    /// The job UUID assigned by tokio-cron-scheduler.
    job_id: Uuid,
    /// The 5-field cron expression.
    cron_expr: String,
}

/// Cron scheduler that wraps `tokio-cron-scheduler::JobScheduler`.
///
/// The scheduler only fires callbacks; overlap between runs of the same
/// workflow is handled by the dispatcher's run lock.
pub struct CronScheduler {
    inner: Arc<RwLock<Option<JobScheduler>>>,
    /// Registered workflows: workflow_id -> job metadata.
    workflows: Arc<RwLock<HashMap<Uuid, ScheduledWorkflow>>>,
}

impl CronScheduler {
    /// Create a new cron scheduler (not yet started).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the scheduler. Must be called before scheduling workflows.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;

        scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;

        let mut inner = self.inner.write().await;
        *inner = Some(scheduler);

        tracing::info!("cron scheduler started");
        Ok(())
    }

    /// Stop the scheduler and remove all jobs.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut inner = self.inner.write().await;
        if let Some(mut scheduler) = inner.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| SchedulerError::JobError(e.to_string()))?;
            tracing::info!("cron scheduler stopped");
        }
        let mut workflows = self.workflows.write().await;
        workflows.clear();
        Ok(())
    }

    /// Register a workflow on a 5-field cron expression.
    ///
    /// Re-scheduling an already registered workflow replaces its job.
    pub async fn schedule_workflow(
        &self,
        workflow_id: Uuid,
        cron_expr: &str,
        callback: CronCallback,
    ) -> Result<(), SchedulerError> {
        parse_cron(cron_expr)?;
        let six_field = normalize_schedule(cron_expr)?;

        if self.workflows.read().await.contains_key(&workflow_id) {
            self.unschedule_workflow(workflow_id).await?;
        }

        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| SchedulerError::JobError("scheduler not started".to_string()))?;

        let wf_id = workflow_id;
        let job = Job::new_async(six_field.as_str(), move |_uuid, _lock| {
            let cb = callback.clone();
            Box::pin(async move {
                let now = Utc::now();
                tracing::debug!(%wf_id, %now, "cron trigger fired");
                cb(wf_id, now).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;

        let mut workflows = self.workflows.write().await;
        workflows.insert(
            workflow_id,
            ScheduledWorkflow {
                job_id,
                cron_expr: cron_expr.trim().to_string(),
            },
        );

        tracing::info!(%workflow_id, %job_id, cron = cron_expr, "workflow scheduled");
        Ok(())
    }

    /// Remove a workflow from the cron scheduler.
    pub async fn unschedule_workflow(&self, workflow_id: Uuid) -> Result<(), SchedulerError> {
        let mut workflows = self.workflows.write().await;
        let entry = workflows
            .remove(&workflow_id)
            .ok_or(SchedulerError::WorkflowNotFound(workflow_id))?;

        let inner = self.inner.read().await;
        if let Some(scheduler) = inner.as_ref() {
            scheduler
                .remove(&entry.job_id)
                .await
                .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        }

        tracing::info!(%workflow_id, "workflow unscheduled");
        Ok(())
    }

    /// The cron expression a workflow is registered with.
    pub async fn cron_for(&self, workflow_id: Uuid) -> Option<String> {
        self.workflows
            .read()
            .await
            .get(&workflow_id)
            .map(|w| w.cron_expr.clone())
    }

    /// Check for cron occurrences missed since each workflow's last run.
    ///
    /// Takes `(workflow_id, cron, last_run_started_at)` triples and returns
    /// the occurrences in `(last_run, now)` for each workflow that has any.
    /// Workflows without a previous run or with an invalid expression are
    /// skipped.
    pub fn check_missed_runs(
        &self,
        schedules: &[(Uuid, String, Option<DateTime<Utc>>)],
    ) -> Vec<(Uuid, Vec<DateTime<Utc>>)> {
        let now = Utc::now();
        let mut missed = Vec::new();

        for (workflow_id, expr, last_run) in schedules {
            let Ok(cron) = parse_cron(expr) else {
                continue;
            };
            let Some(from) = last_run else {
                continue;
            };

            let missed_times: Vec<DateTime<Utc>> = cron
                .iter_after(*from)
                .take_while(|next| *next < now)
                .collect();

            if !missed_times.is_empty() {
                tracing::warn!(
                    %workflow_id,
                    count = missed_times.len(),
                    "detected missed cron runs"
                );
                missed.push((*workflow_id, missed_times));
            }
        }

        missed
    }

    /// Get the number of registered workflows.
    pub async fn workflow_count(&self) -> usize {
        self.workflows.read().await.len()
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
