//! In-memory doubles of the engine's boundary traits, shared by the
//! workflow test modules.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use stratum_types::data_source::DataQuery;
use stratum_types::error::RepositoryError;
use stratum_types::integration::{IntegrationResult, NotificationMessage};
use stratum_types::strategy::{StrategyTargetType, StrategyUpdateOutcome, UpdateType};
use stratum_types::work_item::{NewWorkItem, WorkItem};
use stratum_types::workflow::{
    ExecutionRun, RunStatus, StepConfig, StepDefinition, StepLogEntry, StepType, TriggerConfig,
    TriggerSource, WorkflowDefinition,
};
use uuid::Uuid;

use crate::repository::workflow::{RunFinalization, WorkflowRepository};

use super::step_runner::{StepError, StepExecutionContext, StepFuture};

// ---------------------------------------------------------------------------
// MemoryWorkflowRepo
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    defs: HashMap<Uuid, WorkflowDefinition>,
    runs: HashMap<Uuid, ExecutionRun>,
    logs: HashMap<Uuid, Vec<(u32, StepLogEntry)>>,
    fail_progress: bool,
}

/// `WorkflowRepository` over a shared map. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryWorkflowRepo {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryWorkflowRepo {
    fn with<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Make every later `update_run_progress` call fail.
    pub fn fail_progress_updates(&self) {
        self.with(|s| s.fail_progress = true);
    }

    /// Every run of a workflow, any status.
    pub fn runs_for(&self, workflow_id: Uuid) -> Vec<ExecutionRun> {
        self.with(|s| {
            s.runs
                .values()
                .filter(|r| r.workflow_id == workflow_id)
                .cloned()
                .collect()
        })
    }
}

impl WorkflowRepository for MemoryWorkflowRepo {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.with(|s| {
            if s.defs.values().any(|d| d.name == def.name && d.id != def.id) {
                return Err(RepositoryError::Conflict(format!(
                    "workflow name '{}' already exists",
                    def.name
                )));
            }
            s.defs.insert(def.id, def.clone());
            Ok(())
        })
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.with(|s| s.defs.get(id).cloned()))
    }

    async fn get_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.with(|s| s.defs.values().find(|d| d.name == name).cloned()))
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<_> = self.with(|s| s.defs.values().cloned().collect());
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.with(|s| s.defs.remove(id).is_some()))
    }

    async fn create_run(&self, run: &ExecutionRun) -> Result<(), RepositoryError> {
        self.with(|s| {
            let mut run = run.clone();
            run.execution_log.clear();
            s.runs.insert(run.id, run);
        });
        Ok(())
    }

    async fn update_run_progress(
        &self,
        run_id: &Uuid,
        steps_completed: u32,
    ) -> Result<(), RepositoryError> {
        self.with(|s| {
            if s.fail_progress {
                return Err(RepositoryError::Query("disk I/O error".into()));
            }
            match s.runs.get_mut(run_id) {
                Some(run) => {
                    run.steps_completed = steps_completed;
                    Ok(())
                }
                None => Err(RepositoryError::NotFound),
            }
        })
    }

    async fn finalize_run(
        &self,
        run_id: &Uuid,
        fin: &RunFinalization,
    ) -> Result<(), RepositoryError> {
        self.with(|s| {
            let run = s.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
            if run.status != RunStatus::Running {
                return Err(RepositoryError::Conflict(format!("run {run_id} already finalized")));
            }
            run.status = fin.status;
            run.completed_at = Some(fin.completed_at);
            run.execution_duration_ms = Some(fin.duration_ms);
            run.steps_completed = fin.steps_completed;
            run.result_data = fin.result_data.clone();
            run.error_message = fin.error_message.clone();
            Ok(())
        })
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<ExecutionRun>, RepositoryError> {
        Ok(self.with(|s| {
            s.runs.get(run_id).cloned().map(|mut run| {
                let mut logs = s.logs.get(run_id).cloned().unwrap_or_default();
                logs.sort_by_key(|(seq, _)| *seq);
                run.execution_log = logs.into_iter().map(|(_, e)| e).collect();
                run
            })
        }))
    }

    async fn list_runs(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<ExecutionRun>, RepositoryError> {
        let mut runs = self.runs_for(*workflow_id);
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_running_runs(&self) -> Result<Vec<ExecutionRun>, RepositoryError> {
        Ok(self.with(|s| {
            s.runs
                .values()
                .filter(|r| r.status == RunStatus::Running)
                .cloned()
                .collect()
        }))
    }

    async fn append_step_log(
        &self,
        run_id: &Uuid,
        seq: u32,
        entry: &StepLogEntry,
    ) -> Result<(), RepositoryError> {
        self.with(|s| {
            if !s.runs.contains_key(run_id) {
                return Err(RepositoryError::NotFound);
            }
            s.logs.entry(*run_id).or_default().push((seq, entry.clone()));
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingContext
// ---------------------------------------------------------------------------

/// `StepExecutionContext` that records every outbound call.
///
/// Integration `broken` and notification channel `pager` always fail;
/// integration `slow` sleeps for `slow_delay` before answering.
#[derive(Default)]
pub struct RecordingContext {
    /// Answer to every data source query and to `list` integration actions.
    pub records: Vec<Value>,
    pub slow_delay: Duration,
    pub calls: Mutex<Vec<String>>,
    pub work_items: Mutex<Vec<NewWorkItem>>,
    pub strategy_updates: Mutex<Vec<(String, UpdateType, f64)>>,
}

impl RecordingContext {
    pub fn with_records(records: Vec<Value>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn work_item_titles(&self) -> Vec<String> {
        self.work_items
            .lock()
            .unwrap()
            .iter()
            .map(|w| w.title.clone())
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl StepExecutionContext for RecordingContext {
    fn invoke_integration(
        &self,
        integration_id: &str,
        action: &str,
        _parameters: Value,
        _timeout: Option<Duration>,
    ) -> StepFuture<'_, IntegrationResult> {
        self.record(format!("integration:{integration_id}/{action}"));
        let integration_id = integration_id.to_string();
        let action = action.to_string();
        Box::pin(async move {
            match integration_id.as_str() {
                "broken" => Err(StepError::Adapter("remote returned 500: boom".into())),
                "slow" => {
                    tokio::time::sleep(self.slow_delay).await;
                    Ok(IntegrationResult::count(1))
                }
                _ if action == "list" => Ok(IntegrationResult::records(self.records.clone())),
                _ => Ok(IntegrationResult::count(self.records.len() as u64)),
            }
        })
    }

    fn update_strategy(
        &self,
        target_type: StrategyTargetType,
        target_id: &str,
        update_type: UpdateType,
        value: f64,
    ) -> StepFuture<'_, StrategyUpdateOutcome> {
        self.record(format!("strategy:{target_id}"));
        self.strategy_updates
            .lock()
            .unwrap()
            .push((target_id.to_string(), update_type, value));
        let target_id = target_id.to_string();
        Box::pin(async move {
            Ok(StrategyUpdateOutcome {
                target_id,
                target_type,
                update_type,
                previous_value: 0.0,
                new_value: value,
            })
        })
    }

    fn query_data_source(&self, query: DataQuery) -> StepFuture<'_, Vec<Value>> {
        self.record(format!("query:{}", query.source_id));
        let mut records = self.records.clone();
        if let Some(limit) = query.limit {
            records.truncate(limit as usize);
        }
        Box::pin(async move { Ok(records) })
    }

    fn create_work_item(&self, item: NewWorkItem) -> StepFuture<'_, WorkItem> {
        self.record(format!("work_item:{}", item.title));
        self.work_items.lock().unwrap().push(item.clone());
        Box::pin(async move {
            Ok(WorkItem {
                id: Uuid::now_v7(),
                title: item.title,
                description: item.description,
                status: item.status,
                due_date: item.due_date,
                external_reference: item.external_reference,
                workflow_run_id: item.workflow_run_id,
                created_at: Utc::now(),
            })
        })
    }

    fn send_notification(
        &self,
        channel: &str,
        _message: NotificationMessage,
    ) -> StepFuture<'_, ()> {
        self.record(format!("notify:{channel}"));
        let fail = channel == "pager";
        Box::pin(async move {
            if fail {
                Err(StepError::Adapter("pager gateway unreachable".into()))
            } else {
                Ok(())
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn step(id: &str, config: StepConfig) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        name: id.to_string(),
        config,
    }
}

pub fn log_step(id: &str, message: &str) -> StepDefinition {
    step(
        id,
        StepConfig::LogEvent {
            message: message.to_string(),
            level: Default::default(),
        },
    )
}

pub fn workflow(name: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: Uuid::now_v7(),
        name: name.to_string(),
        description: None,
        is_enabled: true,
        trigger: TriggerConfig::default(),
        steps,
    }
}

pub fn running_run(workflow_id: Uuid, name: &str) -> ExecutionRun {
    ExecutionRun {
        id: Uuid::now_v7(),
        workflow_id,
        workflow_name: name.to_string(),
        status: RunStatus::Running,
        trigger_source: TriggerSource::Manual,
        trigger_payload: json!({}),
        started_at: Utc::now(),
        completed_at: None,
        execution_duration_ms: None,
        steps_completed: 0,
        execution_log: Vec::new(),
        result_data: None,
        error_message: None,
    }
}

pub fn log_entry(step: &str, success: bool) -> StepLogEntry {
    StepLogEntry {
        step: step.to_string(),
        name: step.to_string(),
        step_type: StepType::LogEvent,
        duration_ms: 1,
        success,
        error: (!success).then(|| "failed".to_string()),
        output: None,
        parent_step: None,
        iteration: None,
        started_at: Utc::now(),
    }
}
