//! Workflow domain types for stratum.
//!
//! Defines the persisted workflow definition (trigger plus an ordered list of
//! typed steps) and the execution tracking types (`ExecutionRun`,
//! `StepLogEntry`) produced by the runner. YAML files, the CLI and the HTTP
//! API all convert to and from `WorkflowDefinition`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::data_source::{Aggregation, QueryFilter};
use crate::strategy::{StrategyTargetType, UpdateType};
use crate::work_item::WorkItemStatus;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A user-authored automation: one trigger and an ordered list of steps.
///
/// Step order is execution order. The runner never reorders steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned when the definition is first parsed.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Unique, human-readable workflow name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Disabled workflows are never dispatched.
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default)]
    pub trigger: TriggerConfig,
    pub steps: Vec<StepDefinition>,
}

fn default_enabled() -> bool {
    true
}

impl WorkflowDefinition {
    pub fn trigger_type(&self) -> TriggerType {
        self.trigger.trigger_type()
    }
}

// ---------------------------------------------------------------------------
// Trigger Configuration
// ---------------------------------------------------------------------------

/// The three ways a workflow can be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Schedule,
    Webhook,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Schedule => "schedule",
            TriggerType::Webhook => "webhook",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a workflow is triggered.
///
/// Internally tagged by `type`:
/// ```yaml
/// trigger:
///   type: schedule
///   frequency:
///     every: daily
///     time: "09:00"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Started from the CLI or API only.
    Manual {},
    /// Fired on a schedule. Either `cron` or `frequency` must be set; `cron`
    /// wins when both are.
    Schedule {
        /// Standard 5-field `minute hour day month weekday` expression.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cron: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frequency: Option<ScheduleFrequency>,
    },
    /// Fired by `POST /api/v1/webhooks/{identifier}`.
    Webhook {
        identifier: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<WebhookAuth>,
    },
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig::Manual {}
    }
}

impl TriggerConfig {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerConfig::Manual {} => TriggerType::Manual,
            TriggerConfig::Schedule { .. } => TriggerType::Schedule,
            TriggerConfig::Webhook { .. } => TriggerType::Webhook,
        }
    }
}

/// The frequency/time/day schedule model a UI edits, convertible to cron.
///
/// `time` is `HH:MM` in 24-hour form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "every", rename_all = "snake_case")]
pub enum ScheduleFrequency {
    Hourly {
        #[serde(default)]
        minute: u8,
    },
    Daily {
        time: String,
    },
    Weekly {
        day: DayOfWeek,
        time: String,
    },
    Monthly {
        day_of_month: u8,
        time: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayOfWeek {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl DayOfWeek {
    /// Cron weekday number (Sunday = 0).
    pub fn cron_index(&self) -> u8 {
        match self {
            DayOfWeek::Sunday => 0,
            DayOfWeek::Monday => 1,
            DayOfWeek::Tuesday => 2,
            DayOfWeek::Wednesday => 3,
            DayOfWeek::Thursday => 4,
            DayOfWeek::Friday => 5,
            DayOfWeek::Saturday => 6,
        }
    }
}

/// Authentication required on an incoming webhook.
///
/// Secrets are never stored in the definition, only the name of the
/// environment variable that holds them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookAuth {
    /// `X-Signature-256: sha256=<hex>` over the raw body.
    HmacSha256 { secret_env: String },
    /// `Authorization: Bearer <token>`.
    BearerToken { token_env: String },
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step. The step kind is carried by the `type` tag of `config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow, including nested child lists.
    pub id: String,
    /// Display-only name.
    pub name: String,
    pub config: StepConfig,
}

impl StepDefinition {
    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }
}

/// The closed set of step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    IntegrationAction,
    StrategyUpdate,
    DataSourceQuery,
    DataTransformation,
    LogEvent,
    Notification,
    CreateWorkItem,
    ForEach,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::IntegrationAction => "integration_action",
            StepType::StrategyUpdate => "strategy_update",
            StepType::DataSourceQuery => "data_source_query",
            StepType::DataTransformation => "data_transformation",
            StepType::LogEvent => "log_event",
            StepType::Notification => "notification",
            StepType::CreateWorkItem => "create_work_item",
            StepType::ForEach => "for_each",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step-specific configuration, internally tagged by `type`:
/// ```yaml
/// config:
///   type: data_transformation
///   formula: "{won} / {total} * 100"
///   result_variable: win_rate
/// ```
///
/// String fields may contain `{name}` or `{{ currentItem.field }}` templates;
/// they are resolved against the run's variables when the step executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Call an external integration adapter.
    IntegrationAction {
        integration_id: String,
        action: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        parameters: BTreeMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_variable: Option<String>,
        /// Overrides the integration's timeout for this step.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// Write to a key result or objective.
    StrategyUpdate {
        /// Missing on legacy definitions; repaired to `key_result` at load.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_type: Option<StrategyTargetType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default)]
        use_dynamic_target: bool,
        /// Variable path holding the target id when `use_dynamic_target`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id_variable: Option<String>,
        update_type: UpdateType,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_variable: Option<String>,
    },
    /// Filter and aggregate an internal data table.
    DataSourceQuery {
        source_id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        filters: Vec<QueryFilter>,
        #[serde(default)]
        aggregation: Aggregation,
        /// Field summed or averaged by `sum`/`avg`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aggregate_field: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_variable: Option<String>,
    },
    /// Evaluate a `+ - * /` formula over variables.
    DataTransformation {
        formula: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_variable: Option<String>,
    },
    /// Emit a message for observability.
    LogEvent {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },
    /// Send a message through a notification channel.
    Notification {
        #[serde(default = "default_channel")]
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        message: String,
        /// Overrides `engine.notifications_best_effort` for this step.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        best_effort: Option<bool>,
    },
    /// Create a work item (task).
    CreateWorkItem {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default)]
        status: WorkItemStatus,
        /// ISO date, `today`, or `+N days` relative to execution time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        due_date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_reference: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_variable: Option<String>,
    },
    /// Run `child_steps` once per element of the list in `source_variable`,
    /// with `currentItem` bound to the element.
    ForEach {
        source_variable: String,
        #[serde(default)]
        child_steps: Vec<StepDefinition>,
    },
}

fn default_channel() -> String {
    "log".to_string()
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::IntegrationAction { .. } => StepType::IntegrationAction,
            StepConfig::StrategyUpdate { .. } => StepType::StrategyUpdate,
            StepConfig::DataSourceQuery { .. } => StepType::DataSourceQuery,
            StepConfig::DataTransformation { .. } => StepType::DataTransformation,
            StepConfig::LogEvent { .. } => StepType::LogEvent,
            StepConfig::Notification { .. } => StepType::Notification,
            StepConfig::CreateWorkItem { .. } => StepType::CreateWorkItem,
            StepConfig::ForEach { .. } => StepType::ForEach,
        }
    }

    /// The variable this step writes its output to, if any.
    pub fn result_variable(&self) -> Option<&str> {
        match self {
            StepConfig::IntegrationAction { result_variable, .. }
            | StepConfig::StrategyUpdate { result_variable, .. }
            | StepConfig::DataSourceQuery { result_variable, .. }
            | StepConfig::DataTransformation { result_variable, .. }
            | StepConfig::CreateWorkItem { result_variable, .. } => result_variable.as_deref(),
            StepConfig::LogEvent { .. }
            | StepConfig::Notification { .. }
            | StepConfig::ForEach { .. } => None,
        }
    }
}

/// Severity of a `log_event` step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Execution Run
// ---------------------------------------------------------------------------

/// Status of an execution run.
///
/// `Pending -> Running -> {Completed, Failed}`. Cancellation and timeouts
/// end in `Failed` with a message rather than a state of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Schedule,
    Webhook,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Schedule => "schedule",
            TriggerSource::Webhook => "webhook",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end invocation of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Denormalized for display.
    pub workflow_name: String,
    pub status: RunStatus,
    pub trigger_source: TriggerSource,
    /// The initial context the run was seeded with.
    #[serde(default)]
    pub trigger_payload: Value,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_duration_ms: Option<u64>,
    /// Top-level steps reached, including a failing one.
    #[serde(default)]
    pub steps_completed: u32,
    /// Step log entries in execution order.
    #[serde(default)]
    pub execution_log: Vec<StepLogEntry>,
    /// Final variable snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Log entry for one executed step.
///
/// Children of a `for_each` appear as sibling entries after their parent's
/// earlier siblings, tagged with `parent_step` and a 0-based `iteration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    /// Step ID matching `StepDefinition.id`.
    pub step: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
