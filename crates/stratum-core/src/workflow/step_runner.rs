//! Step runner for the leaf step types.
//!
//! `StepRunner` dispatches on the `StepConfig` variant. Each handler resolves
//! its templates against the run's `VariableStore`, calls out through the
//! `StepExecutionContext` where external state is involved, and returns a
//! `StepOutput`. The runner never writes to the store; the workflow runner
//! applies `StepOutput::store_as` after a step succeeds.
//!
//! `for_each` is not handled here: iteration needs the run recorder and the
//! mutable store, so the workflow runner drives it.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use stratum_types::data_source::{Aggregation, DataQuery, QueryFilter};
use stratum_types::integration::{IntegrationResult, NotificationMessage};
use stratum_types::strategy::{StrategyTargetType, StrategyUpdateOutcome, UpdateType};
use stratum_types::work_item::{NewWorkItem, WorkItem};
use stratum_types::workflow::{LogLevel, StepConfig, StepDefinition};

use crate::data_source::aggregate;

use super::formula;
use super::relative_date::{is_relative_date, resolve_date};
use super::template::{
    ResolutionError, render, resolve_number, resolve_path_text, resolve_strict, resolve_text,
    resolve_value,
};
use super::variables::{VariableStore, number_to_value, value_to_text};

// ---------------------------------------------------------------------------
// StepOutput
// ---------------------------------------------------------------------------

/// Output from a step execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Recorded in the step log and, when `store_as` is set, bound in the store.
    pub value: Value,
    /// The step's `result_variable`, if configured.
    pub store_as: Option<String>,
}

impl StepOutput {
    fn new(value: Value, store_as: Option<&str>) -> Self {
        Self {
            value,
            store_as: store_as.map(str::to_string),
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors that can occur during step execution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    /// The step's configuration is structurally invalid.
    #[error("{0}")]
    Validation(String),

    /// A template, formula, or typed value could not be resolved.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// An external integration, store, or channel reported a failure.
    #[error("{0}")]
    Adapter(String),

    /// Engine defect or run-level abort (cancellation, timeout).
    #[error("{0}")]
    Fatal(String),
}

// ---------------------------------------------------------------------------
// StepExecutionContext
// ---------------------------------------------------------------------------

pub type StepFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StepError>> + Send + 'a>>;

/// The engine's outbound ports: integrations, the strategy and work-item
/// stores, internal data sources, and notification channels.
///
/// Object-safe so the runner can hold it as `Arc<dyn StepExecutionContext>`.
/// Implementations report external failures as `StepError::Adapter` with the
/// remote message passed through.
pub trait StepExecutionContext: Send + Sync {
    fn invoke_integration(
        &self,
        integration_id: &str,
        action: &str,
        parameters: Value,
        timeout: Option<Duration>,
    ) -> StepFuture<'_, IntegrationResult>;

    fn update_strategy(
        &self,
        target_type: StrategyTargetType,
        target_id: &str,
        update_type: UpdateType,
        value: f64,
    ) -> StepFuture<'_, StrategyUpdateOutcome>;

    /// Records (the `data` of each) matching the query, oldest first.
    fn query_data_source(&self, query: DataQuery) -> StepFuture<'_, Vec<Value>>;

    fn create_work_item(&self, item: NewWorkItem) -> StepFuture<'_, WorkItem>;

    fn send_notification(
        &self,
        channel: &str,
        message: NotificationMessage,
    ) -> StepFuture<'_, ()>;
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes individual workflow steps by dispatching to type-specific handlers.
#[derive(Debug, Clone, Default)]
pub struct StepRunner;

impl StepRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a leaf step and return its output.
    pub async fn run(
        &self,
        step: &StepDefinition,
        store: &VariableStore,
        ctx: &dyn StepExecutionContext,
    ) -> Result<StepOutput, StepError> {
        let store_as = step.config.result_variable();
        match &step.config {
            StepConfig::IntegrationAction {
                integration_id,
                action,
                parameters,
                timeout_secs,
                ..
            } => {
                let params = resolve_parameters(parameters, store)?;
                let result = ctx
                    .invoke_integration(
                        integration_id,
                        action,
                        params,
                        timeout_secs.map(Duration::from_secs),
                    )
                    .await?;
                Ok(StepOutput::new(result.into_value(), store_as))
            }
            StepConfig::StrategyUpdate {
                target_type,
                target_id,
                use_dynamic_target,
                target_id_variable,
                update_type,
                value,
                ..
            } => {
                let target_type = target_type.ok_or_else(|| {
                    StepError::Validation(format!(
                        "step '{}': target_type must be key_result or objective",
                        step.id
                    ))
                })?;
                let id = if *use_dynamic_target {
                    let var = target_id_variable.as_deref().unwrap_or_default();
                    resolve_path_text(var, "target_id_variable", store)?
                } else {
                    resolve_text(target_id.as_deref().unwrap_or_default(), "target_id", store)?
                };
                let amount = resolve_number(value, "value", store)?;
                let outcome = ctx
                    .update_strategy(target_type, &id, *update_type, amount)
                    .await?;
                Ok(StepOutput::new(to_json(&outcome)?, store_as))
            }
            StepConfig::DataSourceQuery {
                source_id,
                filters,
                aggregation,
                aggregate_field,
                limit,
                ..
            } => {
                let query = DataQuery {
                    source_id: resolve_text(source_id, "source_id", store)?,
                    filters: filters
                        .iter()
                        .map(|f| QueryFilter {
                            field: f.field.clone(),
                            operator: f.operator,
                            value: resolve_value(&f.value, store),
                        })
                        .collect(),
                    limit: match aggregation {
                        Aggregation::List => *limit,
                        Aggregation::First => Some(1),
                        _ => None,
                    },
                };
                let records = ctx.query_data_source(query).await?;
                let value = aggregate(records, *aggregation, aggregate_field.as_deref())
                    .map_err(|e| StepError::Validation(format!("step '{}': {e}", step.id)))?;
                Ok(StepOutput::new(value, store_as))
            }
            StepConfig::DataTransformation { formula, .. } => {
                let result = formula::evaluate(formula, store)?;
                Ok(StepOutput::new(number_to_value(result), store_as))
            }
            StepConfig::LogEvent { message, level } => {
                let text = render(message, store);
                emit_workflow_event(*level, store, &text);
                Ok(StepOutput::new(
                    json!({ "level": level.as_str(), "message": text }),
                    None,
                ))
            }
            StepConfig::Notification {
                channel,
                recipient,
                subject,
                message,
                ..
            } => {
                let outgoing = NotificationMessage {
                    recipient: recipient.as_deref().map(|r| render(r, store)),
                    subject: subject.as_deref().map(|s| render(s, store)),
                    message: render(message, store),
                };
                ctx.send_notification(channel, outgoing).await?;
                Ok(StepOutput::new(
                    json!({ "channel": channel, "delivered": true }),
                    None,
                ))
            }
            StepConfig::CreateWorkItem {
                title,
                description,
                status,
                due_date,
                external_reference,
                ..
            } => {
                let title = render(title, store);
                if title.trim().is_empty() {
                    return Err(ResolutionError::Empty {
                        field: "title".to_string(),
                    }
                    .into());
                }
                let due_date = match due_date {
                    Some(expr) => {
                        let text = value_to_text(&resolve_strict(expr, store)?);
                        Some(resolve_date(&text, Utc::now().date_naive())?)
                    }
                    None => None,
                };
                let item = NewWorkItem {
                    title,
                    description: description.as_deref().map(|d| render(d, store)),
                    status: *status,
                    due_date,
                    external_reference: external_reference.as_deref().map(|r| render(r, store)),
                    workflow_run_id: Some(store.run_id()),
                };
                let created = ctx.create_work_item(item).await?;
                Ok(StepOutput::new(to_json(&created)?, store_as))
            }
            StepConfig::ForEach { .. } => Err(StepError::Fatal(format!(
                "step '{}': for_each must be driven by the workflow runner",
                step.id
            ))),
        }
    }
}

/// Resolve integration parameters.
///
/// Values are resolved leniently. A date-named parameter (`date`,
/// `due_date`, `dueDate`) holding a relative expression such as `+3 days`
/// or `today` is replaced by the ISO date it denotes. Every other value,
/// absolute dates and timestamps included, passes through unchanged.
fn resolve_parameters(
    parameters: &std::collections::BTreeMap<String, Value>,
    store: &VariableStore,
) -> Result<Value, StepError> {
    let today = Utc::now().date_naive();
    let mut out = Map::new();
    for (key, raw) in parameters {
        let mut value = resolve_value(raw, store);
        if names_date(key) {
            if let Value::String(text) = &value {
                if is_relative_date(text) {
                    let date = resolve_date(text, today)?;
                    value = Value::String(date.format("%Y-%m-%d").to_string());
                }
            }
        }
        out.insert(key.clone(), value);
    }
    Ok(Value::Object(out))
}

fn names_date(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower == "date" || lower.ends_with("_date") || lower.ends_with("-date") || key.ends_with("Date")
}

fn emit_workflow_event(level: LogLevel, store: &VariableStore, message: &str) {
    let run_id = store.run_id();
    let workflow = store.workflow_name();
    match level {
        LogLevel::Debug => {
            tracing::debug!(target: "stratum::workflow_event", %run_id, workflow, "{message}")
        }
        LogLevel::Info => {
            tracing::info!(target: "stratum::workflow_event", %run_id, workflow, "{message}")
        }
        LogLevel::Warn => {
            tracing::warn!(target: "stratum::workflow_event", %run_id, workflow, "{message}")
        }
        LogLevel::Error => {
            tracing::error!(target: "stratum::workflow_event", %run_id, workflow, "{message}")
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, StepError> {
    serde_json::to_value(value).map_err(|e| StepError::Fatal(format!("serialize output: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
