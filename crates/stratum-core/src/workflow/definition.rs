//! Workflow definition parsing, repair, and validation.
//!
//! Loads `WorkflowDefinition`s from YAML, applies the legacy
//! repair rule, and validates structural constraints (unique IDs across
//! nested steps, trigger requirements, loop depth, per-step required
//! fields).

use std::collections::HashSet;
use std::path::Path;

use stratum_types::strategy::StrategyTargetType;
use stratum_types::workflow::{StepConfig, StepDefinition, TriggerConfig, WebhookAuth, WorkflowDefinition};
use thiserror::Error;

use super::formula::Formula;
use super::relative_date::resolve_date;
use super::scheduler::{parse_cron, trigger_cron};
use super::template::references;
use super::variables::{CURRENT_ITEM, TRIGGER};

/// Default maximum `for_each` nesting depth.
pub const DEFAULT_MAX_LOOP_DEPTH: usize = 3;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during workflow definition operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

fn invalid(msg: impl Into<String>) -> WorkflowError {
    WorkflowError::ValidationError(msg.into())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a repaired, validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(
    yaml: &str,
    max_loop_depth: usize,
) -> Result<WorkflowDefinition, WorkflowError> {
    let mut def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    let repaired = repair_legacy_steps(&mut def);
    if repaired > 0 {
        tracing::info!(workflow = %def.name, repaired, "defaulted strategy_update target_type to key_result");
    }
    validate_definition(&def, max_loop_depth)?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Repair
// ---------------------------------------------------------------------------

/// Default-fill `target_type = key_result` on `strategy_update` steps that
/// lack it, including inside `for_each` children.
///
/// Applied once when a definition is loaded. Returns the number of steps
/// repaired.
pub fn repair_legacy_steps(def: &mut WorkflowDefinition) -> usize {
    fn repair(steps: &mut [StepDefinition]) -> usize {
        let mut count = 0;
        for step in steps {
            match &mut step.config {
                StepConfig::StrategyUpdate { target_type, .. } if target_type.is_none() => {
                    *target_type = Some(StrategyTargetType::KeyResult);
                    count += 1;
                }
                StepConfig::ForEach { child_steps, .. } => count += repair(child_steps),
                _ => {}
            }
        }
        count
    }
    repair(&mut def.steps)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, hyphens, underscores
/// - At least one step exists
/// - Step IDs are non-empty and unique across all nesting levels
/// - Schedule triggers resolve to a valid cron; webhook triggers have an identifier
/// - `for_each` nesting does not exceed `max_loop_depth`
/// - Every step passes [`validate_step`]
pub fn validate_definition(
    def: &WorkflowDefinition,
    max_loop_depth: usize,
) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(invalid("workflow name must not be empty"));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(format!(
            "workflow name '{}' contains invalid characters (only alphanumerics, hyphens and underscores allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(invalid("workflow must have at least one step"));
    }

    validate_trigger(&def.trigger)?;

    let mut seen_ids = HashSet::new();
    validate_steps(&def.steps, 0, max_loop_depth, &mut seen_ids)
}

fn validate_trigger(trigger: &TriggerConfig) -> Result<(), WorkflowError> {
    match trigger {
        TriggerConfig::Manual {} => Ok(()),
        TriggerConfig::Schedule { .. } => {
            let cron = trigger_cron(trigger)
                .map_err(|e| invalid(e.to_string()))?
                .ok_or_else(|| invalid("schedule trigger has no cron expression"))?;
            parse_cron(&cron).map_err(|e| invalid(e.to_string()))?;
            Ok(())
        }
        TriggerConfig::Webhook { identifier, auth } => {
            if identifier.is_empty()
                || !identifier
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(invalid(format!(
                    "webhook identifier '{identifier}' must be non-empty and contain only ASCII alphanumerics, hyphens and underscores"
                )));
            }
            let env_name = match auth {
                Some(WebhookAuth::HmacSha256 { secret_env }) => Some(secret_env),
                Some(WebhookAuth::BearerToken { token_env }) => Some(token_env),
                None => None,
            };
            if env_name.is_some_and(|e| e.trim().is_empty()) {
                return Err(invalid("webhook auth must name an environment variable"));
            }
            Ok(())
        }
    }
}

fn validate_steps<'a>(
    steps: &'a [StepDefinition],
    depth: usize,
    max_loop_depth: usize,
    seen_ids: &mut HashSet<&'a str>,
) -> Result<(), WorkflowError> {
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(invalid("step ID must not be empty"));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(invalid(format!("duplicate step ID: '{}'", step.id)));
        }
        validate_step(step)?;

        if let StepConfig::ForEach { child_steps, .. } = &step.config {
            if depth + 1 > max_loop_depth {
                return Err(invalid(format!(
                    "for_each step '{}' exceeds maximum loop nesting depth {max_loop_depth}",
                    step.id
                )));
            }
            validate_steps(child_steps, depth + 1, max_loop_depth, seen_ids)?;
        }
    }
    Ok(())
}

/// Check a single step's required-fields contract.
///
/// Only static configuration is checked; template references are resolved
/// when the step executes. The runner calls this immediately before each
/// step runs.
pub fn validate_step(step: &StepDefinition) -> Result<(), WorkflowError> {
    let id = &step.id;
    let required = |value: &str, field: &str| {
        if value.trim().is_empty() {
            Err(invalid(format!("step '{id}': {field} is required")))
        } else {
            Ok(())
        }
    };

    if let Some(var) = step.config.result_variable() {
        if var.is_empty()
            || var == CURRENT_ITEM
            || var == TRIGGER
            || !var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid(format!(
                "step '{id}': result_variable '{var}' is not a valid variable name"
            )));
        }
    }

    match &step.config {
        StepConfig::IntegrationAction {
            integration_id,
            action,
            timeout_secs,
            ..
        } => {
            required(integration_id, "integration_id")?;
            required(action, "action")?;
            if *timeout_secs == Some(0) {
                return Err(invalid(format!("step '{id}': timeout_secs must be > 0")));
            }
        }
        StepConfig::StrategyUpdate {
            target_type,
            target_id,
            use_dynamic_target,
            target_id_variable,
            value,
            ..
        } => {
            if target_type.is_none() {
                return Err(invalid(format!(
                    "step '{id}': target_type must be key_result or objective"
                )));
            }
            if *use_dynamic_target {
                required(target_id_variable.as_deref().unwrap_or(""), "target_id_variable")?;
            } else {
                required(target_id.as_deref().unwrap_or(""), "target_id")?;
            }
            if value.is_null() {
                return Err(invalid(format!("step '{id}': value is required")));
            }
        }
        StepConfig::DataSourceQuery {
            source_id,
            filters,
            aggregation,
            aggregate_field,
            limit,
            ..
        } => {
            required(source_id, "source_id")?;
            for filter in filters {
                required(&filter.field, "filter field")?;
            }
            use stratum_types::data_source::Aggregation;
            if matches!(aggregation, Aggregation::Sum | Aggregation::Avg) {
                required(aggregate_field.as_deref().unwrap_or(""), "aggregate_field")?;
            }
            if *limit == Some(0) {
                return Err(invalid(format!("step '{id}': limit must be > 0")));
            }
        }
        StepConfig::DataTransformation { formula, .. } => {
            required(formula, "formula")?;
            Formula::parse(formula).map_err(|e| invalid(format!("step '{id}': {e}")))?;
        }
        StepConfig::LogEvent { message, .. } => required(message, "message")?,
        StepConfig::Notification {
            channel, message, ..
        } => {
            required(channel, "channel")?;
            required(message, "message")?;
        }
        StepConfig::CreateWorkItem {
            title, due_date, ..
        } => {
            required(title, "title")?;
            if let Some(due) = due_date {
                // Templated dates can only be checked once resolved.
                if references(due).is_empty() {
                    resolve_date(due, chrono::Utc::now().date_naive())
                        .map_err(|e| invalid(format!("step '{id}': {e}")))?;
                }
            }
        }
        StepConfig::ForEach {
            source_variable,
            child_steps,
        } => {
            required(source_variable, "source_variable")?;
            if child_steps.is_empty() {
                return Err(invalid(format!(
                    "for_each step '{id}' must have at least one child step"
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(
    path: &Path,
    max_loop_depth: usize,
) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content, max_loop_depth)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stratum_types::data_source::Aggregation;
    use stratum_types::strategy::UpdateType;
    use stratum_types::work_item::WorkItemStatus;
    use stratum_types::workflow::{LogLevel, ScheduleFrequency};
    use uuid::Uuid;

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "test-flow".to_string(),
            description: None,
            is_enabled: true,
            trigger: TriggerConfig::Manual {},
            steps,
        }
    }

    fn log_step(id: &str) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::LogEvent {
                message: "hello".to_string(),
                level: LogLevel::Info,
            },
        }
    }

    fn for_each(id: &str, children: Vec<StepDefinition>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::ForEach {
                source_variable: "items".to_string(),
                child_steps: children,
            },
        }
    }

    fn strategy_step(id: &str, target_type: Option<StrategyTargetType>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::StrategyUpdate {
                target_type,
                target_id: Some("kr-1".to_string()),
                use_dynamic_target: false,
                target_id_variable: None,
                update_type: UpdateType::SetValue,
                value: json!("{count}"),
                result_variable: None,
            },
        }
    }

    // -----------------------------------------------------------------------
    // Parsing and repair
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_yaml_repairs_and_validates() {
        let yaml = r#"
name: okr-sync
steps:
  - id: loop
    name: Loop
    config:
      type: for_each
      source_variable: rows
      child_steps:
        - id: bump
          name: Bump
          config:
            type: strategy_update
            target_id: kr-7
            update_type: increment
            value: 1
"#;
        let def = parse_workflow_yaml(yaml, DEFAULT_MAX_LOOP_DEPTH).unwrap();
        match &def.steps[0].config {
            StepConfig::ForEach { child_steps, .. } => match &child_steps[0].config {
                StepConfig::StrategyUpdate { target_type, .. } => {
                    assert_eq!(*target_type, Some(StrategyTargetType::KeyResult));
                }
                other => panic!("expected strategy_update, got {other:?}"),
            },
            other => panic!("expected for_each, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_yaml_rejects_bad_yaml() {
        let err = parse_workflow_yaml("name: [unclosed", DEFAULT_MAX_LOOP_DEPTH).unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[test]
    fn test_repair_counts_and_leaves_explicit_types() {
        let mut def = workflow(vec![
            strategy_step("a", None),
            strategy_step("b", Some(StrategyTargetType::Objective)),
            for_each("loop", vec![strategy_step("c", None)]),
        ]);
        assert_eq!(repair_legacy_steps(&mut def), 2);
        assert_eq!(repair_legacy_steps(&mut def), 0);
        match &def.steps[1].config {
            StepConfig::StrategyUpdate { target_type, .. } => {
                assert_eq!(*target_type, Some(StrategyTargetType::Objective))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_yaml_roundtrip() {
        let def = workflow(vec![log_step("a"), for_each("loop", vec![log_step("b")])]);
        let yaml = serde_yaml_ng::to_string(&def).unwrap();
        let parsed = parse_workflow_yaml(&yaml, DEFAULT_MAX_LOOP_DEPTH).unwrap();
        assert_eq!(parsed.id, def.id);
        assert_eq!(parsed.steps, def.steps);
    }

    // -----------------------------------------------------------------------
    // Definition validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_validate_rejects_empty_steps_and_bad_name() {
        assert!(validate_definition(&workflow(vec![]), 3).is_err());
        let mut def = workflow(vec![log_step("a")]);
        def.name = "bad name!".to_string();
        assert!(validate_definition(&def, 3).is_err());
    }

    #[test]
    fn test_validate_duplicate_ids_across_nesting() {
        let def = workflow(vec![log_step("a"), for_each("loop", vec![log_step("a")])]);
        let err = validate_definition(&def, 3).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID: 'a'"));
    }

    #[test]
    fn test_validate_loop_depth() {
        let nested = for_each(
            "l1",
            vec![for_each("l2", vec![for_each("l3", vec![log_step("leaf")])])],
        );
        assert!(validate_definition(&workflow(vec![nested.clone()]), 3).is_ok());
        let err = validate_definition(&workflow(vec![nested]), 2).unwrap_err();
        assert!(err.to_string().contains("'l3' exceeds maximum loop nesting depth 2"));
    }

    #[test]
    fn test_validate_schedule_trigger() {
        let mut def = workflow(vec![log_step("a")]);
        def.trigger = TriggerConfig::Schedule {
            cron: None,
            frequency: None,
        };
        assert!(validate_definition(&def, 3).is_err());

        def.trigger = TriggerConfig::Schedule {
            cron: Some("0 9 * * 1-5".to_string()),
            frequency: None,
        };
        assert!(validate_definition(&def, 3).is_ok());

        def.trigger = TriggerConfig::Schedule {
            cron: None,
            frequency: Some(ScheduleFrequency::Daily {
                time: "7:45".to_string(),
            }),
        };
        assert!(validate_definition(&def, 3).is_ok());

        def.trigger = TriggerConfig::Schedule {
            cron: Some("every tuesday".to_string()),
            frequency: None,
        };
        assert!(validate_definition(&def, 3).is_err());
    }

    #[test]
    fn test_validate_webhook_trigger() {
        let mut def = workflow(vec![log_step("a")]);
        def.trigger = TriggerConfig::Webhook {
            identifier: String::new(),
            auth: None,
        };
        assert!(validate_definition(&def, 3).is_err());

        def.trigger = TriggerConfig::Webhook {
            identifier: "new-lead".to_string(),
            auth: Some(WebhookAuth::BearerToken {
                token_env: "LEAD_TOKEN".to_string(),
            }),
        };
        assert!(validate_definition(&def, 3).is_ok());
    }

    // -----------------------------------------------------------------------
    // Step validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_validate_strategy_update_target_rules() {
        assert!(validate_step(&strategy_step("s", None)).is_err());
        assert!(validate_step(&strategy_step("s", Some(StrategyTargetType::KeyResult))).is_ok());

        let dynamic_missing_var = StepDefinition {
            id: "d".to_string(),
            name: "d".to_string(),
            config: StepConfig::StrategyUpdate {
                target_type: Some(StrategyTargetType::Objective),
                target_id: None,
                use_dynamic_target: true,
                target_id_variable: None,
                update_type: UpdateType::Percentage,
                value: json!(50),
                result_variable: None,
            },
        };
        let err = validate_step(&dynamic_missing_var).unwrap_err();
        assert!(err.to_string().contains("target_id_variable is required"));
    }

    #[test]
    fn test_validate_formula_syntax() {
        let step = StepDefinition {
            id: "calc".to_string(),
            name: "calc".to_string(),
            config: StepConfig::DataTransformation {
                formula: "{a} + * 2".to_string(),
                result_variable: Some("out".to_string()),
            },
        };
        let err = validate_step(&step).unwrap_err();
        assert!(err.to_string().contains("position 7"), "{err}");
    }

    #[test]
    fn test_validate_sum_requires_field() {
        let step = StepDefinition {
            id: "q".to_string(),
            name: "q".to_string(),
            config: StepConfig::DataSourceQuery {
                source_id: "deals".to_string(),
                filters: vec![],
                aggregation: Aggregation::Sum,
                aggregate_field: None,
                limit: None,
                result_variable: None,
            },
        };
        assert!(validate_step(&step).is_err());
    }

    #[test]
    fn test_validate_work_item_due_date() {
        let mut step = StepDefinition {
            id: "w".to_string(),
            name: "w".to_string(),
            config: StepConfig::CreateWorkItem {
                title: "Call back".to_string(),
                description: None,
                status: WorkItemStatus::Todo,
                due_date: Some("+two days".to_string()),
                external_reference: None,
                result_variable: None,
            },
        };
        assert!(validate_step(&step).is_err());

        if let StepConfig::CreateWorkItem { due_date, .. } = &mut step.config {
            *due_date = Some("{{ currentItem.due }}".to_string());
        }
        assert!(validate_step(&step).is_ok());
    }

    #[test]
    fn test_validate_reserved_result_variable() {
        let step = StepDefinition {
            id: "calc".to_string(),
            name: "calc".to_string(),
            config: StepConfig::DataTransformation {
                formula: "1 + 1".to_string(),
                result_variable: Some("currentItem".to_string()),
            },
        };
        assert!(validate_step(&step).is_err());
    }

    // -----------------------------------------------------------------------
    // Filesystem
    // -----------------------------------------------------------------------

    #[test]
    fn test_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        let def = workflow(vec![log_step("a")]);
        std::fs::write(&path, serde_yaml_ng::to_string(&def).unwrap()).unwrap();

        let loaded = load_workflow_file(&path, DEFAULT_MAX_LOOP_DEPTH).unwrap();
        assert_eq!(loaded.name, "test-flow");

        let missing = load_workflow_file(&dir.path().join("missing.yaml"), DEFAULT_MAX_LOOP_DEPTH);
        assert!(matches!(missing, Err(WorkflowError::IoError(_))));
    }
}
