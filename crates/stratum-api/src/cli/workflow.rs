//! CLI workflow management subcommands.
//!
//! Provides create, validate, list, show, enable, disable, run, runs, logs
//! and delete for workflow definitions and their runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Value, json};
use uuid::Uuid;

use stratum_core::repository::workflow::WorkflowRepository;
use stratum_core::workflow::definition::{WorkflowError, load_workflow_file};
use stratum_core::workflow::scheduler::trigger_cron;
use stratum_types::workflow::{
    ExecutionRun, RunStatus, StepConfig, StepDefinition, TriggerConfig, TriggerSource,
    WebhookAuth, WorkflowDefinition,
};

use crate::state::AppState;

/// Workflow management subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Create (or replace) a workflow from a YAML file.
    Create {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Parse and validate a workflow YAML file without saving it.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// List registered workflows.
    #[command(alias = "ls")]
    List,

    /// Show a workflow definition.
    Show {
        /// Workflow name or UUID.
        target: String,
    },

    /// Enable a workflow so triggers start runs.
    Enable {
        /// Workflow name or UUID.
        name: String,
    },

    /// Disable a workflow; triggers are refused while disabled.
    Disable {
        /// Workflow name or UUID.
        name: String,
    },

    /// Run a workflow to completion and print the outcome.
    Run {
        /// Workflow name or UUID.
        name: String,

        /// JSON object seeded into the run's variables.
        #[arg(long)]
        payload: Option<String>,
    },

    /// Show recent runs for a workflow.
    Runs {
        /// Workflow name or UUID.
        name: String,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Show the execution log of a run.
    Logs {
        /// Workflow run UUID.
        run_id: String,
    },

    /// Delete a workflow and its runs.
    #[command(alias = "rm")]
    Delete {
        /// Workflow name or UUID.
        name: String,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Create { file } => handle_create(&file, state, json).await,
        WorkflowCommand::Validate { file } => handle_validate(&file, state, json),
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Show { target } => handle_show(&target, state, json).await,
        WorkflowCommand::Enable { name } => set_enabled(&name, true, state, json).await,
        WorkflowCommand::Disable { name } => set_enabled(&name, false, state, json).await,
        WorkflowCommand::Run { name, payload } => {
            handle_run(&name, payload.as_deref(), state, json).await
        }
        WorkflowCommand::Runs { name, limit } => handle_runs(&name, limit, state, json).await,
        WorkflowCommand::Logs { run_id } => handle_logs(&run_id, state, json).await,
        WorkflowCommand::Delete { name } => handle_delete(&name, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Create / Validate
// ---------------------------------------------------------------------------

fn load_file(file: &Path, state: &AppState) -> Result<WorkflowDefinition> {
    load_workflow_file(file, state.config.engine.max_loop_depth).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow!("Failed to parse workflow YAML: {msg}"),
        WorkflowError::ValidationError(msg) => anyhow!("Workflow validation failed: {msg}"),
        WorkflowError::IoError(err) => anyhow!("Failed to read {}: {err}", file.display()),
    })
}

async fn handle_create(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let mut def = load_file(file, state)?;

    // Re-creating a workflow by name replaces it in place.
    let existing = state
        .workflow_repo
        .get_definition_by_name(&def.name)
        .await
        .map_err(|e| anyhow!("Failed to look up workflow: {e}"))?;
    let replaced = existing.is_some();
    if let Some(existing) = existing {
        def.id = existing.id;
    }

    state
        .workflow_repo
        .save_definition(&def)
        .await
        .map_err(|e| anyhow!("Failed to save workflow: {e}"))?;

    if json {
        let out = json!({
            "id": def.id.to_string(),
            "name": def.name,
            "steps": def.steps.len(),
            "trigger": def.trigger_type().as_str(),
            "replaced": replaced,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} {} workflow '{}'",
            style("*").green().bold(),
            if replaced { "Updated" } else { "Created" },
            style(&def.name).cyan()
        );
        println!("  ID: {}", def.id);
        println!("  Steps: {}", def.steps.len());
        println!("  Trigger: {}", describe_trigger(&def.trigger));
        println!();
    }

    Ok(())
}

fn handle_validate(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = load_file(file, state)?;

    if json {
        let out = json!({
            "valid": true,
            "name": def.name,
            "steps": count_steps(&def.steps),
            "trigger": def.trigger_type().as_str(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} '{}' is valid ({} steps, {} trigger)",
            style("✓").green(),
            style(&def.name).cyan(),
            count_steps(&def.steps),
            def.trigger_type()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// List / Show
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .workflow_repo
        .list_definitions()
        .await
        .map_err(|e| anyhow!("Failed to list workflows: {e}"))?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                json!({
                    "id": d.id.to_string(),
                    "name": d.name,
                    "enabled": d.is_enabled,
                    "trigger": d.trigger_type().as_str(),
                    "steps": d.steps.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows registered.");
        println!(
            "  Create one with: {}",
            style("stratum workflow create <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Enabled"),
            Cell::new("Trigger"),
            Cell::new("Steps"),
            Cell::new("ID"),
        ]);

    for d in &defs {
        let enabled = if d.is_enabled {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(&d.name),
            enabled,
            Cell::new(describe_trigger(&d.trigger)),
            Cell::new(d.steps.len()),
            Cell::new(d.id),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

async fn handle_show(target: &str, state: &AppState, json: bool) -> Result<()> {
    let def = find_workflow(target, state).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&def)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Workflow:").bold(), style(&def.name).cyan());
    println!("  ID: {}", def.id);
    if let Some(desc) = &def.description {
        println!("  Description: {desc}");
    }
    println!(
        "  Enabled: {}",
        if def.is_enabled {
            style("yes").green()
        } else {
            style("no").dim()
        }
    );
    println!("  Trigger: {}", describe_trigger(&def.trigger));
    println!();
    println!("  {}", style("Steps:").bold());
    print_steps(&def.steps, 1);
    println!();

    Ok(())
}

fn print_steps(steps: &[StepDefinition], depth: usize) {
    let indent = "  ".repeat(depth + 1);
    for (i, step) in steps.iter().enumerate() {
        println!(
            "{indent}{}. {} {} {}",
            i + 1,
            style(&step.id).cyan(),
            step.name,
            style(format!("[{}]", step.step_type())).dim()
        );
        if let StepConfig::ForEach { child_steps, .. } = &step.config {
            print_steps(child_steps, depth + 1);
        }
    }
}

// ---------------------------------------------------------------------------
// Enable / Disable
// ---------------------------------------------------------------------------

async fn set_enabled(name: &str, enabled: bool, state: &AppState, json: bool) -> Result<()> {
    let mut def = find_workflow(name, state).await?;
    let changed = def.is_enabled != enabled;
    if changed {
        def.is_enabled = enabled;
        state
            .workflow_repo
            .save_definition(&def)
            .await
            .map_err(|e| anyhow!("Failed to update workflow: {e}"))?;
    }

    let verb = if enabled { "enabled" } else { "disabled" };
    if json {
        println!(
            "{}",
            json!({"name": def.name, "enabled": enabled, "changed": changed})
        );
    } else if changed {
        println!();
        println!(
            "  {} Workflow '{}' {verb}",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        println!();
    } else {
        println!();
        println!("  Workflow '{}' is already {verb}.", style(&def.name).cyan());
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

async fn handle_run(
    name: &str,
    payload: Option<&str>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let def = find_workflow(name, state).await?;
    let payload = parse_payload(payload)?;

    let outcome = state
        .dispatcher
        .start_run_and_wait(def.id, TriggerSource::Manual, payload)
        .await
        .with_context(|| format!("Failed to run workflow '{}'", def.name))?;

    if json {
        let out = json!({
            "run_id": outcome.run_id.to_string(),
            "workflow_name": def.name,
            "status": outcome.status.as_str(),
            "steps_completed": outcome.steps_completed,
            "duration_ms": outcome.duration_ms,
            "result_data": outcome.result_data,
            "error": outcome.error,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Workflow '{}' {}",
            match outcome.status {
                RunStatus::Completed => style("*").green().bold(),
                _ => style("!").red().bold(),
            },
            style(&def.name).cyan(),
            outcome.status
        );
        println!("  Run ID: {}", outcome.run_id);
        println!("  Steps completed: {}/{}", outcome.steps_completed, def.steps.len());
        println!("  Duration: {}ms", outcome.duration_ms);
        if let Some(err) = &outcome.error {
            println!("  Error: {}", style(err).red());
        }
        println!();
        println!(
            "  Step log: {}",
            style(format!("stratum workflow logs {}", outcome.run_id)).dim()
        );
        println!();
    }

    if outcome.status == RunStatus::Failed {
        bail!("workflow run {} failed", outcome.run_id);
    }
    Ok(())
}

fn parse_payload(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(json!({}));
    };
    let value: Value = serde_json::from_str(raw).context("Invalid JSON payload")?;
    if !value.is_object() {
        bail!("Payload must be a JSON object");
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

async fn handle_runs(name: &str, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let def = find_workflow(name, state).await?;
    let runs = state
        .workflow_repo
        .list_runs(&def.id, limit)
        .await
        .map_err(|e| anyhow!("Failed to list runs: {e}"))?;

    if json {
        let out: Vec<_> = runs
            .iter()
            .map(|r| {
                json!({
                    "run_id": r.id.to_string(),
                    "status": r.status.as_str(),
                    "trigger": r.trigger_source.as_str(),
                    "started_at": r.started_at.to_rfc3339(),
                    "completed_at": r.completed_at.map(|t| t.to_rfc3339()),
                    "duration_ms": r.execution_duration_ms,
                    "steps_completed": r.steps_completed,
                    "error": r.error_message,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs for workflow '{}'.", def.name);
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Trigger"),
            Cell::new("Started"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for r in &runs {
        let duration = r
            .execution_duration_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(r.id),
            format_status(r.status),
            Cell::new(r.trigger_source),
            Cell::new(r.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(duration),
            Cell::new(truncate(r.error_message.as_deref().unwrap_or("-"), 40)),
        ]);
    }

    println!();
    println!("  Runs for workflow '{}'", style(&def.name).cyan());
    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

async fn handle_logs(run_id_str: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id: Uuid = run_id_str
        .parse()
        .with_context(|| format!("Invalid run ID: '{run_id_str}'"))?;

    let run = state
        .workflow_repo
        .get_run(&run_id)
        .await
        .map_err(|e| anyhow!("Failed to get run: {e}"))?
        .ok_or_else(|| anyhow!("Run '{run_id_str}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    print_run_header(&run);

    if run.execution_log.is_empty() {
        println!("  No steps recorded.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Type"),
            Cell::new("Result"),
            Cell::new("Duration"),
            Cell::new("Detail"),
        ]);

    for entry in &run.execution_log {
        let step = match (&entry.parent_step, entry.iteration) {
            (Some(_), Some(i)) => format!("  └ {} [{i}]", entry.step),
            _ => entry.step.clone(),
        };
        let result = if entry.success {
            Cell::new("ok").fg(Color::Green)
        } else {
            Cell::new("failed").fg(Color::Red)
        };
        let detail = match (&entry.error, &entry.output) {
            (Some(err), _) => err.clone(),
            (None, Some(output)) => output.to_string(),
            (None, None) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(step),
            Cell::new(&entry.name),
            Cell::new(entry.step_type),
            result,
            Cell::new(format!("{}ms", entry.duration_ms)),
            Cell::new(truncate(&detail, 60)),
        ]);
    }

    println!("{table}");
    println!();

    Ok(())
}

fn print_run_header(run: &ExecutionRun) {
    println!();
    println!(
        "  {} {} ({})",
        style("Run").bold(),
        style(run.id).cyan(),
        style(&run.workflow_name).cyan()
    );
    println!("  Status: {}", run.status);
    println!("  Trigger: {}", run.trigger_source);
    println!("  Started: {}", run.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref err) = run.error_message {
        println!("  Error: {}", style(err).red());
    }
    println!();
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

async fn handle_delete(name: &str, state: &AppState, json: bool) -> Result<()> {
    let def = find_workflow(name, state).await?;

    let deleted = state
        .workflow_repo
        .delete_definition(&def.id)
        .await
        .map_err(|e| anyhow!("Failed to delete workflow: {e}"))?;

    if !deleted {
        bail!("Workflow '{}' could not be deleted (not found in repository)", def.name);
    }

    if json {
        println!(
            "{}",
            json!({"deleted": def.name, "id": def.id.to_string()})
        );
    } else {
        println!();
        println!(
            "  {} Deleted workflow '{}'",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Look a workflow up by UUID, falling back to its name.
async fn find_workflow(target: &str, state: &AppState) -> Result<WorkflowDefinition> {
    if let Ok(id) = target.parse::<Uuid>() {
        if let Some(def) = state
            .workflow_repo
            .get_definition(&id)
            .await
            .map_err(|e| anyhow!("Failed to look up workflow: {e}"))?
        {
            return Ok(def);
        }
    }

    state
        .workflow_repo
        .get_definition_by_name(target)
        .await
        .map_err(|e| anyhow!("Failed to look up workflow: {e}"))?
        .ok_or_else(|| anyhow!("Workflow '{target}' not found"))
}

fn describe_trigger(trigger: &TriggerConfig) -> String {
    match trigger {
        TriggerConfig::Manual {} => "manual".to_string(),
        TriggerConfig::Schedule { cron, frequency } => {
            match trigger_cron(trigger) {
                Ok(Some(expr)) => format!("schedule ({expr})"),
                _ => format!("schedule (invalid: {cron:?} {frequency:?})"),
            }
        }
        TriggerConfig::Webhook { identifier, auth } => {
            let auth = match auth {
                Some(WebhookAuth::HmacSha256 { .. }) => ", hmac",
                Some(WebhookAuth::BearerToken { .. }) => ", bearer",
                None => "",
            };
            format!("webhook /api/v1/webhooks/{identifier}{auth}")
        }
    }
}

fn count_steps(steps: &[StepDefinition]) -> usize {
    steps
        .iter()
        .map(|s| match &s.config {
            StepConfig::ForEach { child_steps, .. } => 1 + count_steps(child_steps),
            _ => 1,
        })
        .sum()
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

fn format_status(status: RunStatus) -> Cell {
    match status {
        RunStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        RunStatus::Running => Cell::new("running").fg(Color::Blue),
        RunStatus::Completed => Cell::new("completed").fg(Color::Green),
        RunStatus::Failed => Cell::new("failed").fg(Color::Red),
    }
}
