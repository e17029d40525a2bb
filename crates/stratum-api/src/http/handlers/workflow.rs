//! Workflow CRUD and execution handlers for the REST API.
//!
//! Endpoints for managing workflow definitions, triggering runs, and
//! inspecting run status with step-level logs. `GET /runs/{run_id}` is the
//! polling surface for a run started through `trigger`.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use stratum_core::repository::workflow::WorkflowRepository;
use stratum_core::workflow::definition::{repair_legacy_steps, validate_definition};
use stratum_types::workflow::{ExecutionRun, TriggerSource, WorkflowDefinition};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestMeta};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

/// Query parameters for listing workflow runs.
#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    /// Maximum number of runs to return (default 20).
    #[serde(default = "default_run_limit")]
    pub limit: u32,
}

fn default_run_limit() -> u32 {
    20
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn load_workflow(state: &AppState, id: &Uuid) -> Result<WorkflowDefinition, AppError> {
    state
        .workflow_repo
        .get_definition(id)
        .await?
        .ok_or_else(|| AppError::workflow_not_found(id))
}

async fn load_run(state: &AppState, run_id: &Uuid) -> Result<ExecutionRun, AppError> {
    state
        .workflow_repo
        .get_run(run_id)
        .await?
        .ok_or_else(|| AppError::run_not_found(run_id))
}

/// Repair, validate and persist a definition, then update the scheduler.
async fn store_definition(state: &AppState, def: &mut WorkflowDefinition) -> Result<(), AppError> {
    repair_legacy_steps(def);
    validate_definition(def, state.config.engine.max_loop_depth)?;
    state.workflow_repo.save_definition(def).await?;
    sync_schedule(state, def.id, Some(&*def)).await;
    Ok(())
}

async fn sync_schedule(state: &AppState, workflow_id: Uuid, def: Option<&WorkflowDefinition>) {
    let Some(scheduler) = &state.scheduler else {
        return;
    };
    if let Err(e) = state.dispatcher.sync_schedule(scheduler, workflow_id, def).await {
        tracing::warn!(%workflow_id, error = %e, "failed to update workflow schedule");
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(e.to_string()))
}

/// Parse an optional JSON body; an empty body is `{}`.
pub(crate) fn parse_payload(body: &Bytes) -> Result<Value, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("request body is not valid JSON: {e}")))
}

// ---------------------------------------------------------------------------
// Workflow CRUD handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows - Create a new workflow definition.
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(mut body): Json<WorkflowDefinition>,
) -> Result<Response, AppError> {
    let meta = RequestMeta::start();

    store_definition(&state, &mut body).await?;
    tracing::info!(workflow = %body.name, id = %body.id, "workflow created");

    let resp = meta
        .success(to_json(&body)?)
        .with_link("self", &format!("/api/v1/workflows/{}", body.id));
    Ok(resp.into_response_with(StatusCode::CREATED))
}

/// GET /api/v1/workflows - List all workflow definitions.
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WorkflowDefinition>>>, AppError> {
    let meta = RequestMeta::start();
    let defs = state.workflow_repo.list_definitions().await?;

    Ok(Json(meta.success(defs).with_link("self", "/api/v1/workflows")))
}

/// GET /api/v1/workflows/{id} - Get a workflow definition by ID.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let meta = RequestMeta::start();
    let def = load_workflow(&state, &id).await?;

    Ok(Json(
        meta.success(def)
            .with_link("self", &format!("/api/v1/workflows/{id}"))
            .with_link("runs", &format!("/api/v1/workflows/{id}/runs")),
    ))
}

/// PUT /api/v1/workflows/{id} - Replace a workflow definition.
pub async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(mut body): Json<WorkflowDefinition>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let meta = RequestMeta::start();
    load_workflow(&state, &id).await?;

    // The path wins over any id in the body.
    body.id = id;
    store_definition(&state, &mut body).await?;
    tracing::info!(workflow = %body.name, %id, "workflow updated");

    Ok(Json(
        meta.success(body)
            .with_link("self", &format!("/api/v1/workflows/{id}")),
    ))
}

/// DELETE /api/v1/workflows/{id} - Delete a workflow definition and its runs.
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let meta = RequestMeta::start();

    if !state.workflow_repo.delete_definition(&id).await? {
        return Err(AppError::workflow_not_found(id));
    }
    sync_schedule(&state, id, None).await;
    tracing::info!(%id, "workflow deleted");

    Ok(Json(meta.success(json!({"deleted": true, "id": id.to_string()}))))
}

// ---------------------------------------------------------------------------
// Trigger and run handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows/{id}/trigger - Start a manual run.
///
/// Returns 202 with the run id as soon as the run is dispatched.
pub async fn trigger_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Response, AppError> {
    let meta = RequestMeta::start();
    let payload = parse_payload(&body)?;

    let run_id = state
        .dispatcher
        .start_run(id, TriggerSource::Manual, payload)
        .await?;

    let resp = meta
        .success(json!({
            "run_id": run_id.to_string(),
            "workflow_id": id.to_string(),
            "trigger": TriggerSource::Manual.as_str(),
        }))
        .with_link("run", &format!("/api/v1/runs/{run_id}"))
        .with_link("workflow", &format!("/api/v1/workflows/{id}"));
    Ok(resp.into_response_with(StatusCode::ACCEPTED))
}

/// GET /api/v1/workflows/{id}/runs - List runs for a workflow, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ApiResponse<Vec<ExecutionRun>>>, AppError> {
    let meta = RequestMeta::start();
    load_workflow(&state, &id).await?;

    let runs = state.workflow_repo.list_runs(&id, query.limit).await?;

    Ok(Json(
        meta.success(runs)
            .with_link("self", &format!("/api/v1/workflows/{id}/runs"))
            .with_link("workflow", &format!("/api/v1/workflows/{id}")),
    ))
}

/// GET /api/v1/runs/{run_id} - Get a run with its execution log.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ApiResponse<ExecutionRun>>, AppError> {
    let meta = RequestMeta::start();
    let run = load_run(&state, &run_id).await?;
    let workflow_link = format!("/api/v1/workflows/{}", run.workflow_id);

    Ok(Json(
        meta.success(run)
            .with_link("self", &format!("/api/v1/runs/{run_id}"))
            .with_link("workflow", &workflow_link),
    ))
}

/// POST /api/v1/runs/{run_id}/cancel - Cancel an in-flight run.
///
/// The run ends `failed` with "run cancelled" once its current step stops.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let meta = RequestMeta::start();
    let run = load_run(&state, &run_id).await?;

    if run.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "run {run_id} already finished with status {}",
            run.status
        )));
    }
    state.dispatcher.cancel(&run_id)?;
    tracing::info!(%run_id, "run cancellation requested");

    Ok(Json(
        meta.success(json!({"run_id": run_id.to_string(), "cancelled": true}))
            .with_link("self", &format!("/api/v1/runs/{run_id}")),
    ))
}
