//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, execution runs,
//! and step logs. The infrastructure layer (stratum-infra) implements
//! this trait with SQLite persistence.

use chrono::{DateTime, Utc};
use serde_json::Value;
use stratum_types::error::RepositoryError;
use stratum_types::workflow::{ExecutionRun, RunStatus, StepLogEntry, WorkflowDefinition};
use uuid::Uuid;

/// The terminal fields written when a run is finalized.
#[derive(Debug, Clone)]
pub struct RunFinalization {
    /// `Completed` or `Failed`.
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps_completed: u32,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
}

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** CRUD for workflow definitions.
/// - **Runs:** Create, finalize, and query execution runs.
/// - **Step logs:** Append-only, ordered log entries per run.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    ///
    /// Returns `Conflict` if another workflow already uses the name.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Get a workflow definition by its unique name.
    fn get_definition_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List all workflow definitions, ordered by name.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a workflow definition (and its runs) by ID. Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record. The run's `execution_log` is ignored.
    fn create_run(
        &self,
        run: &ExecutionRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record how many top-level steps a running run has reached.
    fn update_run_progress(
        &self,
        run_id: &Uuid,
        steps_completed: u32,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Move a `running` run to its terminal state.
    ///
    /// Returns `NotFound` for an unknown run and `Conflict` if the run is
    /// already finalized.
    fn finalize_run(
        &self,
        run_id: &Uuid,
        fin: &RunFinalization,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run with its execution log in `seq` order.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionRun>, RepositoryError>> + Send;

    /// List runs for a workflow, newest first. Execution logs are left empty.
    fn list_runs(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRun>, RepositoryError>> + Send;

    /// List runs still marked `running` (used for restart recovery).
    fn list_running_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step logs
    // -----------------------------------------------------------------------

    /// Append a log entry at position `seq` (0-based, per run).
    fn append_step_log(
        &self,
        run_id: &Uuid,
        seq: u32,
        entry: &StepLogEntry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
