//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `stratum-core` using sqlx with split
//! read/write pools. Workflow definitions are stored as JSON blobs. Runs and
//! their step logs are the durable record of every execution.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use sqlx::Row;
use stratum_core::repository::workflow::{RunFinalization, WorkflowRepository};
use stratum_types::error::RepositoryError;
use stratum_types::workflow::{ExecutionRun, RunStatus, StepLogEntry, WorkflowDefinition};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRunRow {
    id: String,
    workflow_id: String,
    workflow_name: String,
    status: String,
    trigger_source: String,
    trigger_payload: String,
    result_data: Option<String>,
    error_message: Option<String>,
    steps_completed: i64,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
}

impl WorkflowRunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            trigger_source: row.try_get("trigger_source")?,
            trigger_payload: row.try_get("trigger_payload")?,
            result_data: row.try_get("result_data")?,
            error_message: row.try_get("error_message")?,
            steps_completed: row.try_get("steps_completed")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
        })
    }

    fn into_run(self) -> Result<ExecutionRun, RepositoryError> {
        let result_data = self
            .result_data
            .as_deref()
            .map(|s| parse_json(s, "result_data"))
            .transpose()?;

        Ok(ExecutionRun {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_name: self.workflow_name,
            status: parse_enum(&self.status, "run status")?,
            trigger_source: parse_enum(&self.trigger_source, "trigger source")?,
            trigger_payload: parse_json(&self.trigger_payload, "trigger_payload")?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            execution_duration_ms: self.duration_ms.map(|ms| ms.max(0) as u64),
            steps_completed: self.steps_completed.max(0) as u32,
            execution_log: Vec::new(),
            result_data,
            error_message: self.error_message,
        })
    }
}

struct StepLogRow {
    step_id: String,
    step_name: String,
    step_type: String,
    parent_step_id: Option<String>,
    iteration: Option<i64>,
    success: bool,
    duration_ms: i64,
    output: Option<String>,
    error: Option<String>,
    started_at: String,
}

impl StepLogRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_id: row.try_get("step_id")?,
            step_name: row.try_get("step_name")?,
            step_type: row.try_get("step_type")?,
            parent_step_id: row.try_get("parent_step_id")?,
            iteration: row.try_get("iteration")?,
            success: row.try_get("success")?,
            duration_ms: row.try_get("duration_ms")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
        })
    }

    fn into_entry(self) -> Result<StepLogEntry, RepositoryError> {
        Ok(StepLogEntry {
            step: self.step_id,
            name: self.step_name,
            step_type: parse_enum(&self.step_type, "step type")?,
            duration_ms: self.duration_ms.max(0) as u64,
            success: self.success,
            error: self.error,
            output: self
                .output
                .as_deref()
                .map(|s| parse_json(s, "step output"))
                .transpose()?,
            parent_step: self.parent_step_id,
            iteration: self.iteration.map(|i| i.max(0) as u32),
            started_at: parse_datetime(&self.started_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const RUN_COLUMNS: &str = "id, workflow_id, workflow_name, status, trigger_source, trigger_payload, \
     result_data, error_message, steps_completed, started_at, completed_at, duration_ms";

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json(s: &str, what: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

/// Decode a snake_case enum stored as its serde string form.
fn parse_enum<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

fn to_json_string(value: &serde_json::Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, name, is_enabled, trigger_type, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 is_enabled = excluded.is_enabled,
                 trigger_type = excluded.trigger_type,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(def.is_enabled)
        .bind(def.trigger_type().as_str())
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(
                format!("workflow name '{}' already exists", def.name),
            ),
            other => query_error(other),
        })?;

        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|r| decode_definition(&r)).transpose()
    }

    async fn get_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|r| decode_definition(&r)).transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflows ORDER BY name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter().map(decode_definition).collect()
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query("DELETE FROM workflow_runs WHERE workflow_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_run(&self, run: &ExecutionRun) -> Result<(), RepositoryError> {
        let result_data = run.result_data.as_ref().map(to_json_string).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_id, workflow_name, status, trigger_source, trigger_payload,
                result_data, error_message, steps_completed, started_at, completed_at, duration_ms)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(&run.workflow_name)
        .bind(run.status.as_str())
        .bind(run.trigger_source.as_str())
        .bind(to_json_string(&run.trigger_payload)?)
        .bind(&result_data)
        .bind(&run.error_message)
        .bind(i64::from(run.steps_completed))
        .bind(format_datetime(&run.started_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(run.execution_duration_ms.map(|ms| ms as i64))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("run {} already exists", run.id))
            }
            other => query_error(other),
        })?;

        Ok(())
    }

    async fn update_run_progress(
        &self,
        run_id: &Uuid,
        steps_completed: u32,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE workflow_runs SET steps_completed = ? WHERE id = ?")
            .bind(i64::from(steps_completed))
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn finalize_run(
        &self,
        run_id: &Uuid,
        fin: &RunFinalization,
    ) -> Result<(), RepositoryError> {
        let result_data = fin.result_data.as_ref().map(to_json_string).transpose()?;

        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET status = ?, completed_at = ?, duration_ms = ?, steps_completed = ?,
                   result_data = ?, error_message = ?
               WHERE id = ? AND status = 'running'"#,
        )
        .bind(fin.status.as_str())
        .bind(format_datetime(&fin.completed_at))
        .bind(fin.duration_ms as i64)
        .bind(i64::from(fin.steps_completed))
        .bind(&result_data)
        .bind(&fin.error_message)
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing updated: either the run is unknown or no longer running.
        // Read through the writer so the check sees the latest commit.
        let exists = sqlx::query("SELECT status FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;

        match exists {
            Some(row) => {
                let status: String = row.try_get("status").map_err(query_error)?;
                Err(RepositoryError::Conflict(format!(
                    "run {run_id} already finalized ({status})"
                )))
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<ExecutionRun>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?"))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut run = WorkflowRunRow::from_row(&row)
            .map_err(query_error)?
            .into_run()?;

        let log_rows = sqlx::query(
            r#"SELECT step_id, step_name, step_type, parent_step_id, iteration, success,
                      duration_ms, output, error, started_at
               FROM workflow_step_logs WHERE run_id = ? ORDER BY seq ASC"#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        run.execution_log = log_rows
            .iter()
            .map(|r| StepLogRow::from_row(r).map_err(query_error)?.into_entry())
            .collect::<Result<_, _>>()?;

        Ok(Some(run))
    }

    async fn list_runs(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<ExecutionRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = ? \
             ORDER BY started_at DESC, id DESC LIMIT ?"
        ))
        .bind(workflow_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|r| WorkflowRunRow::from_row(r).map_err(query_error)?.into_run())
            .collect()
    }

    async fn list_running_runs(&self) -> Result<Vec<ExecutionRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE status = 'running' ORDER BY started_at ASC"
        ))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|r| WorkflowRunRow::from_row(r).map_err(query_error)?.into_run())
            .collect()
    }

    async fn append_step_log(
        &self,
        run_id: &Uuid,
        seq: u32,
        entry: &StepLogEntry,
    ) -> Result<(), RepositoryError> {
        let output = entry.output.as_ref().map(to_json_string).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_step_logs
               (id, run_id, seq, step_id, step_name, step_type, parent_step_id, iteration,
                success, duration_ms, output, error, started_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(run_id.to_string())
        .bind(i64::from(seq))
        .bind(&entry.step)
        .bind(&entry.name)
        .bind(entry.step_type.as_str())
        .bind(&entry.parent_step)
        .bind(entry.iteration.map(i64::from))
        .bind(entry.success)
        .bind(entry.duration_ms as i64)
        .bind(&output)
        .bind(&entry.error)
        .bind(format_datetime(&entry.started_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(
                format!("step log {seq} already recorded for run {run_id}"),
            ),
            other => query_error(other),
        })?;

        Ok(())
    }
}

fn decode_definition(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let json: String = row.try_get("definition").map_err(query_error)?;
    serde_json::from_str(&json)
        .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
