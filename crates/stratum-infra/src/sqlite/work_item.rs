//! SQLite work item store.

use chrono::{NaiveDate, Utc};
use sqlx::Row;
use stratum_core::repository::work_item::WorkItemStore;
use stratum_types::error::RepositoryError;
use stratum_types::work_item::{NewWorkItem, WorkItem, WorkItemStatus};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::workflow::{format_datetime, parse_datetime};

/// SQLite-backed implementation of `WorkItemStore`.
pub struct SqliteWorkItemStore {
    pool: DatabasePool,
}

impl SqliteWorkItemStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn work_item_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkItem, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_error)?;
    let status: String = row.try_get("status").map_err(query_error)?;
    let due_date: Option<String> = row.try_get("due_date").map_err(query_error)?;
    let run_id: Option<String> = row.try_get("workflow_run_id").map_err(query_error)?;
    let created_at: String = row.try_get("created_at").map_err(query_error)?;

    let status: WorkItemStatus = serde_json::from_value(serde_json::Value::String(status.clone()))
        .map_err(|_| RepositoryError::Query(format!("invalid work item status: {status}")))?;
    let due_date = due_date
        .as_deref()
        .map(|d| {
            NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .map_err(|e| RepositoryError::Query(format!("invalid due_date: {e}")))
        })
        .transpose()?;
    let workflow_run_id = run_id
        .as_deref()
        .map(|s| {
            s.parse::<Uuid>()
                .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
        })
        .transpose()?;

    Ok(WorkItem {
        id: id
            .parse()
            .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?,
        title: row.try_get("title").map_err(query_error)?,
        description: row.try_get("description").map_err(query_error)?,
        status,
        due_date,
        external_reference: row.try_get("external_reference").map_err(query_error)?,
        workflow_run_id,
        created_at: parse_datetime(&created_at)?,
    })
}

impl WorkItemStore for SqliteWorkItemStore {
    async fn create_work_item(&self, item: &NewWorkItem) -> Result<WorkItem, RepositoryError> {
        let work_item = WorkItem {
            id: Uuid::now_v7(),
            title: item.title.clone(),
            description: item.description.clone(),
            status: item.status,
            due_date: item.due_date,
            external_reference: item.external_reference.clone(),
            workflow_run_id: item.workflow_run_id,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"INSERT INTO work_items
               (id, title, description, status, due_date, external_reference, workflow_run_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(work_item.id.to_string())
        .bind(&work_item.title)
        .bind(&work_item.description)
        .bind(work_item.status.as_str())
        .bind(work_item.due_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(&work_item.external_reference)
        .bind(work_item.workflow_run_id.map(|id| id.to_string()))
        .bind(format_datetime(&work_item.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        tracing::debug!(
            work_item_id = %work_item.id,
            title = work_item.title.as_str(),
            "work item created"
        );

        Ok(work_item)
    }

    async fn list_work_items(
        &self,
        workflow_run_id: Option<&Uuid>,
    ) -> Result<Vec<WorkItem>, RepositoryError> {
        let rows = match workflow_run_id {
            Some(run_id) => {
                sqlx::query(
                    "SELECT * FROM work_items WHERE workflow_run_id = ? ORDER BY rowid",
                )
                .bind(run_id.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM work_items ORDER BY rowid")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        rows.iter().map(work_item_from_row).collect()
    }
}
