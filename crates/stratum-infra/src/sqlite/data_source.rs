//! SQLite data source repository.
//!
//! Records are JSON documents. Filters are evaluated in process with the
//! same comparison rules the engine documents, so SQL only narrows by source.

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use stratum_core::data_source::matches_all;
use stratum_core::repository::data_source::DataSourceRepository;
use stratum_types::data_source::{DataQuery, DataRecord, DataSource};
use stratum_types::error::RepositoryError;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::workflow::{format_datetime, parse_datetime};

/// SQLite-backed implementation of `DataSourceRepository`.
pub struct SqliteDataSourceRepository {
    pool: DatabasePool,
}

impl SqliteDataSourceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn source_exists(&self, source_id: &str) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM data_sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        Ok(row.is_some())
    }
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DataRecord, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_error)?;
    let data: String = row.try_get("data").map_err(query_error)?;
    let created_at: String = row.try_get("created_at").map_err(query_error)?;

    Ok(DataRecord {
        id: id
            .parse()
            .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?,
        source_id: row.try_get("source_id").map_err(query_error)?,
        data: serde_json::from_str(&data)
            .map_err(|e| RepositoryError::Query(format!("invalid record JSON: {e}")))?,
        created_at: parse_datetime(&created_at)?,
    })
}

impl DataSourceRepository for SqliteDataSourceRepository {
    async fn upsert_source(&self, source: &DataSource) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO data_sources (id, name) VALUES (?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(&source.id)
        .bind(&source.name)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn list_sources(&self) -> Result<Vec<DataSource>, RepositoryError> {
        let rows = sqlx::query("SELECT id, name FROM data_sources ORDER BY id")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                Ok(DataSource {
                    id: row.try_get("id").map_err(query_error)?,
                    name: row.try_get("name").map_err(query_error)?,
                })
            })
            .collect()
    }

    async fn insert_record(
        &self,
        source_id: &str,
        data: &Value,
    ) -> Result<DataRecord, RepositoryError> {
        let record = DataRecord {
            id: Uuid::now_v7(),
            source_id: source_id.to_string(),
            data: data.clone(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(data).map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query("INSERT INTO data_records (id, source_id, data, created_at) VALUES (?, ?, ?, ?)")
            .bind(record.id.to_string())
            .bind(source_id)
            .bind(&json)
            .bind(format_datetime(&record.created_at))
            .execute(&self.pool.writer)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    RepositoryError::NotFound
                }
                other => query_error(other),
            })?;

        Ok(record)
    }

    async fn query(&self, query: &DataQuery) -> Result<Vec<DataRecord>, RepositoryError> {
        if !self.source_exists(&query.source_id).await? {
            return Err(RepositoryError::NotFound);
        }

        let rows = sqlx::query(
            "SELECT id, source_id, data, created_at FROM data_records WHERE source_id = ? ORDER BY rowid",
        )
        .bind(&query.source_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let mut matches = Vec::new();
        for row in &rows {
            if matches.len() >= limit {
                break;
            }
            let record = record_from_row(row)?;
            if matches_all(&record.data, &query.filters) {
                matches.push(record);
            }
        }

        tracing::debug!(
            source = query.source_id.as_str(),
            scanned = rows.len(),
            matched = matches.len(),
            "data source query"
        );

        Ok(matches)
    }
}
