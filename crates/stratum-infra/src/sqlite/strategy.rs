//! SQLite strategy store: objectives and key results.
//!
//! Updates run read-modify-write inside a writer transaction so concurrent
//! increments from parallel runs never lose an update.

use chrono::Utc;
use sqlx::Row;
use stratum_core::repository::strategy::StrategyStore;
use stratum_core::strategy::{key_result_new_value, objective_new_progress};
use stratum_types::error::RepositoryError;
use stratum_types::strategy::{
    KeyResult, Objective, StrategyTargetType, StrategyUpdateOutcome, UpdateType,
};

use super::pool::DatabasePool;
use super::workflow::{format_datetime, parse_datetime};

/// SQLite-backed implementation of `StrategyStore`.
pub struct SqliteStrategyStore {
    pool: DatabasePool,
}

impl SqliteStrategyStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn objective_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Objective, RepositoryError> {
    let updated_at: String = row.try_get("updated_at").map_err(query_error)?;
    Ok(Objective {
        id: row.try_get("id").map_err(query_error)?,
        title: row.try_get("title").map_err(query_error)?,
        progress: row.try_get("progress").map_err(query_error)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn key_result_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<KeyResult, RepositoryError> {
    let updated_at: String = row.try_get("updated_at").map_err(query_error)?;
    Ok(KeyResult {
        id: row.try_get("id").map_err(query_error)?,
        objective_id: row.try_get("objective_id").map_err(query_error)?,
        title: row.try_get("title").map_err(query_error)?,
        start_value: row.try_get("start_value").map_err(query_error)?,
        current_value: row.try_get("current_value").map_err(query_error)?,
        target_value: row.try_get("target_value").map_err(query_error)?,
        unit: row.try_get("unit").map_err(query_error)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

const KEY_RESULT_COLUMNS: &str =
    "id, objective_id, title, start_value, current_value, target_value, unit, updated_at";

impl StrategyStore for SqliteStrategyStore {
    async fn get_objective(&self, id: &str) -> Result<Option<Objective>, RepositoryError> {
        let row = sqlx::query("SELECT id, title, progress, updated_at FROM objectives WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(objective_from_row).transpose()
    }

    async fn list_objectives(&self) -> Result<Vec<Objective>, RepositoryError> {
        let rows = sqlx::query("SELECT id, title, progress, updated_at FROM objectives ORDER BY id")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter().map(objective_from_row).collect()
    }

    async fn upsert_objective(&self, objective: &Objective) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO objectives (id, title, progress, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 progress = excluded.progress,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&objective.id)
        .bind(&objective.title)
        .bind(objective.progress.clamp(0.0, 100.0))
        .bind(format_datetime(&objective.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_key_result(&self, id: &str) -> Result<Option<KeyResult>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {KEY_RESULT_COLUMNS} FROM key_results WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.as_ref().map(key_result_from_row).transpose()
    }

    async fn list_key_results(&self) -> Result<Vec<KeyResult>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {KEY_RESULT_COLUMNS} FROM key_results ORDER BY id"
        ))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(key_result_from_row).collect()
    }

    async fn upsert_key_result(&self, key_result: &KeyResult) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO key_results
               (id, objective_id, title, start_value, current_value, target_value, unit, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 objective_id = excluded.objective_id,
                 title = excluded.title,
                 start_value = excluded.start_value,
                 current_value = excluded.current_value,
                 target_value = excluded.target_value,
                 unit = excluded.unit,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&key_result.id)
        .bind(&key_result.objective_id)
        .bind(&key_result.title)
        .bind(key_result.start_value)
        .bind(key_result.current_value)
        .bind(key_result.target_value)
        .bind(&key_result.unit)
        .bind(format_datetime(&key_result.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn update_key_result(
        &self,
        id: &str,
        update_type: UpdateType,
        value: f64,
    ) -> Result<StrategyUpdateOutcome, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let row = sqlx::query(&format!(
            "SELECT {KEY_RESULT_COLUMNS} FROM key_results WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_error)?
        .ok_or(RepositoryError::NotFound)?;
        let kr = key_result_from_row(&row)?;

        let new_value = key_result_new_value(&kr, update_type, value);
        sqlx::query("UPDATE key_results SET current_value = ?, updated_at = ? WHERE id = ?")
            .bind(new_value)
            .bind(format_datetime(&Utc::now()))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;

        tracing::debug!(
            key_result = id,
            update_type = update_type.as_str(),
            previous = kr.current_value,
            new = new_value,
            "key result updated"
        );

        Ok(StrategyUpdateOutcome {
            target_id: id.to_string(),
            target_type: StrategyTargetType::KeyResult,
            update_type,
            previous_value: kr.current_value,
            new_value,
        })
    }

    async fn update_objective(
        &self,
        id: &str,
        update_type: UpdateType,
        value: f64,
    ) -> Result<StrategyUpdateOutcome, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let row = sqlx::query("SELECT id, title, progress, updated_at FROM objectives WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error)?
            .ok_or(RepositoryError::NotFound)?;
        let objective = objective_from_row(&row)?;

        let new_progress = objective_new_progress(&objective, update_type, value);
        sqlx::query("UPDATE objectives SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(new_progress)
            .bind(format_datetime(&Utc::now()))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;

        tracing::debug!(
            objective = id,
            update_type = update_type.as_str(),
            previous = objective.progress,
            new = new_progress,
            "objective updated"
        );

        Ok(StrategyUpdateOutcome {
            target_id: id.to_string(),
            target_type: StrategyTargetType::Objective,
            update_type,
            previous_value: objective.progress,
            new_value: new_progress,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::database_url;

    async fn test_store() -> SqliteStrategyStore {
        let dir = tempfile::tempdir().unwrap();
        let url = database_url(dir.path());
        std::mem::forget(dir);
        SqliteStrategyStore::new(DatabasePool::new(&url).await.unwrap())
    }

    fn key_result(id: &str, start: f64, current: f64, target: f64) -> KeyResult {
        KeyResult {
            id: id.to_string(),
            objective_id: None,
            title: "Qualified leads".to_string(),
            start_value: start,
            current_value: current,
            target_value: target,
            unit: Some("leads".to_string()),
            updated_at: Utc::now(),
        }
    }

    fn objective(id: &str, progress: f64) -> Objective {
        Objective {
            id: id.to_string(),
            title: "Grow pipeline".to_string(),
            progress,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get_key_result() {
        let store = test_store().await;
        store
            .upsert_key_result(&key_result("kr-1", 0.0, 10.0, 100.0))
            .await
            .unwrap();

        let kr = store.get_key_result("kr-1").await.unwrap().unwrap();
        assert_eq!(kr.current_value, 10.0);
        assert_eq!(kr.unit.as_deref(), Some("leads"));
        assert!(store.get_key_result("kr-2").await.unwrap().is_none());
        assert_eq!(store.list_key_results().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_key_result_set_and_increment() {
        let store = test_store().await;
        store
            .upsert_key_result(&key_result("kr-1", 0.0, 10.0, 100.0))
            .await
            .unwrap();

        let set = store
            .update_key_result("kr-1", UpdateType::SetValue, 25.0)
            .await
            .unwrap();
        assert_eq!(set.previous_value, 10.0);
        assert_eq!(set.new_value, 25.0);

        let inc = store
            .update_key_result("kr-1", UpdateType::Increment, 5.0)
            .await
            .unwrap();
        assert_eq!(inc.previous_value, 25.0);
        assert_eq!(inc.new_value, 30.0);
        assert_eq!(inc.target_type, StrategyTargetType::KeyResult);

        let stored = store.get_key_result("kr-1").await.unwrap().unwrap();
        assert_eq!(stored.current_value, 30.0);
    }

    #[tokio::test]
    async fn test_update_key_result_percentage_of_range() {
        let store = test_store().await;
        store
            .upsert_key_result(&key_result("kr-1", 20.0, 20.0, 120.0))
            .await
            .unwrap();

        let outcome = store
            .update_key_result("kr-1", UpdateType::Percentage, 50.0)
            .await
            .unwrap();
        assert_eq!(outcome.new_value, 70.0);
    }

    #[tokio::test]
    async fn test_update_unknown_key_result_is_not_found() {
        let store = test_store().await;
        let err = store
            .update_key_result("ghost", UpdateType::SetValue, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_update_objective_clamps_progress() {
        let store = test_store().await;
        store.upsert_objective(&objective("obj-1", 90.0)).await.unwrap();

        let outcome = store
            .update_objective("obj-1", UpdateType::Increment, 25.0)
            .await
            .unwrap();
        assert_eq!(outcome.previous_value, 90.0);
        assert_eq!(outcome.new_value, 100.0);

        let outcome = store
            .update_objective("obj-1", UpdateType::SetValue, -5.0)
            .await
            .unwrap();
        assert_eq!(outcome.new_value, 0.0);

        let stored = store.get_objective("obj-1").await.unwrap().unwrap();
        assert_eq!(stored.progress, 0.0);
    }

    #[tokio::test]
    async fn test_list_objectives() {
        let store = test_store().await;
        store.upsert_objective(&objective("b", 10.0)).await.unwrap();
        store.upsert_objective(&objective("a", 20.0)).await.unwrap();

        let ids: Vec<String> = store
            .list_objectives()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
