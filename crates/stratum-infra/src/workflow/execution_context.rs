//! Live execution context wiring workflow steps to real services.
//!
//! [`LiveExecutionContext`] implements the [`StepExecutionContext`] trait from
//! stratum-core on top of:
//! - the integration and notification registries built from `config.toml`
//! - the strategy, work item and data source stores
//!
//! The trait is defined in core and implemented here, the same way the
//! SQLite repositories implement the core repository traits.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stratum_core::integration::notification::NotificationRegistry;
use stratum_core::integration::registry::IntegrationRegistry;
use stratum_core::repository::data_source::DataSourceRepository;
use stratum_core::repository::strategy::StrategyStore;
use stratum_core::repository::work_item::WorkItemStore;
use stratum_core::workflow::step_runner::{StepError, StepExecutionContext, StepFuture};
use stratum_types::data_source::DataQuery;
use stratum_types::error::RepositoryError;
use stratum_types::integration::{IntegrationResult, NotificationMessage};
use stratum_types::strategy::{StrategyTargetType, StrategyUpdateOutcome, UpdateType};
use stratum_types::work_item::{NewWorkItem, WorkItem};

use crate::sqlite::data_source::SqliteDataSourceRepository;
use crate::sqlite::pool::DatabasePool;
use crate::sqlite::strategy::SqliteStrategyStore;
use crate::sqlite::work_item::SqliteWorkItemStore;

/// The context the `stratum` binary runs workflows with.
pub type SqliteExecutionContext =
    LiveExecutionContext<SqliteStrategyStore, SqliteWorkItemStore, SqliteDataSourceRepository>;

/// Real execution context dispatching steps to configured services.
pub struct LiveExecutionContext<S, W, D> {
    integrations: Arc<IntegrationRegistry>,
    channels: Arc<NotificationRegistry>,
    strategy: S,
    work_items: W,
    data_sources: D,
}

impl<S, W, D> LiveExecutionContext<S, W, D>
where
    S: StrategyStore,
    W: WorkItemStore,
    D: DataSourceRepository,
{
    pub fn new(
        integrations: Arc<IntegrationRegistry>,
        channels: Arc<NotificationRegistry>,
        strategy: S,
        work_items: W,
        data_sources: D,
    ) -> Self {
        Self {
            integrations,
            channels,
            strategy,
            work_items,
            data_sources,
        }
    }

    pub fn integrations(&self) -> &IntegrationRegistry {
        &self.integrations
    }

    pub fn channels(&self) -> &NotificationRegistry {
        &self.channels
    }
}

impl SqliteExecutionContext {
    /// Wire every store to one database pool.
    pub fn with_pool(
        pool: DatabasePool,
        integrations: Arc<IntegrationRegistry>,
        channels: Arc<NotificationRegistry>,
    ) -> Self {
        Self::new(
            integrations,
            channels,
            SqliteStrategyStore::new(pool.clone()),
            SqliteWorkItemStore::new(pool.clone()),
            SqliteDataSourceRepository::new(pool),
        )
    }
}

fn store_error(what: &str, id: &str, err: RepositoryError) -> StepError {
    match err {
        RepositoryError::NotFound => StepError::Adapter(format!("{what} '{id}' not found")),
        other => StepError::Adapter(format!("{what} '{id}': {other}")),
    }
}

impl<S, W, D> StepExecutionContext for LiveExecutionContext<S, W, D>
where
    S: StrategyStore,
    W: WorkItemStore,
    D: DataSourceRepository,
{
    fn invoke_integration(
        &self,
        integration_id: &str,
        action: &str,
        parameters: Value,
        timeout: Option<Duration>,
    ) -> StepFuture<'_, IntegrationResult> {
        let integration_id = integration_id.to_string();
        let action = action.to_string();

        Box::pin(async move {
            self.integrations
                .invoke(&integration_id, &action, &parameters, timeout)
                .await
                .map_err(|e| StepError::Adapter(e.to_string()))
        })
    }

    fn update_strategy(
        &self,
        target_type: StrategyTargetType,
        target_id: &str,
        update_type: UpdateType,
        value: f64,
    ) -> StepFuture<'_, StrategyUpdateOutcome> {
        let target_id = target_id.to_string();

        Box::pin(async move {
            let result = match target_type {
                StrategyTargetType::KeyResult => {
                    self.strategy
                        .update_key_result(&target_id, update_type, value)
                        .await
                }
                StrategyTargetType::Objective => {
                    self.strategy
                        .update_objective(&target_id, update_type, value)
                        .await
                }
            };
            let what = match target_type {
                StrategyTargetType::KeyResult => "key result",
                StrategyTargetType::Objective => "objective",
            };
            result.map_err(|e| store_error(what, &target_id, e))
        })
    }

    fn query_data_source(&self, query: DataQuery) -> StepFuture<'_, Vec<Value>> {
        Box::pin(async move {
            let records = self
                .data_sources
                .query(&query)
                .await
                .map_err(|e| store_error("data source", &query.source_id, e))?;
            Ok(records.into_iter().map(|r| r.data).collect())
        })
    }

    fn create_work_item(&self, item: NewWorkItem) -> StepFuture<'_, WorkItem> {
        Box::pin(async move {
            self.work_items
                .create_work_item(&item)
                .await
                .map_err(|e| StepError::Adapter(format!("failed to create work item: {e}")))
        })
    }

    fn send_notification(
        &self,
        channel: &str,
        message: NotificationMessage,
    ) -> StepFuture<'_, ()> {
        let channel = channel.to_string();

        Box::pin(async move {
            self.channels
                .send(&channel, &message)
                .await
                .map_err(|e| StepError::Adapter(e.to_string()))
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
    use chrono::Utc;
    use serde_json::json;
    use stratum_types::data_source::{DataSource, FilterOperator, QueryFilter};
    use stratum_types::strategy::KeyResult;
    use stratum_types::work_item::WorkItemStatus;

    async fn test_context() -> (SqliteExecutionContext, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = database_url(dir.path());
        std::mem::forget(dir);
        let pool = DatabasePool::new(&url).await.unwrap();
        let ctx = SqliteExecutionContext::with_pool(
            pool.clone(),
            Arc::new(IntegrationRegistry::default()),
            Arc::new(NotificationRegistry::new()),
        );
        (ctx, pool)
    }

    #[tokio::test]
    async fn test_update_strategy_key_result() {
        let (ctx, pool) = test_context().await;
        SqliteStrategyStore::new(pool)
            .upsert_key_result(&KeyResult {
                id: "kr-leads".to_string(),
                objective_id: None,
                title: "Leads".to_string(),
                start_value: 0.0,
                current_value: 4.0,
                target_value: 40.0,
                unit: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let outcome = ctx
            .update_strategy(
                StrategyTargetType::KeyResult,
                "kr-leads",
                UpdateType::Increment,
                3.0,
            )
            .await
            .unwrap();
        assert_eq!(outcome.previous_value, 4.0);
        assert_eq!(outcome.new_value, 7.0);
    }

    #[tokio::test]
    async fn test_update_strategy_unknown_target() {
        let (ctx, _pool) = test_context().await;
        let err = ctx
            .update_strategy(StrategyTargetType::KeyResult, "x", UpdateType::SetValue, 1.0)
            .await
            .unwrap_err();
        assert_eq!(err, StepError::Adapter("key result 'x' not found".to_string()));

        let err = ctx
            .update_strategy(StrategyTargetType::Objective, "y", UpdateType::SetValue, 1.0)
            .await
            .unwrap_err();
        assert_eq!(err, StepError::Adapter("objective 'y' not found".to_string()));
    }

    #[tokio::test]
    async fn test_query_data_source_returns_record_data() {
        let (ctx, pool) = test_context().await;
        let repo = SqliteDataSourceRepository::new(pool);
        repo.upsert_source(&DataSource {
            id: "tickets".to_string(),
            name: "Tickets".to_string(),
        })
        .await
        .unwrap();
        repo.insert_record("tickets", &json!({"id": 1, "open": true}))
            .await
            .unwrap();
        repo.insert_record("tickets", &json!({"id": 2, "open": false}))
            .await
            .unwrap();

        let records = ctx
            .query_data_source(DataQuery {
                source_id: "tickets".to_string(),
                filters: vec![QueryFilter {
                    field: "open".to_string(),
                    operator: FilterOperator::Eq,
                    value: json!(true),
                }],
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(records, vec![json!({"id": 1, "open": true})]);

        let err = ctx
            .query_data_source(DataQuery {
                source_id: "nope".to_string(),
                filters: vec![],
                limit: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err, StepError::Adapter("data source 'nope' not found".to_string()));
    }

    #[tokio::test]
    async fn test_create_work_item_persists() {
        let (ctx, pool) = test_context().await;
        let item = ctx
            .create_work_item(NewWorkItem {
                title: "Call Acme".to_string(),
                description: None,
                status: WorkItemStatus::Todo,
                due_date: None,
                external_reference: None,
                workflow_run_id: None,
            })
            .await
            .unwrap();

        let stored = SqliteWorkItemStore::new(pool).list_work_items(None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, item.id);
    }

    #[tokio::test]
    async fn test_unknown_integration_and_channel_are_adapter_errors() {
        let (ctx, _pool) = test_context().await;
        let err = ctx
            .invoke_integration("crm", "count", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err, StepError::Adapter("unknown integration 'crm'".to_string()));

        let message = NotificationMessage {
            recipient: None,
            subject: None,
            message: "hi".to_string(),
        };
        assert!(ctx.send_notification("log", message.clone()).await.is_ok());
        let err = ctx.send_notification("pager", message).await.unwrap_err();
        assert_eq!(
            err,
            StepError::Adapter("unknown notification channel 'pager'".to_string())
        );
    }
}
