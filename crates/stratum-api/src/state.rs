//! Application state wiring the engine together.
//!
//! AppState holds the concrete instances used by both the CLI and the REST
//! API. The runner is generic over the repository trait; AppState pins it to
//! the SQLite implementation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use stratum_core::workflow::executor::WorkflowRunner;
use stratum_core::workflow::scheduler::CronScheduler;
use stratum_core::workflow::trigger::TriggerDispatcher;
use stratum_infra::config::{load_config, resolve_data_dir};
use stratum_infra::integration::build_registries;
use stratum_infra::sqlite::pool::{DatabasePool, database_url};
use stratum_infra::sqlite::workflow::SqliteWorkflowRepository;
use stratum_infra::workflow::execution_context::SqliteExecutionContext;
use stratum_types::config::StratumConfig;

/// The dispatcher pinned to SQLite persistence.
pub type ConcreteDispatcher = TriggerDispatcher<SqliteWorkflowRepository>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub workflow_repo: Arc<SqliteWorkflowRepository>,
    pub dispatcher: Arc<ConcreteDispatcher>,
    /// Set while `serve` runs so API edits reach the cron scheduler.
    pub scheduler: Option<Arc<CronScheduler>>,
    pub config: Arc<StratumConfig>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize from the resolved data directory.
    pub async fn init() -> anyhow::Result<Self> {
        Self::open(resolve_data_dir()).await
    }

    /// Connect to the database in `data_dir`, load `config.toml` and wire the engine.
    pub async fn open(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir))
            .await
            .context("failed to open database")?;

        let (integrations, channels) =
            build_registries(&config).context("failed to build integration registries")?;
        tracing::debug!(
            integrations = integrations.list_ids().len(),
            channels = channels.list_names().len(),
            "registries ready"
        );

        let ctx = SqliteExecutionContext::with_pool(
            db_pool.clone(),
            Arc::new(integrations),
            Arc::new(channels),
        );
        let runner = WorkflowRunner::new(
            SqliteWorkflowRepository::new(db_pool.clone()),
            Arc::new(ctx),
            config.engine.clone(),
        );
        let dispatcher = TriggerDispatcher::new(Arc::new(runner));

        Ok(Self {
            workflow_repo: Arc::new(SqliteWorkflowRepository::new(db_pool.clone())),
            dispatcher: Arc::new(dispatcher),
            scheduler: None,
            config: Arc::new(config),
            data_dir,
            db_pool,
        })
    }

    pub fn with_scheduler(mut self, scheduler: Arc<CronScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}
