//! Work item store trait definition.

use stratum_types::error::RepositoryError;
use stratum_types::work_item::{NewWorkItem, WorkItem};
use uuid::Uuid;

/// Repository trait for work items (tasks).
pub trait WorkItemStore: Send + Sync {
    /// Persist a new work item and return it with its assigned ID.
    fn create_work_item(
        &self,
        item: &NewWorkItem,
    ) -> impl std::future::Future<Output = Result<WorkItem, RepositoryError>> + Send;

    /// List work items in creation order, optionally only those created by a run.
    fn list_work_items(
        &self,
        workflow_run_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkItem>, RepositoryError>> + Send;
}
