//! Data source repository trait definition.

use serde_json::Value;
use stratum_types::data_source::{DataQuery, DataRecord, DataSource};
use stratum_types::error::RepositoryError;

/// Repository trait for internal data tables.
pub trait DataSourceRepository: Send + Sync {
    /// Insert or rename a data source.
    fn upsert_source(
        &self,
        source: &DataSource,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn list_sources(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<DataSource>, RepositoryError>> + Send;

    /// Append a record to a data source. Returns `NotFound` for an unknown source.
    fn insert_record(
        &self,
        source_id: &str,
        data: &Value,
    ) -> impl std::future::Future<Output = Result<DataRecord, RepositoryError>> + Send;

    /// Records of `query.source_id` matching every filter, in insertion
    /// order, truncated to `query.limit`.
    ///
    /// Returns `NotFound` for an unknown source; no matches is an empty list.
    fn query(
        &self,
        query: &DataQuery,
    ) -> impl std::future::Future<Output = Result<Vec<DataRecord>, RepositoryError>> + Send;
}
