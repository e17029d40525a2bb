//! Strategy store trait definition.
//!
//! The strategy store owns objective and key-result persistence. Updates are
//! applied atomically by the implementation using [`crate::strategy`].

use stratum_types::error::RepositoryError;
use stratum_types::strategy::{KeyResult, Objective, StrategyUpdateOutcome, UpdateType};

/// Repository trait for objectives and key results.
pub trait StrategyStore: Send + Sync {
    fn get_objective(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Objective>, RepositoryError>> + Send;

    fn list_objectives(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Objective>, RepositoryError>> + Send;

    /// Insert or replace an objective by ID.
    fn upsert_objective(
        &self,
        objective: &Objective,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_key_result(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<KeyResult>, RepositoryError>> + Send;

    fn list_key_results(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<KeyResult>, RepositoryError>> + Send;

    /// Insert or replace a key result by ID.
    fn upsert_key_result(
        &self,
        key_result: &KeyResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Apply an update to a key result's current value.
    ///
    /// Returns `NotFound` if the key result does not exist.
    fn update_key_result(
        &self,
        id: &str,
        update_type: UpdateType,
        value: f64,
    ) -> impl std::future::Future<Output = Result<StrategyUpdateOutcome, RepositoryError>> + Send;

    /// Apply an update to an objective's progress.
    ///
    /// Returns `NotFound` if the objective does not exist.
    fn update_objective(
        &self,
        id: &str,
        update_type: UpdateType,
        value: f64,
    ) -> impl std::future::Future<Output = Result<StrategyUpdateOutcome, RepositoryError>> + Send;
}
