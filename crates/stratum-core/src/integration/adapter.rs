//! The `IntegrationAdapter` trait.

use serde_json::Value;
use stratum_types::integration::IntegrationResult;

use super::AdapterError;

/// An external-system-specific implementation of `integration_action`.
///
/// Adapters are pluggable per platform type. `parameters` arrive fully
/// resolved. Retries are never attempted here.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait IntegrationAdapter: Send + Sync {
    /// Platform family this adapter speaks to (e.g. "splynx", "rest").
    fn platform_type(&self) -> &str;

    /// Perform `action` with `parameters`.
    fn invoke(
        &self,
        action: &str,
        parameters: &Value,
    ) -> impl std::future::Future<Output = Result<IntegrationResult, AdapterError>> + Send;
}
