//! Integration registry: adapters keyed by integration id, each with an
//! optional per-integration timeout.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use stratum_types::integration::IntegrationResult;

use super::AdapterError;
use super::box_adapter::BoxIntegrationAdapter;

/// Fallback when neither the step nor the integration sets a timeout.
pub const DEFAULT_INTEGRATION_TIMEOUT: Duration = Duration::from_secs(30);

struct RegisteredAdapter {
    adapter: BoxIntegrationAdapter,
    timeout: Option<Duration>,
}

/// Registry of configured integrations.
pub struct IntegrationRegistry {
    adapters: HashMap<String, RegisteredAdapter>,
    default_timeout: Duration,
}

impl IntegrationRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            adapters: HashMap::new(),
            default_timeout,
        }
    }

    /// Register an adapter under `id`. A later registration replaces an earlier one.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        adapter: BoxIntegrationAdapter,
        timeout: Option<Duration>,
    ) {
        self.adapters
            .insert(id.into(), RegisteredAdapter { adapter, timeout });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.adapters.contains_key(id)
    }

    pub fn platform_type(&self, id: &str) -> Option<&str> {
        self.adapters.get(id).map(|r| r.adapter.platform_type())
    }

    /// Sorted list of registered integration ids.
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Timeout precedence: step override, then integration, then registry default.
    pub fn effective_timeout(&self, id: &str, step_override: Option<Duration>) -> Duration {
        step_override
            .or_else(|| self.adapters.get(id).and_then(|r| r.timeout))
            .unwrap_or(self.default_timeout)
    }

    /// Invoke `action` on integration `id`, bounded by the effective timeout.
    pub async fn invoke(
        &self,
        id: &str,
        action: &str,
        parameters: &Value,
        step_override: Option<Duration>,
    ) -> Result<IntegrationResult, AdapterError> {
        let entry = self
            .adapters
            .get(id)
            .ok_or_else(|| AdapterError::UnknownIntegration(id.to_string()))?;
        let timeout = self.effective_timeout(id, step_override);

        tracing::debug!(
            integration = id,
            action,
            timeout_secs = timeout.as_secs(),
            "invoking integration"
        );

        match tokio::time::timeout(timeout, entry.adapter.invoke(action, parameters)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(timeout.as_secs())),
        }
    }
}

impl Default for IntegrationRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_INTEGRATION_TIMEOUT)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
