//! BoxIntegrationAdapter -- object-safe dynamic dispatch wrapper for IntegrationAdapter.
//!
//! 1. Define an object-safe `IntegrationAdapterDyn` trait with boxed futures
//! 2. Blanket-impl `IntegrationAdapterDyn` for all `T: IntegrationAdapter`
//! 3. `BoxIntegrationAdapter` wraps `Box<dyn IntegrationAdapterDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use stratum_types::integration::IntegrationResult;

use super::AdapterError;
use super::adapter::IntegrationAdapter;

/// Object-safe version of [`IntegrationAdapter`] with boxed futures.
pub trait IntegrationAdapterDyn: Send + Sync {
    fn platform_type(&self) -> &str;

    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        parameters: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<IntegrationResult, AdapterError>> + Send + 'a>>;
}

/// Blanket implementation: any `IntegrationAdapter` automatically implements `IntegrationAdapterDyn`.
impl<T: IntegrationAdapter> IntegrationAdapterDyn for T {
    fn platform_type(&self) -> &str {
        IntegrationAdapter::platform_type(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        parameters: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<IntegrationResult, AdapterError>> + Send + 'a>> {
        Box::pin(self.invoke(action, parameters))
    }
}

/// Type-erased integration adapter for runtime selection by integration id.
pub struct BoxIntegrationAdapter {
    inner: Box<dyn IntegrationAdapterDyn + Send + Sync>,
}

impl BoxIntegrationAdapter {
    pub fn new<T: IntegrationAdapter + 'static>(adapter: T) -> Self {
        Self {
            inner: Box::new(adapter),
        }
    }

    pub fn platform_type(&self) -> &str {
        self.inner.platform_type()
    }

    pub async fn invoke(
        &self,
        action: &str,
        parameters: &Value,
    ) -> Result<IntegrationResult, AdapterError> {
        self.inner.invoke_boxed(action, parameters).await
    }
}
