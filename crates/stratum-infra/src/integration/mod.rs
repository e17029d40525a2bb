//! HTTP-backed integration adapters and notification channels.
//!
//! - `rest` -- generic JSON-over-HTTP [`IntegrationAdapter`](stratum_core::integration::adapter::IntegrationAdapter)
//! - `webhook_channel` -- notification channel that POSTs to a URL
//! - [`build_registries`] -- wires both from `config.toml`

pub mod rest;
pub mod webhook_channel;

use std::time::Duration;

use stratum_core::integration::AdapterError;
use stratum_core::integration::box_adapter::BoxIntegrationAdapter;
use stratum_core::integration::notification::{
    BoxNotificationChannel, LogChannel, NotificationRegistry,
};
use stratum_core::integration::registry::IntegrationRegistry;
use stratum_types::config::{NotificationChannelKind, StratumConfig};

use self::rest::RestIntegrationAdapter;
use self::webhook_channel::WebhookChannel;

/// Build the shared HTTP client used by every adapter and channel.
pub fn http_client() -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .user_agent(concat!("stratum/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| AdapterError::Other(format!("failed to build HTTP client: {e}")))
}

/// Build the integration and notification registries described by `config`.
///
/// Integrations whose API key variable is unset are still registered; calls
/// go out unauthenticated and the remote decides. A webhook channel without a
/// URL is skipped with a warning.
pub fn build_registries(
    config: &StratumConfig,
) -> Result<(IntegrationRegistry, NotificationRegistry), AdapterError> {
    let client = http_client()?;

    let mut integrations =
        IntegrationRegistry::new(Duration::from_secs(config.engine.integration_timeout_secs));
    for integration in &config.integrations {
        let adapter = RestIntegrationAdapter::from_config(integration, client.clone());
        integrations.register(
            integration.id.clone(),
            BoxIntegrationAdapter::new(adapter),
            integration.timeout_secs.map(Duration::from_secs),
        );
        tracing::debug!(
            integration = integration.id.as_str(),
            platform = integration.platform_type.as_str(),
            "registered integration"
        );
    }

    let mut channels = NotificationRegistry::new();
    for channel in &config.notification_channels {
        match (channel.kind, channel.url.as_deref()) {
            (NotificationChannelKind::Webhook, Some(url)) => {
                channels.register(
                    channel.name.clone(),
                    BoxNotificationChannel::new(WebhookChannel::new(
                        channel.name.clone(),
                        url.to_string(),
                        client.clone(),
                    )),
                );
            }
            (NotificationChannelKind::Webhook, None) => {
                tracing::warn!(
                    channel = channel.name.as_str(),
                    "webhook notification channel has no url, skipping"
                );
            }
            (NotificationChannelKind::Log, _) => {
                channels.register(channel.name.clone(), BoxNotificationChannel::new(LogChannel));
            }
        }
    }

    Ok((integrations, channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::integration::notification::LOG_CHANNEL;
    use stratum_types::config::{IntegrationConfig, NotificationChannelConfig};

    #[test]
    fn test_build_registries_from_config() {
        let mut config = StratumConfig::default();
        config.integrations.push(IntegrationConfig {
            id: "crm".to_string(),
            platform_type: "rest".to_string(),
            base_url: "http://localhost:9000".to_string(),
            api_key_env: None,
            timeout_secs: Some(5),
        });
        config.notification_channels.push(NotificationChannelConfig {
            name: "ops".to_string(),
            kind: NotificationChannelKind::Webhook,
            url: Some("http://localhost:9001/hook".to_string()),
        });
        config.notification_channels.push(NotificationChannelConfig {
            name: "broken".to_string(),
            kind: NotificationChannelKind::Webhook,
            url: None,
        });

        let (integrations, channels) = build_registries(&config).unwrap();
        assert_eq!(integrations.list_ids(), vec!["crm"]);
        assert_eq!(integrations.platform_type("crm"), Some("rest"));
        assert_eq!(
            integrations.effective_timeout("crm", None),
            Duration::from_secs(5)
        );
        assert!(channels.get("ops").is_some());
        assert!(channels.get("broken").is_none());
        assert!(channels.get(LOG_CHANNEL).is_some());
    }
}
