//! Notification channel that POSTs each message as JSON to a fixed URL.

use serde_json::json;
use stratum_core::integration::AdapterError;
use stratum_core::integration::notification::NotificationChannel;
use stratum_types::integration::NotificationMessage;

pub struct WebhookChannel {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(name: String, url: String, client: reqwest::Client) -> Self {
        Self { name, url, client }
    }
}

impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> &str {
        "webhook"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<(), AdapterError> {
        let payload = json!({
            "channel": self.name,
            "recipient": message.recipient,
            "subject": message.subject,
            "message": message.message,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdapterError::Network(format!("channel '{}': {e}", self.name)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Remote {
                status: status.as_u16(),
                message: body.trim().chars().take(256).collect(),
            });
        }

        tracing::debug!(channel = self.name.as_str(), "notification delivered");
        Ok(())
    }
}
