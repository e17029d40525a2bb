//! Notification channels: the delivery side of `notification` steps.
//!
//! Follows the same static-trait / object-safe-trait / box-wrapper split as
//! integration adapters. A `log` channel is always available.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use stratum_types::integration::NotificationMessage;

use super::AdapterError;

/// Name of the built-in channel that writes notifications to the log.
pub const LOG_CHANNEL: &str = "log";

pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> &str;

    fn send(
        &self,
        message: &NotificationMessage,
    ) -> impl Future<Output = Result<(), AdapterError>> + Send;
}

/// Object-safe version of [`NotificationChannel`].
pub trait NotificationChannelDyn: Send + Sync {
    fn kind(&self) -> &str;

    fn send_boxed<'a>(
        &'a self,
        message: &'a NotificationMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), AdapterError>> + Send + 'a>>;
}

impl<T: NotificationChannel> NotificationChannelDyn for T {
    fn kind(&self) -> &str {
        NotificationChannel::kind(self)
    }

    fn send_boxed<'a>(
        &'a self,
        message: &'a NotificationMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), AdapterError>> + Send + 'a>> {
        Box::pin(self.send(message))
    }
}

pub struct BoxNotificationChannel {
    inner: Box<dyn NotificationChannelDyn + Send + Sync>,
}

impl BoxNotificationChannel {
    pub fn new<T: NotificationChannel + 'static>(channel: T) -> Self {
        Self {
            inner: Box::new(channel),
        }
    }

    pub fn kind(&self) -> &str {
        self.inner.kind()
    }

    pub async fn send(&self, message: &NotificationMessage) -> Result<(), AdapterError> {
        self.inner.send_boxed(message).await
    }
}

/// Writes the notification as a structured log line.
pub struct LogChannel;

impl NotificationChannel for LogChannel {
    fn kind(&self) -> &str {
        LOG_CHANNEL
    }

    async fn send(&self, message: &NotificationMessage) -> Result<(), AdapterError> {
        tracing::info!(
            target: "stratum::notification",
            recipient = message.recipient.as_deref().unwrap_or(""),
            subject = message.subject.as_deref().unwrap_or(""),
            "{}",
            message.message
        );
        Ok(())
    }
}

/// Channels keyed by name.
pub struct NotificationRegistry {
    channels: HashMap<String, BoxNotificationChannel>,
}

impl NotificationRegistry {
    /// A registry containing only the `log` channel.
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert(LOG_CHANNEL.to_string(), BoxNotificationChannel::new(LogChannel));
        Self { channels }
    }

    pub fn register(&mut self, name: impl Into<String>, channel: BoxNotificationChannel) {
        self.channels.insert(name.into(), channel);
    }

    pub fn get(&self, name: &str) -> Option<&BoxNotificationChannel> {
        self.channels.get(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn send(
        &self,
        channel: &str,
        message: &NotificationMessage,
    ) -> Result<(), AdapterError> {
        let target = self
            .get(channel)
            .ok_or_else(|| AdapterError::UnknownChannel(channel.to_string()))?;
        target.send(message).await
    }
}

impl Default for NotificationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
