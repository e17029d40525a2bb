//! Configuration types for stratum.
//!
//! `StratumConfig` represents the top-level `config.toml` that controls
//! engine limits, the HTTP server, integration endpoints, and notification
//! channels.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
///
/// Loaded from `~/.stratum/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StratumConfig {
    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub server: ServerSettings,

    /// External integrations addressable by `integration_action` steps.
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,

    /// Channels addressable by `notification` steps.
    #[serde(default)]
    pub notification_channels: Vec<NotificationChannelConfig>,
}

/// What happens when a workflow is triggered while a run of it is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Drop the new trigger.
    #[default]
    Skip,
    /// Start the new run once the active one finishes.
    Queue,
}

/// Runner limits and policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Timeout for a single integration call, in seconds.
    #[serde(default = "default_integration_timeout_secs")]
    pub integration_timeout_secs: u64,

    /// Timeout for a whole run, in seconds.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Whether a failed notification leaves the run running.
    #[serde(default = "default_true")]
    pub notifications_best_effort: bool,

    #[serde(default)]
    pub overlap_policy: OverlapPolicy,

    /// Maximum `for_each` nesting depth.
    #[serde(default = "default_max_loop_depth")]
    pub max_loop_depth: usize,

    /// Maximum iterations of a single `for_each` step.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Step-log outputs above this size are replaced by a truncation marker.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_integration_timeout_secs() -> u64 {
    30
}

fn default_run_timeout_secs() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}

fn default_max_loop_depth() -> usize {
    3
}

fn default_max_iterations() -> usize {
    10_000
}

fn default_max_output_bytes() -> usize {
    65_536
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            integration_timeout_secs: default_integration_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            notifications_best_effort: true,
            overlap_policy: OverlapPolicy::default(),
            max_loop_depth: default_max_loop_depth(),
            max_iterations: default_max_iterations(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// HTTP server bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// An external integration reachable over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Identifier referenced by `integration_action.integration_id`.
    pub id: String,
    /// Platform family (e.g. "splynx", "airtable", "rest").
    pub platform_type: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Per-integration override of `engine.integration_timeout_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Kind of notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannelKind {
    /// POST the notification as JSON to `url`.
    Webhook,
    /// Emit the notification through tracing only.
    Log,
}

/// A named notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannelConfig {
    pub name: String,
    pub kind: NotificationChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
