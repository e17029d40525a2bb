//! Integration adapter and notification channel ports.
//!
//! The engine never embeds platform-specific logic: `integration_action`
//! steps are dispatched to an adapter selected by integration id, and
//! `notification` steps to a channel selected by name. Concrete adapters
//! live in stratum-infra.

pub mod adapter;
pub mod box_adapter;
pub mod notification;
pub mod registry;

/// Failure reported by an external integration or notification channel.
///
/// Messages are passed through verbatim to the step log.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error("unknown integration '{0}'")]
    UnknownIntegration(String),

    #[error("unknown notification channel '{0}'")]
    UnknownChannel(String),

    #[error("integration '{integration}' does not support action '{action}'")]
    UnsupportedAction { integration: String, action: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Other(String),
}
