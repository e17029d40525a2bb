//! Results exchanged with integration adapters and notification channels.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// What an integration adapter returns from `invoke`.
///
/// Count queries fill `count`, list queries fill `records`; some actions
/// return both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<Value>>,
}

impl IntegrationResult {
    pub fn count(count: u64) -> Self {
        Self {
            count: Some(count),
            records: None,
        }
    }

    pub fn records(records: Vec<Value>) -> Self {
        Self {
            count: None,
            records: Some(records),
        }
    }

    /// The value stored under the step's `result_variable`.
    ///
    /// A lone count becomes a number, a lone record list becomes a list,
    /// both become `{count, records}`, and neither becomes null.
    pub fn into_value(self) -> Value {
        match (self.count, self.records) {
            (Some(count), None) => json!(count),
            (None, Some(records)) => Value::Array(records),
            (Some(count), Some(records)) => json!({ "count": count, "records": records }),
            (None, None) => Value::Null,
        }
    }
}

/// A notification ready to send. All templates are already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
}
