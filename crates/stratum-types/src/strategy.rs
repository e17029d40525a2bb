//! Strategy (OKR) records touched by `strategy_update` steps.
//!
//! Objectives carry a 0-100 progress figure; key results carry a numeric
//! current value measured against a start and target value.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which kind of strategy record a `strategy_update` step writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyTargetType {
    KeyResult,
    Objective,
}

impl StrategyTargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyTargetType::KeyResult => "key_result",
            StrategyTargetType::Objective => "objective",
        }
    }
}

impl fmt::Display for StrategyTargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the resolved value is applied to the target's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    /// Replace the current value.
    SetValue,
    /// Add to the current value.
    Increment,
    /// Set the value to a percentage of the way from start to target.
    Percentage,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::SetValue => "set_value",
            UpdateType::Increment => "increment",
            UpdateType::Percentage => "percentage",
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategic objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub id: String,
    pub title: String,
    /// Progress in percent, always within `[0, 100]`.
    pub progress: f64,
    pub updated_at: DateTime<Utc>,
}

/// A measurable key result, optionally attached to an objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyResult {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub start_value: f64,
    pub current_value: f64,
    pub target_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of applying a strategy update; becomes the step's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyUpdateOutcome {
    pub target_id: String,
    pub target_type: StrategyTargetType,
    pub update_type: UpdateType,
    pub previous_value: f64,
    pub new_value: f64,
}
