//! Strategy update arithmetic shared by every `StrategyStore` implementation.

use stratum_types::strategy::{KeyResult, Objective, UpdateType};

/// New `current_value` for a key result.
///
/// `percentage` moves the value `value` percent of the way from the key
/// result's start value to its target value.
pub fn key_result_new_value(kr: &KeyResult, update_type: UpdateType, value: f64) -> f64 {
    match update_type {
        UpdateType::SetValue => value,
        UpdateType::Increment => kr.current_value + value,
        UpdateType::Percentage => {
            kr.start_value + (kr.target_value - kr.start_value) * value / 100.0
        }
    }
}

/// New `progress` for an objective, clamped to `[0, 100]`.
pub fn objective_new_progress(obj: &Objective, update_type: UpdateType, value: f64) -> f64 {
    let raw = match update_type {
        UpdateType::SetValue | UpdateType::Percentage => value,
        UpdateType::Increment => obj.progress + value,
    };
    raw.clamp(0.0, 100.0)
}
