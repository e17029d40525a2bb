//! Filtering and aggregation of data source records.
//!
//! Repositories use [`matches_all`] to filter stored records; the step runner
//! uses [`aggregate`] to reduce the matches into a step result.

use serde_json::{Value, json};
use stratum_types::data_source::{Aggregation, FilterOperator, QueryFilter};

use crate::workflow::variables::{lookup_path, number_to_value, value_as_f64};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AggregateError {
    #[error("aggregation '{0}' requires aggregate_field")]
    MissingAggregateField(&'static str),

    #[error("record {index} has no numeric field '{field}'")]
    NotNumeric { field: String, index: usize },
}

/// Whether a record satisfies every filter.
pub fn matches_all(record: &Value, filters: &[QueryFilter]) -> bool {
    filters.iter().all(|f| matches_filter(record, f))
}

/// Whether a record satisfies one filter.
///
/// `field` may be a dotted path. Comparison is numeric when both sides read
/// as numbers, string-wise otherwise. A missing field only satisfies `ne`.
pub fn matches_filter(record: &Value, filter: &QueryFilter) -> bool {
    let Some(actual) = lookup_path(record, &filter.field) else {
        return filter.operator == FilterOperator::Ne;
    };

    if filter.operator == FilterOperator::Contains {
        return match actual {
            Value::Array(items) => items.iter().any(|item| loosely_equal(item, &filter.value)),
            other => text_of(other).contains(&text_of(&filter.value)),
        };
    }

    let ordering = match (value_as_f64(actual), value_as_f64(&filter.value)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(text_of(actual).cmp(&text_of(&filter.value))),
    };
    let Some(ordering) = ordering else {
        return false;
    };

    use std::cmp::Ordering::*;
    match filter.operator {
        FilterOperator::Eq => ordering == Equal,
        FilterOperator::Ne => ordering != Equal,
        FilterOperator::Gt => ordering == Greater,
        FilterOperator::Gte => ordering != Less,
        FilterOperator::Lt => ordering == Less,
        FilterOperator::Lte => ordering != Greater,
        FilterOperator::Contains => false,
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (value_as_f64(a), value_as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => text_of(a) == text_of(b),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reduce matching records into the value stored as the step result.
///
/// Empty input is never an error: `count` is 0, `list` is `[]`, `sum` is 0,
/// and `avg`/`first` are null.
pub fn aggregate(
    records: Vec<Value>,
    aggregation: Aggregation,
    aggregate_field: Option<&str>,
) -> Result<Value, AggregateError> {
    match aggregation {
        Aggregation::Count => Ok(json!(records.len())),
        Aggregation::List => Ok(Value::Array(records)),
        Aggregation::First => Ok(records.into_iter().next().unwrap_or(Value::Null)),
        Aggregation::Sum => {
            let field = aggregate_field.ok_or(AggregateError::MissingAggregateField("sum"))?;
            let values = numeric_field(&records, field)?;
            Ok(number_to_value(values.iter().sum()))
        }
        Aggregation::Avg => {
            let field = aggregate_field.ok_or(AggregateError::MissingAggregateField("avg"))?;
            let values = numeric_field(&records, field)?;
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let total: f64 = values.iter().sum();
            Ok(number_to_value(total / values.len() as f64))
        }
    }
}

fn numeric_field(records: &[Value], field: &str) -> Result<Vec<f64>, AggregateError> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            lookup_path(record, field)
                .and_then(value_as_f64)
                .ok_or_else(|| AggregateError::NotNumeric {
                    field: field.to_string(),
                    index,
                })
        })
        .collect()
}
