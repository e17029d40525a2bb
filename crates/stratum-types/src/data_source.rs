//! Internal data tables queried by `data_source_query` steps.
//!
//! A data source is a named table of JSON records. Queries filter records by
//! field comparisons and reduce them with an aggregation mode.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Comparison operator for a query filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[default]
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Ne => "ne",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::Contains => "contains",
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `field <operator> value` filter.
///
/// In a step definition `value` may contain templates; in a [`DataQuery`]
/// handed to a repository it has already been resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub field: String,
    #[serde(default)]
    pub operator: FilterOperator,
    pub value: Value,
}

/// How matching records are reduced into the step result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Number of matching records.
    Count,
    /// The matching records themselves (honors `limit`).
    #[default]
    List,
    /// Sum of `aggregate_field` over matching records.
    Sum,
    /// Mean of `aggregate_field` over matching records.
    Avg,
    /// The first matching record, or null.
    First,
}

/// A resolved query against one data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQuery {
    pub source_id: String,
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// A data source (table) definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub name: String,
}

/// A single record stored in a data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRecord {
    pub id: Uuid,
    pub source_id: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}
