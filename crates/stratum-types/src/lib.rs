//! Shared domain types for stratum.
//!
//! This crate contains the types used across the workflow engine: the
//! workflow definition model, execution run records, strategy (OKR) and
//! work item records, data source queries, configuration, and the
//! repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod data_source;
pub mod error;
pub mod integration;
pub mod strategy;
pub mod work_item;
pub mod workflow;
