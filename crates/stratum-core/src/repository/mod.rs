//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stratum-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod data_source;
pub mod strategy;
pub mod work_item;
pub mod workflow;
