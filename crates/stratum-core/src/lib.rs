//! Workflow engine logic and boundary traits for stratum.
//!
//! This crate defines the "ports" (repository, adapter, and execution
//! context traits) that the infrastructure layer implements. It depends only
//! on `stratum-types` -- never on `stratum-infra` or any database/IO crate.

pub mod data_source;
pub mod integration;
pub mod repository;
pub mod strategy;
pub mod workflow;
