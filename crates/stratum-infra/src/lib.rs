//! Infrastructure layer for stratum.
//!
//! Contains implementations of the ports defined in `stratum-core`: SQLite
//! repositories, HTTP integration adapters and notification channels, webhook
//! authentication, and the configuration loader.

pub mod config;
pub mod integration;
pub mod sqlite;
pub mod workflow;
