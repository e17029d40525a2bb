//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod data_source;
pub mod pool;
pub mod strategy;
pub mod work_item;
pub mod workflow;
