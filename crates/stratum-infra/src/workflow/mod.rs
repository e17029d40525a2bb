//! Workflow infrastructure: webhook authentication and the live step
//! execution context.

pub mod execution_context;
pub mod webhook_handler;
