//! HTTP request handlers for the REST API.

pub mod webhook;
pub mod workflow;
