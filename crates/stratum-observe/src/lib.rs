//! Observability setup for the `stratum` binary.

pub mod tracing_setup;
