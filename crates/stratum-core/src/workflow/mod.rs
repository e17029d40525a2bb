//! Workflow engine core: definitions, resolution, and execution.
//!
//! - `definition` -- YAML parsing, legacy repair, validation, filesystem load/save
//! - `variables` -- Per-run variable store and `currentItem` scoping
//! - `template` -- `{name}` / `{{ path }}` interpolation
//! - `formula` -- `+ - * /` expressions for `data_transformation`
//! - `relative_date` -- `+N days` style due dates
//! - `step_runner` -- Handlers for the leaf step types
//! - `recorder` -- Run and step-log persistence
//! - `executor` -- Sequential fail-fast runner with `for_each` expansion
//! - `scheduler` -- Cron evaluation and the tick scheduler
//! - `trigger` -- Manual, schedule, and webhook dispatch

pub mod definition;
pub mod executor;
pub mod formula;
pub mod recorder;
pub mod relative_date;
pub mod scheduler;
pub mod step_runner;
pub mod template;
pub mod trigger;
pub mod variables;

#[cfg(test)]
pub(crate) mod test_support;
