//! Execution run recorder.
//!
//! Wraps `WorkflowRepository` with the run lifecycle the runner needs:
//! create the `running` row, append ordered step log entries, track
//! progress, and finalize exactly once. Log entries are persisted as they
//! happen so that a run can be polled while it executes.

use chrono::Utc;
use dashmap::DashMap;
use stratum_types::error::RepositoryError;
use stratum_types::workflow::{ExecutionRun, RunStatus, StepLogEntry};
use uuid::Uuid;

use crate::repository::workflow::{RunFinalization, WorkflowRepository};

/// Failure message written to runs left `running` by a previous process.
pub const INTERRUPTED_MESSAGE: &str = "run interrupted by engine restart";

// ---------------------------------------------------------------------------
// RunRecorder
// ---------------------------------------------------------------------------

/// Persists execution runs and their step logs.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend
/// (SQLite, in-memory mock, etc.).
pub struct RunRecorder<R: WorkflowRepository> {
    repo: R,
    /// Next log `seq` per active run.
    next_seq: DashMap<Uuid, u32>,
}

impl<R: WorkflowRepository> RunRecorder<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            next_seq: DashMap::new(),
        }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Persist a new run. Its status must be `Running`.
    pub async fn start_run(&self, run: &ExecutionRun) -> Result<(), RecorderError> {
        self.repo
            .create_run(run)
            .await
            .map_err(|e| RecorderError::Repository(e.to_string()))?;
        self.next_seq.insert(run.id, 0);

        tracing::debug!(run_id = %run.id, workflow = run.workflow_name.as_str(), "recorded run start");
        Ok(())
    }

    /// Append a step log entry at the next position for the run.
    ///
    /// Returns the entry's `seq`.
    pub async fn append(&self, run_id: Uuid, entry: &StepLogEntry) -> Result<u32, RecorderError> {
        let seq = {
            let mut next = self.next_seq.entry(run_id).or_insert(0);
            let seq = *next;
            *next += 1;
            seq
        };
        self.repo
            .append_step_log(&run_id, seq, entry)
            .await
            .map_err(|e| RecorderError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run_id,
            seq,
            step = entry.step.as_str(),
            success = entry.success,
            "recorded step log"
        );
        Ok(seq)
    }

    pub async fn progress(&self, run_id: Uuid, steps_completed: u32) -> Result<(), RecorderError> {
        self.repo
            .update_run_progress(&run_id, steps_completed)
            .await
            .map_err(|e| RecorderError::Repository(e.to_string()))
    }

    /// Move the run to its terminal state. A second call fails with
    /// `AlreadyFinalized` and changes nothing.
    pub async fn finalize(
        &self,
        run_id: Uuid,
        fin: &RunFinalization,
    ) -> Result<(), RecorderError> {
        let result = self.repo.finalize_run(&run_id, fin).await;
        self.next_seq.remove(&run_id);
        match result {
            Ok(()) => {
                tracing::debug!(run_id = %run_id, status = %fin.status, "recorded run finalization");
                Ok(())
            }
            Err(RepositoryError::NotFound) => Err(RecorderError::RunNotFound(run_id)),
            Err(RepositoryError::Conflict(_)) => Err(RecorderError::AlreadyFinalized(run_id)),
            Err(e) => Err(RecorderError::Repository(e.to_string())),
        }
    }

    /// Fail every run still marked `running`. Called once at startup, before
    /// any new run is dispatched. Returns the number of runs recovered.
    pub async fn recover_interrupted(&self) -> Result<usize, RecorderError> {
        let running = self
            .repo
            .list_running_runs()
            .await
            .map_err(|e| RecorderError::Repository(e.to_string()))?;

        let mut recovered = 0;
        for run in running {
            let now = Utc::now();
            let duration_ms = (now - run.started_at).num_milliseconds().max(0) as u64;
            let fin = RunFinalization {
                status: RunStatus::Failed,
                completed_at: now,
                duration_ms,
                steps_completed: run.steps_completed,
                result_data: None,
                error_message: Some(INTERRUPTED_MESSAGE.to_string()),
            };
            match self.finalize(run.id, &fin).await {
                Ok(()) => {
                    recovered += 1;
                    tracing::warn!(run_id = %run.id, workflow = run.workflow_name.as_str(), "{INTERRUPTED_MESSAGE}");
                }
                // Finalized concurrently; nothing left to do.
                Err(RecorderError::AlreadyFinalized(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while recording a run.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// Underlying repository operation failed.
    #[error("run recorder repository error: {0}")]
    Repository(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("workflow run {0} is already finalized")]
    AlreadyFinalized(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_support::{MemoryWorkflowRepo, log_entry, running_run};

    #[tokio::test]
    async fn test_append_assigns_increasing_seq() {
        let repo = MemoryWorkflowRepo::default();
        let recorder = RunRecorder::new(repo.clone());
        let run = running_run(Uuid::now_v7(), "wf");
        recorder.start_run(&run).await.unwrap();

        assert_eq!(recorder.append(run.id, &log_entry("a", true)).await.unwrap(), 0);
        assert_eq!(recorder.append(run.id, &log_entry("b", true)).await.unwrap(), 1);
        assert_eq!(recorder.append(run.id, &log_entry("c", false)).await.unwrap(), 2);

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        let steps: Vec<&str> = stored.execution_log.iter().map(|e| e.step.as_str()).collect();
        assert_eq!(steps, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_finalize_exactly_once() {
        let repo = MemoryWorkflowRepo::default();
        let recorder = RunRecorder::new(repo.clone());
        let run = running_run(Uuid::now_v7(), "wf");
        recorder.start_run(&run).await.unwrap();

        let fin = RunFinalization {
            status: RunStatus::Completed,
            completed_at: Utc::now(),
            duration_ms: 12,
            steps_completed: 3,
            result_data: None,
            error_message: None,
        };
        recorder.finalize(run.id, &fin).await.unwrap();

        let again = RunFinalization {
            status: RunStatus::Failed,
            error_message: Some("late".into()),
            ..fin
        };
        let err = recorder.finalize(run.id, &again).await.unwrap_err();
        assert!(matches!(err, RecorderError::AlreadyFinalized(id) if id == run.id));

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.error_message, None);
    }

    #[tokio::test]
    async fn test_finalize_unknown_run() {
        let recorder = RunRecorder::new(MemoryWorkflowRepo::default());
        let fin = RunFinalization {
            status: RunStatus::Completed,
            completed_at: Utc::now(),
            duration_ms: 0,
            steps_completed: 0,
            result_data: None,
            error_message: None,
        };
        let err = recorder.finalize(Uuid::now_v7(), &fin).await.unwrap_err();
        assert!(matches!(err, RecorderError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_recover_interrupted_runs() {
        let repo = MemoryWorkflowRepo::default();
        let recorder = RunRecorder::new(repo.clone());
        let a = running_run(Uuid::now_v7(), "wf-a");
        let b = running_run(Uuid::now_v7(), "wf-b");
        recorder.start_run(&a).await.unwrap();
        recorder.start_run(&b).await.unwrap();

        assert_eq!(recorder.recover_interrupted().await.unwrap(), 2);
        assert_eq!(recorder.recover_interrupted().await.unwrap(), 0);

        let stored = repo.get_run(&a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert!(stored.completed_at.is_some());
    }
}
