//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use stratum_core::workflow::definition::WorkflowError;
use stratum_core::workflow::executor::ExecutorError;
use stratum_core::workflow::trigger::TriggerError;
use stratum_infra::workflow::webhook_handler::WebhookError;
use stratum_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// A workflow, run or webhook that does not exist.
    NotFound { code: &'static str, message: String },
    /// The request conflicts with current state (name taken, run in progress).
    Conflict(String),
    /// Malformed or invalid input.
    Validation(String),
    /// Webhook authentication failure.
    Unauthorized(String),
    /// The server cannot check the request (e.g. webhook secret unset).
    Unavailable(String),
    Internal(String),
}

impl AppError {
    pub fn workflow_not_found(id: impl std::fmt::Display) -> Self {
        AppError::NotFound {
            code: "WORKFLOW_NOT_FOUND",
            message: format!("workflow not found: {id}"),
        }
    }

    pub fn run_not_found(id: &Uuid) -> Self {
        AppError::NotFound {
            code: "RUN_NOT_FOUND",
            message: format!("workflow run not found: {id}"),
        }
    }

    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg.clone())
            }
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        }
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound => AppError::NotFound {
                code: "NOT_FOUND",
                message: "resource not found".to_string(),
            },
            RepositoryError::Conflict(msg) => AppError::Conflict(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<WorkflowError> for AppError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::IoError(io) => AppError::Internal(io.to_string()),
            other => AppError::Validation(other.to_string()),
        }
    }
}

impl From<TriggerError> for AppError {
    fn from(e: TriggerError) -> Self {
        match e {
            TriggerError::WebhookNotFound(_) => AppError::NotFound {
                code: "WEBHOOK_NOT_FOUND",
                message: e.to_string(),
            },
            TriggerError::Executor(ExecutorError::WorkflowNotFound(id)) => {
                AppError::workflow_not_found(id)
            }
            TriggerError::Executor(ExecutorError::RunNotFound(id)) => AppError::run_not_found(&id),
            TriggerError::Executor(
                ref inner @ (ExecutorError::AlreadyRunning(_)
                | ExecutorError::QueueFull(_)
                | ExecutorError::Disabled(_)),
            ) => AppError::Conflict(inner.to_string()),
            TriggerError::Executor(ref inner @ ExecutorError::EmptyWorkflow(_)) => {
                AppError::Validation(inner.to_string())
            }
            TriggerError::Scheduler(ref inner) => AppError::Validation(inner.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(e: WebhookError) -> Self {
        match e {
            WebhookError::SecretUnavailable(_) => AppError::Unavailable(e.to_string()),
            WebhookError::InvalidKey(_) => AppError::Internal(e.to_string()),
            other => AppError::Unauthorized(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        } else {
            tracing::debug!(code, error = %message, "request rejected");
        }

        ApiResponse::error(code, &message, Uuid::now_v7().to_string(), 0).into_response_with(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_errors_map_to_statuses() {
        let cases = [
            (
                AppError::from(TriggerError::Executor(ExecutorError::AlreadyRunning("a".into()))),
                StatusCode::CONFLICT,
            ),
            (
                AppError::from(TriggerError::Executor(ExecutorError::QueueFull("a".into()))),
                StatusCode::CONFLICT,
            ),
            (
                AppError::from(TriggerError::Executor(ExecutorError::Disabled("a".into()))),
                StatusCode::CONFLICT,
            ),
            (
                AppError::from(TriggerError::WebhookNotFound("hook".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::from(TriggerError::Executor(ExecutorError::RunNotFound(Uuid::nil()))),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.parts().0, status, "{err:?}");
        }
    }

    #[test]
    fn test_webhook_errors_map_to_statuses() {
        assert_eq!(
            AppError::from(WebhookError::BadSignature).parts().0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(WebhookError::MissingHeader("Authorization")).parts().0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(WebhookError::SecretUnavailable("HOOK".into())).parts().0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_repository_conflict_keeps_message() {
        let err = AppError::from(RepositoryError::Conflict("workflow name 'x' already exists".into()));
        let (status, code, message) = err.parts();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, "CONFLICT");
        assert_eq!(message, "workflow name 'x' already exists");
    }
}
