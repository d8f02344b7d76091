//! Scheduler error taxonomy

use serde::{Deserialize, Serialize};

/// Why a task ended in [`SchedulerError::WorkerTaskFailed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// The unit (or local fallback) reported an error
    ApplicationError,
    /// The task exceeded its time budget
    Timeout,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ApplicationError => f.write_str("application-error"),
            FailureReason::Timeout => f.write_str("timeout"),
        }
    }
}

/// Errors produced by the scheduler
///
/// Only the terminal variants ever reach a submitter; transient unit errors
/// are retried internally and never surface on their own.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    /// An execution unit could not be created. Reduces pool capacity only.
    #[error("failed to create execution unit {unit_id}: {reason}")]
    UnitCreationFailed { unit_id: String, reason: String },

    /// Retries were exhausted
    #[error("task failed ({reason}): {last_error}")]
    WorkerTaskFailed {
        reason: FailureReason,
        last_error: String,
    },

    /// No local implementation exists for the operation
    #[error("no local implementation for operation '{operation}' of task type '{task_type}'")]
    UnsupportedOperation {
        task_type: String,
        operation: String,
    },

    /// The scheduler was torn down while the task was outstanding
    #[error("scheduler is shutting down")]
    SchedulerShutdown,
}

impl SchedulerError {
    /// Whether the retry policy may act on this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::WorkerTaskFailed { .. })
    }

    /// The failure reason, for `WorkerTaskFailed`
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            SchedulerError::WorkerTaskFailed { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
