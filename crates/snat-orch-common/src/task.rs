//! Job status and error classification.

use thiserror::Error;

/// Classified result of running one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Job completed successfully
    Success,
    /// Job rejected because of bad configuration; never retried
    InvalidEntry,
    /// Job aborted permanently
    Failed,
    /// Transient failure, job should be retried
    NeedRetry,
    /// Job had nothing to do
    Ignore,
}

impl TaskStatus {
    /// Returns true if the job completed (or had nothing to do).
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Ignore)
    }

    /// Returns true if the job should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::NeedRetry)
    }

    /// Returns true if the job failed permanently.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::InvalidEntry | TaskStatus::Failed)
    }
}

/// Error type for job failures.
///
/// Component errors convert into one of these variants; the variant decides
/// how the job queue treats the failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Missing router, external network or provider information.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Flow, group, label or route RPC failed; the sequence may be re-driven.
    #[error("Southbound failure: {message}")]
    Southbound { message: String },

    /// Operation aborted and must not be retried as-is.
    #[error("Aborted: {reason}")]
    Aborted { reason: String },

    /// Event did not apply to current state.
    #[error("Ignored: {reason}")]
    Ignored { reason: String },

    /// Internal invariant violation.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TaskError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        TaskError::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn southbound(message: impl Into<String>) -> Self {
        TaskError::Southbound {
            message: message.into(),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        TaskError::Aborted {
            reason: reason.into(),
        }
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        TaskError::Ignored {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        TaskError::Internal {
            message: message.into(),
        }
    }

    /// Converts this error to a TaskStatus.
    pub fn to_status(&self) -> TaskStatus {
        match self {
            TaskError::InvalidConfig { .. } => TaskStatus::InvalidEntry,
            TaskError::Southbound { .. } => TaskStatus::NeedRetry,
            TaskError::Aborted { .. } => TaskStatus::Failed,
            TaskError::Ignored { .. } => TaskStatus::Ignore,
            TaskError::Internal { .. } => TaskStatus::Failed,
        }
    }
}

/// Result type for job processing.
pub type TaskResult<T> = Result<T, TaskError>;

/// Extension trait for converting TaskResult to TaskStatus.
pub trait TaskResultExt {
    fn to_status(&self) -> TaskStatus;
}

impl<T> TaskResultExt for TaskResult<T> {
    fn to_status(&self) -> TaskStatus {
        match self {
            Ok(_) => TaskStatus::Success,
            Err(e) => e.to_status(),
        }
    }
}
