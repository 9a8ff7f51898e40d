use thiserror::Error;

use super::machines::{SubmissionStatus, TriggerKind};

/// Failures a submission operation can report to its caller.
#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authentication(String),

    #[error("submission {0} not found")]
    NotFound(String),

    #[error("cannot apply {trigger} to a submission in {from}")]
    InvalidTransition {
        from: SubmissionStatus,
        trigger: TriggerKind,
    },

    #[error("analysis service failure: {0}")]
    Downstream(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SubmissionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Short machine-readable name used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SubmissionError::Validation(_) => "validation_error",
            SubmissionError::Authentication(_) => "authentication_error",
            SubmissionError::NotFound(_) => "not_found",
            SubmissionError::InvalidTransition { .. } => "invalid_transition",
            SubmissionError::Downstream(_) => "downstream_failure",
            SubmissionError::Internal(_) => "internal_error",
        }
    }
}

pub type SubmissionResult<T> = Result<T, SubmissionError>;
