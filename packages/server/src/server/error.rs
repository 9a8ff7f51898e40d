//! HTTP mapping for submission errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::domains::submissions::SubmissionError;

/// Uniform error body: `{"error": <kind>, "message": <text>}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

pub fn status_for(err: &SubmissionError) -> StatusCode {
    match err {
        SubmissionError::Validation(_) => StatusCode::BAD_REQUEST,
        SubmissionError::Authentication(_) => StatusCode::UNAUTHORIZED,
        SubmissionError::NotFound(_) => StatusCode::NOT_FOUND,
        SubmissionError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SubmissionError::Downstream(_) => StatusCode::BAD_GATEWAY,
        SubmissionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for SubmissionError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let message = match &self {
            SubmissionError::Internal(e) => {
                error!(error = %e, "request failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            error: self.kind(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
