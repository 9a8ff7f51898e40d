//! Classifier callback endpoint.

use axum::{extract::Extension, http::HeaderMap, Json};
use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use crate::common::SubmissionId;
use crate::domains::submissions::{SubmissionResult, SubmissionStatus};
use crate::kernel::signature::SIGNATURE_HEADER;
use crate::server::app::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub submission_id: SubmissionId,
    pub status: SubmissionStatus,
    pub applied: bool,
}

/// POST /api/webhooks/analysis
///
/// The body is taken raw so the signature is checked over the exact bytes
/// the classifier signed.
pub async fn analysis_webhook_handler(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> SubmissionResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let applied = state.ingester.ingest(signature, &body).await?;
    let record = applied.record();
    debug!(
        submission_id = %record.id(),
        status = %record.status(),
        changed = applied.is_changed(),
        "webhook applied"
    );

    Ok(Json(WebhookAck {
        submission_id: record.id(),
        status: record.status(),
        applied: applied.is_changed(),
    }))
}
