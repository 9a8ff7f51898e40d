//! Submission intake and lookup.

use axum::{
    extract::{multipart::MultipartError, rejection::JsonRejection, Extension, Multipart, Path},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::SubmissionId;
use crate::domains::submissions::actions::{
    queue_uploaded, retry_submission, submit_files, submit_text, UploadedFile,
};
use crate::domains::submissions::models::{Channel, Report, SubmissionRecord};
use crate::domains::submissions::{SubmissionError, SubmissionResult, SubmissionStatus};
use crate::server::app::AppState;
use crate::server::middleware::AuthOwner;

#[derive(Debug, Deserialize)]
pub struct CreateSubmissionRequest {
    pub channel: String,
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionAccepted {
    pub submission_id: SubmissionId,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&SubmissionRecord> for SubmissionAccepted {
    fn from(record: &SubmissionRecord) -> Self {
        Self {
            submission_id: record.id(),
            status: record.status(),
            last_error: record.last_error().map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmissionView {
    #[serde(flatten)]
    pub record: SubmissionRecord,
    pub report: Option<Report>,
}

fn parse_id(raw: &str) -> SubmissionResult<SubmissionId> {
    SubmissionId::parse(raw.trim())
        .map_err(|_| SubmissionError::validation(format!("'{}' is not a submission id", raw)))
}

/// POST /api/submissions
pub async fn create_submission_handler(
    Extension(state): Extension<AppState>,
    owner: Option<Extension<AuthOwner>>,
    body: Result<Json<CreateSubmissionRequest>, JsonRejection>,
) -> SubmissionResult<(StatusCode, Json<SubmissionAccepted>)> {
    let owner = AuthOwner::require(owner)?;
    let Json(request) = body.map_err(|e| SubmissionError::validation(e.body_text()))?;
    let channel: Channel = request.channel.parse()?;

    let record = submit_text(
        &state.lifecycle,
        &state.queue,
        owner,
        channel,
        request.content.unwrap_or_default(),
    )
    .await?;

    info!(submission_id = %record.id(), owner_id = %owner, %channel, "text submission accepted");
    Ok((StatusCode::CREATED, Json(SubmissionAccepted::from(&record))))
}

fn multipart_error(e: MultipartError) -> SubmissionError {
    SubmissionError::validation(format!("invalid upload: {}", e.body_text()))
}

/// POST /api/submissions/upload
///
/// Multipart body with a `channel` field and one or more `file` parts.
pub async fn upload_submission_handler(
    Extension(state): Extension<AppState>,
    owner: Option<Extension<AuthOwner>>,
    mut multipart: Multipart,
) -> SubmissionResult<(StatusCode, Json<SubmissionAccepted>)> {
    let owner = AuthOwner::require(owner)?;

    let mut channel: Option<Channel> = None;
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("channel") => {
                let raw = field.text().await.map_err(multipart_error)?;
                channel = Some(raw.parse()?);
            }
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let mime = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(multipart_error)?;
                if bytes.len() > state.upload_max_bytes {
                    return Err(SubmissionError::validation(format!(
                        "'{}' exceeds the {} MB upload limit",
                        filename,
                        state.upload_max_bytes / (1024 * 1024)
                    )));
                }
                files.push(UploadedFile {
                    filename,
                    mime,
                    bytes,
                });
            }
            _ => {}
        }
    }

    let channel = channel.ok_or_else(|| SubmissionError::validation("missing 'channel' field"))?;
    let record = submit_files(
        &state.lifecycle,
        state.deps.storage.as_ref(),
        owner,
        channel,
        files,
    )
    .await?;

    let status = if record.status() == SubmissionStatus::Error {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::CREATED
    };
    let response = (status, Json(SubmissionAccepted::from(&record)));

    queue_uploaded(&state.queue, &record);
    Ok(response)
}

/// GET /api/submissions/:id
pub async fn get_submission_handler(
    Extension(state): Extension<AppState>,
    owner: Option<Extension<AuthOwner>>,
    Path(id): Path<String>,
) -> SubmissionResult<Json<SubmissionView>> {
    let owner = AuthOwner::require(owner)?;
    let id = parse_id(&id)?;

    let record = state.lifecycle.get_for_owner(id, owner).await?;
    let report = match record.report_ref() {
        Some(_) => state.lifecycle.find_report(id).await?,
        None => None,
    };

    Ok(Json(SubmissionView { record, report }))
}

/// POST /api/submissions/:id/retry
pub async fn retry_submission_handler(
    Extension(state): Extension<AppState>,
    owner: Option<Extension<AuthOwner>>,
    Path(id): Path<String>,
) -> SubmissionResult<Json<SubmissionAccepted>> {
    let owner = AuthOwner::require(owner)?;
    let id = parse_id(&id)?;

    let record = retry_submission(&state.lifecycle, &state.queue, id, owner).await?;
    Ok(Json(SubmissionAccepted::from(&record)))
}
