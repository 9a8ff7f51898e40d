//! Submission intake: inline text and uploaded files.

use bytes::Bytes;
use tracing::{info, warn};

use crate::common::{OwnerId, SubmissionId};
use crate::domains::submissions::actions::SubmissionLifecycle;
use crate::domains::submissions::activities::dispatch::{DispatchJob, DispatchQueue};
use crate::domains::submissions::errors::{SubmissionError, SubmissionResult};
use crate::domains::submissions::machines::{SubmissionStatus, Trigger};
use crate::domains::submissions::models::{Channel, NewSubmission, SubmissionRecord};
use crate::kernel::BaseObjectStorage;

/// One file part of an upload request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub mime: Option<String>,
    pub bytes: Bytes,
}

/// Create a text submission and queue it for classification.
///
/// Returns as soon as the record exists; classification happens on the
/// dispatch runner.
pub async fn submit_text(
    lifecycle: &SubmissionLifecycle,
    queue: &DispatchQueue,
    owner: OwnerId,
    channel: Channel,
    content: String,
) -> SubmissionResult<SubmissionRecord> {
    if !channel.is_text() {
        return Err(SubmissionError::validation(format!(
            "{} submissions must be uploaded as files",
            channel
        )));
    }

    let record = lifecycle
        .create(
            NewSubmission::builder()
                .owner_id(owner)
                .channel(channel)
                .content(content)
                .build(),
        )
        .await?;

    queue.enqueue(DispatchJob::for_record(&record));
    Ok(record)
}

/// Create a file submission and store its files.
///
/// The record is created in `UPLOADING` before any file is written so the
/// owner sees it immediately. A storage failure moves it to `ERROR`; the
/// caller gets the failed record back rather than an error, since the
/// submission itself was accepted. Dispatch is left to the caller so it can
/// answer the upload request first.
pub async fn submit_files(
    lifecycle: &SubmissionLifecycle,
    storage: &dyn BaseObjectStorage,
    owner: OwnerId,
    channel: Channel,
    files: Vec<UploadedFile>,
) -> SubmissionResult<SubmissionRecord> {
    if channel.is_text() {
        return Err(SubmissionError::validation(format!(
            "{} submissions carry text, not files",
            channel
        )));
    }
    if files.is_empty() {
        return Err(SubmissionError::validation("at least one file is required"));
    }

    let record = lifecycle
        .create(
            NewSubmission::builder()
                .owner_id(owner)
                .channel(channel)
                .build(),
        )
        .await?;
    let id = record.id();

    let mut attachments = Vec::with_capacity(files.len());
    for file in files {
        match storage
            .put(owner, &file.filename, file.mime.as_deref(), file.bytes)
            .await
        {
            Ok(attachment) => attachments.push(attachment),
            Err(e) => {
                warn!(submission_id = %id, error = %e, "upload failed");
                let applied = lifecycle
                    .apply(
                        id,
                        Trigger::UploadFailed {
                            reason: format!("upload of '{}' failed", file.filename),
                        },
                    )
                    .await?;
                return Ok(applied.into_record());
            }
        }
    }

    info!(submission_id = %id, files = attachments.len(), "upload stored");
    let applied = lifecycle
        .apply(id, Trigger::UploadSucceeded { attachments })
        .await?;
    Ok(applied.into_record())
}

/// Queue a freshly uploaded record for dispatch once the caller has
/// returned. Records whose upload failed are left alone.
pub fn queue_uploaded(queue: &DispatchQueue, record: &SubmissionRecord) {
    if record.status() == SubmissionStatus::Uploaded {
        queue.enqueue_detached(DispatchJob::for_record(record));
    }
}

/// Explicit retry of a failed submission: `ERROR` back to `QUEUED`, attempt
/// counter reset, job re-queued.
pub async fn retry_submission(
    lifecycle: &SubmissionLifecycle,
    queue: &DispatchQueue,
    id: SubmissionId,
    owner: OwnerId,
) -> SubmissionResult<SubmissionRecord> {
    lifecycle.get_for_owner(id, owner).await?;

    let record = lifecycle.apply(id, Trigger::Retry).await?.into_record();
    info!(submission_id = %id, "submission retry requested");

    queue.enqueue(DispatchJob::for_record(&record));
    Ok(record)
}
