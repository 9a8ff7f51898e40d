// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only. Deciding what a classifier answer
// means for a submission lives in the submissions domain.
//
// Naming convention: Base* for trait names (e.g., BaseClassifier, BaseObjectStorage)

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use classifier::ClassifierError;
use serde_json::Value;

use crate::common::{OwnerId, SubmissionId};
use crate::domains::submissions::models::{AttachmentRef, Channel, Verdict};

// =============================================================================
// Classifier Trait (Infrastructure - external analysis service)
// =============================================================================

/// Everything the classifier needs to analyse one submission.
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub submission_id: SubmissionId,
    pub channel: Channel,
    /// Text body for text channels.
    pub content: Option<String>,
    /// Fetchable URLs of the uploaded files, in upload order.
    pub file_urls: Vec<String>,
    pub file_names: Vec<String>,
    /// Uploaded bytes, loaded only for channels whose endpoint takes the
    /// file itself rather than a URL.
    pub media: Option<MediaFile>,
    /// Where the classifier should deliver an asynchronous result.
    pub callback_url: String,
}

#[derive(Debug, Clone)]
pub struct MediaFile {
    pub filename: String,
    pub mime: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationOutcome {
    /// The classifier answered inline.
    Verdict { verdict: Verdict, raw: Value },
    /// The job was accepted; the result arrives through the webhook.
    Pending { raw: Value },
}

#[async_trait]
pub trait BaseClassifier: Send + Sync {
    /// Submit one analysis job. `timeout` bounds the whole call.
    async fn classify(
        &self,
        request: &ClassificationRequest,
        timeout: Duration,
    ) -> std::result::Result<ClassificationOutcome, ClassifierError>;
}

// =============================================================================
// Object Storage Trait (Infrastructure - uploaded files)
// =============================================================================

#[async_trait]
pub trait BaseObjectStorage: Send + Sync {
    /// Store one uploaded file and return a pointer to it.
    async fn put(
        &self,
        owner: OwnerId,
        filename: &str,
        mime: Option<&str>,
        bytes: Bytes,
    ) -> Result<AttachmentRef>;

    /// Load a stored object back.
    async fn read(&self, attachment: &AttachmentRef) -> Result<Bytes>;

    /// URL the classifier can fetch the object from.
    fn file_url(&self, attachment: &AttachmentRef) -> String;
}
