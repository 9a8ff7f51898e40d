//! Server dependencies (using traits for testability)
//!
//! This module provides the central dependency container used by the
//! submission actions, the dispatcher and the HTTP layer. External services
//! are held behind trait objects so tests can swap them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use classifier::{
    ClassifierError, ClassifierService, DeepfakeResponse, DeepfakeUpload, DocumentRequest,
    DocumentResponse, GenericVerdict, ImageRequest, Reply, SpamRequest, SpamResponse,
};

use crate::domains::submissions::data::SubmissionStore;
use crate::domains::submissions::models::{Channel, Verdict};
use crate::kernel::event_bus::EventBus;
use crate::kernel::{
    BaseClassifier, BaseObjectStorage, ClassificationOutcome, ClassificationRequest,
};

// =============================================================================
// ClassifierService Adapter (implements BaseClassifier trait)
// =============================================================================

/// Routes each channel to its analysis endpoint and maps the endpoint's
/// answer onto a verdict.
pub struct ClassifierAdapter(pub Arc<ClassifierService>);

impl ClassifierAdapter {
    pub fn new(service: Arc<ClassifierService>) -> Self {
        Self(service)
    }
}

fn first_url(request: &ClassificationRequest) -> Result<String, ClassifierError> {
    request.file_urls.first().cloned().ok_or_else(|| {
        ClassifierError::Decode(format!(
            "{} submission {} has no attachment to analyse",
            request.channel, request.submission_id
        ))
    })
}

fn media_upload(request: &ClassificationRequest) -> Result<DeepfakeUpload, ClassifierError> {
    let media = request.media.as_ref().ok_or_else(|| {
        ClassifierError::Request(format!(
            "{} submission {} has no media loaded",
            request.channel, request.submission_id
        ))
    })?;
    Ok(DeepfakeUpload {
        filename: media.filename.clone(),
        mime: media.mime.clone(),
        bytes: media.bytes.to_vec(),
    })
}

fn into_outcome<T>(
    reply: Reply<T>,
    to_verdict: impl FnOnce(T) -> Option<Verdict>,
) -> ClassificationOutcome {
    match reply {
        Reply::Complete { verdict, raw } => match to_verdict(verdict) {
            Some(verdict) => ClassificationOutcome::Verdict { verdict, raw },
            None => ClassificationOutcome::Pending { raw },
        },
        Reply::Accepted { raw } => ClassificationOutcome::Pending { raw },
    }
}

pub fn spam_verdict(response: SpamResponse) -> Option<Verdict> {
    let probability = response
        .probability
        .unwrap_or(if response.is_spam { 1.0 } else { 0.0 });
    let reasons = if response.is_spam {
        vec!["Flagged as spam".to_string()]
    } else {
        Vec::new()
    };
    Verdict::from_probability(response.is_spam, probability, reasons).ok()
}

pub fn generic_verdict(response: GenericVerdict) -> Option<Verdict> {
    Verdict::from_probability(response.suspicious, response.risk_score, response.reasons).ok()
}

pub fn document_verdict(response: DocumentResponse) -> Option<Verdict> {
    let reasons = response.authenticity_issues.unwrap_or_default();
    Verdict::from_probability(!response.legitimate, 1.0 - response.confidence_score, reasons).ok()
}

pub fn deepfake_verdict(response: DeepfakeResponse) -> Option<Verdict> {
    let reasons = if response.is_fake {
        vec![format!("Likely synthetic media ({})", response.model)]
    } else {
        Vec::new()
    };
    Verdict::from_probability(response.is_fake, response.fake_score, reasons).ok()
}

#[async_trait]
impl BaseClassifier for ClassifierAdapter {
    async fn classify(
        &self,
        request: &ClassificationRequest,
        timeout: Duration,
    ) -> Result<ClassificationOutcome, ClassifierError> {
        let reference_id = Some(request.submission_id.to_string());
        let callback_url = Some(request.callback_url.clone());

        let outcome = match request.channel {
            Channel::Sms | Channel::Email | Channel::Chat => {
                let body = SpamRequest {
                    text: request.content.clone().unwrap_or_default(),
                    reference_id,
                    callback_url,
                };
                into_outcome(self.0.detect_spam(&body, timeout).await?, spam_verdict)
            }
            Channel::Image => {
                let body = ImageRequest {
                    image_url: first_url(request)?,
                    reference_id,
                    callback_url,
                };
                into_outcome(self.0.process_image(&body, timeout).await?, generic_verdict)
            }
            Channel::Document => {
                let body = DocumentRequest {
                    file_url: first_url(request)?,
                    doc_title: request
                        .file_names
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "document".to_string()),
                    compact: true,
                    reference_id,
                    callback_url,
                };
                into_outcome(
                    self.0.process_document(&body, timeout).await?,
                    document_verdict,
                )
            }
            Channel::Audio => into_outcome(
                self.0
                    .detect_deepfake_audio(media_upload(request)?, timeout)
                    .await?,
                deepfake_verdict,
            ),
            Channel::Video => into_outcome(
                self.0
                    .detect_deepfake_video(media_upload(request)?, timeout)
                    .await?,
                deepfake_verdict,
            ),
        };

        Ok(outcome)
    }
}

// =============================================================================
// ServerDeps
// =============================================================================

/// Server dependencies accessible to actions and handlers.
#[derive(Clone)]
pub struct ServerDeps {
    pub store: Arc<dyn SubmissionStore>,
    pub classifier: Arc<dyn BaseClassifier>,
    pub storage: Arc<dyn BaseObjectStorage>,
    /// Live fan-out to SSE connections
    pub event_bus: EventBus,
}

impl ServerDeps {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        classifier: Arc<dyn BaseClassifier>,
        storage: Arc<dyn BaseObjectStorage>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            store,
            classifier,
            storage,
            event_bus,
        }
    }
}
