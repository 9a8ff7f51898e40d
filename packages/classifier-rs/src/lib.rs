// Client for the fraud analysis service (text, document, image and deepfake
// endpoints). Every call carries its own timeout because media analysis runs
// far longer than text checks.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub mod models;

pub use crate::models::*;

#[derive(Debug, Clone)]
pub struct ClassifierOptions {
    pub base_url: String,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier did not answer within {0:?}")]
    Timeout(Duration),

    #[error("classifier request failed: {0}")]
    Transport(String),

    #[error("classifier returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode classifier response: {0}")]
    Decode(String),

    #[error("could not build classifier request: {0}")]
    Request(String),
}

impl ClassifierError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClassifierError::Timeout(_) | ClassifierError::Transport(_) => true,
            ClassifierError::Status { status, .. } => *status >= 500 || *status == 429,
            ClassifierError::Decode(_) | ClassifierError::Request(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierService {
    options: ClassifierOptions,
    client: Client,
}

impl ClassifierService {
    pub fn new(options: ClassifierOptions) -> Self {
        Self::with_client(options, Client::new())
    }

    pub fn with_client(options: ClassifierOptions, client: Client) -> Self {
        Self { options, client }
    }

    pub fn base_url(&self) -> &str {
        &self.options.base_url
    }

    pub async fn detect_spam(
        &self,
        request: &SpamRequest,
        timeout: Duration,
    ) -> Result<Reply<SpamResponse>, ClassifierError> {
        let res = self
            .client
            .post(self.url("/detect_spam"))
            .json(request)
            .timeout(timeout)
            .send()
            .await;

        read_reply(res, timeout).await
    }

    pub async fn process_image(
        &self,
        request: &ImageRequest,
        timeout: Duration,
    ) -> Result<Reply<GenericVerdict>, ClassifierError> {
        let res = self
            .client
            .post(self.url("/process"))
            .json(request)
            .timeout(timeout)
            .send()
            .await;

        read_reply(res, timeout).await
    }

    pub async fn process_document(
        &self,
        request: &DocumentRequest,
        timeout: Duration,
    ) -> Result<Reply<DocumentResponse>, ClassifierError> {
        let res = self
            .client
            .post(self.url("/process_document"))
            .form(request)
            .timeout(timeout)
            .send()
            .await;

        read_reply(res, timeout).await
    }

    pub async fn detect_deepfake_audio(
        &self,
        upload: DeepfakeUpload,
        timeout: Duration,
    ) -> Result<Reply<DeepfakeResponse>, ClassifierError> {
        self.post_media("/df/detect_deepfake_audio", upload, timeout)
            .await
    }

    pub async fn detect_deepfake_video(
        &self,
        upload: DeepfakeUpload,
        timeout: Duration,
    ) -> Result<Reply<DeepfakeResponse>, ClassifierError> {
        self.post_media("/df/detect_deepfake_video", upload, timeout)
            .await
    }

    /// The deepfake endpoints take the media itself as a multipart `file`
    /// upload and always answer inline.
    async fn post_media(
        &self,
        path: &str,
        upload: DeepfakeUpload,
        timeout: Duration,
    ) -> Result<Reply<DeepfakeResponse>, ClassifierError> {
        let part = Part::bytes(upload.bytes)
            .file_name(upload.filename)
            .mime_str(&upload.mime)
            .map_err(|e| ClassifierError::Request(e.to_string()))?;
        let form = Form::new().part("file", part);

        let res = self
            .client
            .post(self.url(path))
            .multipart(form)
            .timeout(timeout)
            .send()
            .await;

        read_reply(res, timeout).await
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.options.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> ClassifierError {
    if err.is_timeout() {
        ClassifierError::Timeout(timeout)
    } else {
        ClassifierError::Transport(err.to_string())
    }
}

/// Turn an HTTP response into a [`Reply`].
///
/// `202 Accepted`, or a success body that does not carry the expected verdict
/// fields, means the result will be posted to the callback URL later.
async fn read_reply<T: DeserializeOwned>(
    res: Result<Response, reqwest::Error>,
    timeout: Duration,
) -> Result<Reply<T>, ClassifierError> {
    let response = res.map_err(|e| transport_error(e, timeout))?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), "classifier returned an error status");
        return Err(ClassifierError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_error(e, timeout))?;

    let raw: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).map_err(|e| ClassifierError::Decode(e.to_string()))?
    };

    if status == StatusCode::ACCEPTED {
        return Ok(Reply::Accepted { raw });
    }

    match serde_json::from_value::<T>(raw.clone()) {
        Ok(verdict) => Ok(Reply::Complete { verdict, raw }),
        Err(e) => {
            tracing::debug!(error = %e, "response carries no verdict, awaiting callback");
            Ok(Reply::Accepted { raw })
        }
    }
}
