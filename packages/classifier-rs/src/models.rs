use serde::{Deserialize, Serialize};

/// Body for `POST /detect_spam`.
#[derive(Debug, Clone, Serialize)]
pub struct SpamRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpamResponse {
    pub reference_id: Option<String>,
    pub is_spam: bool,
    pub probability: Option<f64>,
    pub latency_ms: Option<f64>,
    pub model: Option<String>,
}

/// Body for `POST /process` (generic image analysis).
#[derive(Debug, Clone, Serialize)]
pub struct ImageRequest {
    pub image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Verdict in the same shape the service uses for its callbacks.
///
/// Image analysis usually answers with raw predictions only, in which case
/// the verdict arrives later through the callback.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericVerdict {
    pub suspicious: bool,
    pub risk_score: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// Form body for `POST /process_document`.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRequest {
    pub file_url: String,
    pub doc_title: String,
    pub compact: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentResponse {
    pub confidence_score: f64,
    pub legitimate: bool,
    #[serde(default)]
    pub authenticity_issues: Option<Vec<String>>,
    #[serde(default)]
    pub suspicious_snippets: Option<Vec<String>>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
}

/// Media file for `POST /df/detect_deepfake_audio` and
/// `POST /df/detect_deepfake_video`, sent as the multipart `file` part.
#[derive(Debug, Clone)]
pub struct DeepfakeUpload {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeepfakeResponse {
    pub fake_score: f64,
    pub is_fake: bool,
    pub model: String,
}

/// What came back from one classifier call.
#[derive(Debug, Clone)]
pub enum Reply<T> {
    /// The service answered with a verdict in the response body.
    Complete { verdict: T, raw: serde_json::Value },
    /// The job was accepted; the verdict will be delivered to the callback URL.
    Accepted { raw: serde_json::Value },
}

impl<T> Reply<T> {
    pub fn raw(&self) -> &serde_json::Value {
        match self {
            Reply::Complete { raw, .. } | Reply::Accepted { raw } => raw,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Reply::Complete { .. })
    }
}
