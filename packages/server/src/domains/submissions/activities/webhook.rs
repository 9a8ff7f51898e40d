//! Ingestion of classifier callbacks.
//!
//! Order of checks: signature, payload shape, record lookup, transition.
//! The signature is checked before anything else so an unsigned caller
//! learns nothing about which submission ids exist.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::common::SubmissionId;
use crate::domains::submissions::actions::{Applied, SubmissionLifecycle};
use crate::domains::submissions::errors::{SubmissionError, SubmissionResult};
use crate::domains::submissions::machines::Trigger;
use crate::domains::submissions::models::{Segment, Verdict};
use crate::kernel::signature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookStatus {
    AnalysisStarted,
    AnalysisUpdate,
    ReportReady,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub submission_id: String,
    pub status: WebhookStatus,
    pub suspicious: Option<bool>,
    pub risk_score: Option<f64>,
    pub reasons: Option<Vec<String>>,
    pub segments: Option<Vec<Segment>>,
    pub progress: Option<f64>,
    pub note: Option<String>,
    pub raw: Option<Value>,
}

/// What a validated webhook asks the lifecycle to do.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookCommand {
    Transition(Trigger),
    Complete { verdict: Verdict, raw: Value },
}

impl WebhookPayload {
    /// Check the status-specific field requirements. `body` is the whole
    /// parsed payload, kept as the report's raw audit copy when the caller
    /// did not send a separate `raw` object.
    pub fn into_command(self, body: Value) -> SubmissionResult<(SubmissionId, WebhookCommand)> {
        let id = SubmissionId::parse(self.submission_id.trim()).map_err(|_| {
            SubmissionError::validation(format!("'{}' is not a submission id", self.submission_id))
        })?;

        let command = match self.status {
            WebhookStatus::AnalysisStarted => {
                WebhookCommand::Transition(Trigger::AnalysisStarted { note: self.note })
            }
            WebhookStatus::AnalysisUpdate => {
                if let Some(progress) = self.progress {
                    if !(0.0..=100.0).contains(&progress) {
                        return Err(SubmissionError::validation(format!(
                            "progress must be within [0, 100], got {}",
                            progress
                        )));
                    }
                }
                WebhookCommand::Transition(Trigger::AnalysisUpdate {
                    progress: self.progress,
                    note: self.note,
                })
            }
            WebhookStatus::ReportReady => {
                let suspicious = self.suspicious.ok_or_else(|| {
                    SubmissionError::validation("REPORT_READY requires 'suspicious'")
                })?;
                let risk_score = self.risk_score.ok_or_else(|| {
                    SubmissionError::validation("REPORT_READY requires 'riskScore'")
                })?;
                let verdict = Verdict::new(
                    suspicious,
                    risk_score,
                    self.reasons.unwrap_or_default(),
                    self.segments,
                )?;
                WebhookCommand::Complete {
                    verdict,
                    raw: self.raw.unwrap_or(body),
                }
            }
            WebhookStatus::Error => WebhookCommand::Transition(Trigger::Failed {
                note: self
                    .note
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| "analysis failed".to_string()),
            }),
        };

        Ok((id, command))
    }
}

#[derive(Clone)]
pub struct WebhookIngester {
    lifecycle: SubmissionLifecycle,
    secret: Arc<[u8]>,
}

impl WebhookIngester {
    pub fn new(lifecycle: SubmissionLifecycle, secret: impl AsRef<[u8]>) -> Self {
        Self {
            lifecycle,
            secret: Arc::from(secret.as_ref()),
        }
    }

    /// Verify, validate and apply one callback.
    pub async fn ingest(&self, signature: Option<&str>, body: &[u8]) -> SubmissionResult<Applied> {
        let Some(header) = signature else {
            warn!(body_len = body.len(), "webhook without signature rejected");
            return Err(SubmissionError::Authentication(
                "missing webhook signature".to_string(),
            ));
        };
        if !signature::verify(body, header, &self.secret) {
            warn!(body_len = body.len(), "webhook signature mismatch");
            return Err(SubmissionError::Authentication(
                "invalid webhook signature".to_string(),
            ));
        }

        let value: Value = serde_json::from_slice(body)
            .map_err(|e| SubmissionError::validation(format!("malformed webhook body: {}", e)))?;
        let payload: WebhookPayload = serde_json::from_value(value.clone())
            .map_err(|e| SubmissionError::validation(format!("invalid webhook payload: {}", e)))?;
        let (id, command) = payload.into_command(value)?;

        match command {
            WebhookCommand::Transition(trigger) => self.lifecycle.apply(id, trigger).await,
            WebhookCommand::Complete { verdict, raw } => {
                self.lifecycle.complete(id, verdict, raw).await
            }
        }
    }
}
