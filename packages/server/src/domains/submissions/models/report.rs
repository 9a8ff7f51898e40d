use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{ReportId, SubmissionId};
use crate::domains::submissions::errors::{SubmissionError, SubmissionResult};

/// A flagged time range inside audio or video content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSegment")]
pub struct Segment {
    start: f64,
    end: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

#[derive(Deserialize)]
struct RawSegment {
    start: f64,
    end: f64,
    #[serde(default)]
    label: Option<String>,
}

impl TryFrom<RawSegment> for Segment {
    type Error = SubmissionError;

    fn try_from(raw: RawSegment) -> Result<Self, Self::Error> {
        Segment::new(raw.start, raw.end, raw.label)
    }
}

impl Segment {
    pub fn new(start: f64, end: f64, label: Option<String>) -> SubmissionResult<Self> {
        if !start.is_finite() || !end.is_finite() {
            return Err(SubmissionError::validation(
                "segment bounds must be finite numbers",
            ));
        }
        if start > end {
            return Err(SubmissionError::validation(format!(
                "segment start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end, label })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

/// The interpreted part of a classifier result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawVerdict")]
pub struct Verdict {
    pub suspicious: bool,
    pub risk_score: f64,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Segment>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVerdict {
    suspicious: bool,
    risk_score: f64,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    segments: Option<Vec<Segment>>,
}

impl TryFrom<RawVerdict> for Verdict {
    type Error = SubmissionError;

    fn try_from(raw: RawVerdict) -> Result<Self, Self::Error> {
        Verdict::new(raw.suspicious, raw.risk_score, raw.reasons, raw.segments)
    }
}

impl Verdict {
    pub fn new(
        suspicious: bool,
        risk_score: f64,
        reasons: Vec<String>,
        segments: Option<Vec<Segment>>,
    ) -> SubmissionResult<Self> {
        if !(0.0..=1.0).contains(&risk_score) {
            return Err(SubmissionError::validation(format!(
                "riskScore must be within [0, 1], got {}",
                risk_score
            )));
        }
        Ok(Self {
            suspicious,
            risk_score,
            reasons,
            segments,
        })
    }

    /// Clamp a classifier probability into a valid score. Non-finite input
    /// is rejected rather than guessed at.
    pub fn from_probability(
        suspicious: bool,
        probability: f64,
        reasons: Vec<String>,
    ) -> SubmissionResult<Self> {
        if !probability.is_finite() {
            return Err(SubmissionError::validation(
                "classifier returned a non-finite score",
            ));
        }
        Self::new(suspicious, probability.clamp(0.0, 1.0), reasons, None)
    }
}

/// Analysis result for one submission. At most one exists per submission;
/// a later write for the same submission replaces the content in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: ReportId,
    pub submission_id: SubmissionId,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub raw: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    pub fn new(submission_id: SubmissionId, verdict: Verdict, raw: Value) -> Self {
        let now = Utc::now();
        Self {
            id: ReportId::new(),
            submission_id,
            verdict,
            raw,
            created_at: now,
            updated_at: now,
        }
    }
}
