//! Live-update events published to a submission's owner.

use serde::Serialize;
use serde_json::Value;

use crate::common::SubmissionId;
use crate::domains::submissions::machines::{SubmissionStatus, Trigger};
use crate::domains::submissions::models::{Channel, Report, Segment, SubmissionRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SubmissionEvent {
    SubmissionCreated {
        submission_id: SubmissionId,
        channel: Channel,
        status: SubmissionStatus,
    },
    AnalysisStarted {
        submission_id: SubmissionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    AnalysisUpdate {
        submission_id: SubmissionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    ReportReady {
        submission_id: SubmissionId,
        suspicious: bool,
        risk_score: f64,
        reasons: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        segments: Option<Vec<Segment>>,
    },
    Error {
        submission_id: SubmissionId,
        error: String,
        /// True when the record went back to the queue instead of failing.
        retrying: bool,
    },
}

impl SubmissionEvent {
    pub fn created(record: &SubmissionRecord) -> Self {
        SubmissionEvent::SubmissionCreated {
            submission_id: record.id(),
            channel: record.channel(),
            status: record.status(),
        }
    }

    pub fn report_ready(report: &Report) -> Self {
        SubmissionEvent::ReportReady {
            submission_id: report.submission_id,
            suspicious: report.verdict.suspicious,
            risk_score: report.verdict.risk_score,
            reasons: report.verdict.reasons.clone(),
            segments: report.verdict.segments.clone(),
        }
    }

    /// Event to announce after `trigger` has been applied to `record`.
    /// Bookkeeping moves (upload finished, dispatch accepted, retry queued)
    /// are not announced.
    pub fn after(
        record: &SubmissionRecord,
        trigger: &Trigger,
        report: Option<&Report>,
    ) -> Option<Self> {
        let submission_id = record.id();
        match trigger {
            Trigger::UploadSucceeded { .. } | Trigger::DispatchAccepted | Trigger::Retry => None,
            Trigger::UploadFailed { reason } => Some(SubmissionEvent::Error {
                submission_id,
                error: reason.clone(),
                retrying: false,
            }),
            Trigger::DispatchFailed { reason, .. } => Some(SubmissionEvent::Error {
                submission_id,
                error: reason.clone(),
                retrying: record.status() == SubmissionStatus::Queued,
            }),
            Trigger::AnalysisStarted { note } => Some(SubmissionEvent::AnalysisStarted {
                submission_id,
                note: note.clone(),
            }),
            Trigger::AnalysisUpdate { progress, note } => Some(SubmissionEvent::AnalysisUpdate {
                submission_id,
                progress: *progress,
                note: note.clone(),
            }),
            Trigger::ReportReady { .. } => report.map(SubmissionEvent::report_ready),
            Trigger::Failed { note } => Some(SubmissionEvent::Error {
                submission_id,
                error: note.clone(),
                retrying: false,
            }),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            SubmissionEvent::SubmissionCreated { .. } => "submission_created",
            SubmissionEvent::AnalysisStarted { .. } => "analysis_started",
            SubmissionEvent::AnalysisUpdate { .. } => "analysis_update",
            SubmissionEvent::ReportReady { .. } => "report_ready",
            SubmissionEvent::Error { .. } => "error",
        }
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
