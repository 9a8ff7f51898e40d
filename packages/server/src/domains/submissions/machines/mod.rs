//! Submission lifecycle state machine.
//!
//! `SubmissionMachine::apply` is the only code path that changes a record's
//! status. Both the dispatch path and the webhook path go through it, so an
//! out-of-order delivery is rejected by the source-state check instead of
//! being written over newer state.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::common::ReportId;
use crate::domains::submissions::errors::{SubmissionError, SubmissionResult};
use crate::domains::submissions::models::{AttachmentRef, SubmissionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Submitted,
    Uploading,
    Uploaded,
    Dispatched,
    Queued,
    AnalysisStarted,
    AnalysisUpdate,
    /// Never stored. Attaching a report moves the record straight to `Completed`.
    ReportReady,
    Completed,
    Error,
}

impl SubmissionStatus {
    pub const ALL: [SubmissionStatus; 10] = [
        SubmissionStatus::Submitted,
        SubmissionStatus::Uploading,
        SubmissionStatus::Uploaded,
        SubmissionStatus::Dispatched,
        SubmissionStatus::Queued,
        SubmissionStatus::AnalysisStarted,
        SubmissionStatus::AnalysisUpdate,
        SubmissionStatus::ReportReady,
        SubmissionStatus::Completed,
        SubmissionStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Submitted => "SUBMITTED",
            SubmissionStatus::Uploading => "UPLOADING",
            SubmissionStatus::Uploaded => "UPLOADED",
            SubmissionStatus::Dispatched => "DISPATCHED",
            SubmissionStatus::Queued => "QUEUED",
            SubmissionStatus::AnalysisStarted => "ANALYSIS_STARTED",
            SubmissionStatus::AnalysisUpdate => "ANALYSIS_UPDATE",
            SubmissionStatus::ReportReady => "REPORT_READY",
            SubmissionStatus::Completed => "COMPLETED",
            SubmissionStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionStatus::Completed | SubmissionStatus::Error)
    }

    /// States a record waits in until the dispatch queue picks it up.
    pub fn awaits_dispatch(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Submitted | SubmissionStatus::Uploaded | SubmissionStatus::Queued
        )
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = SubmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubmissionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SubmissionError::validation(format!("unknown status '{}'", s)))
    }
}

/// Something that happened to a submission and may move it to a new state.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    UploadSucceeded { attachments: Vec<AttachmentRef> },
    UploadFailed { reason: String },
    DispatchAccepted,
    /// The classifier could not be reached, errored, or timed out.
    DispatchFailed { reason: String, retryable: bool },
    AnalysisStarted { note: Option<String> },
    AnalysisUpdate { progress: Option<f64>, note: Option<String> },
    ReportReady { report_id: ReportId },
    /// The classifier reported that analysis failed.
    Failed { note: String },
    /// Explicit operator action that puts a failed record back in the queue.
    Retry,
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::UploadSucceeded { .. } => TriggerKind::UploadSucceeded,
            Trigger::UploadFailed { .. } => TriggerKind::UploadFailed,
            Trigger::DispatchAccepted => TriggerKind::DispatchAccepted,
            Trigger::DispatchFailed { .. } => TriggerKind::DispatchFailed,
            Trigger::AnalysisStarted { .. } => TriggerKind::AnalysisStarted,
            Trigger::AnalysisUpdate { .. } => TriggerKind::AnalysisUpdate,
            Trigger::ReportReady { .. } => TriggerKind::ReportReady,
            Trigger::Failed { .. } => TriggerKind::Failed,
            Trigger::Retry => TriggerKind::Retry,
        }
    }
}

/// Payload-free name of a trigger, carried in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    UploadSucceeded,
    UploadFailed,
    DispatchAccepted,
    DispatchFailed,
    AnalysisStarted,
    AnalysisUpdate,
    ReportReady,
    Failed,
    Retry,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerKind::UploadSucceeded => "upload succeeded",
            TriggerKind::UploadFailed => "upload failed",
            TriggerKind::DispatchAccepted => "dispatch accepted",
            TriggerKind::DispatchFailed => "dispatch failed",
            TriggerKind::AnalysisStarted => "ANALYSIS_STARTED",
            TriggerKind::AnalysisUpdate => "ANALYSIS_UPDATE",
            TriggerKind::ReportReady => "REPORT_READY",
            TriggerKind::Failed => "ERROR",
            TriggerKind::Retry => "retry",
        };
        f.write_str(name)
    }
}

/// Result of a successful `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SubmissionStatus,
    pub to: SubmissionStatus,
    pub trigger: TriggerKind,
}

#[derive(Debug, Clone, Copy)]
pub struct SubmissionMachine {
    max_dispatch_attempts: u32,
}

impl Default for SubmissionMachine {
    fn default() -> Self {
        Self::new(3)
    }
}

impl SubmissionMachine {
    pub fn new(max_dispatch_attempts: u32) -> Self {
        Self {
            max_dispatch_attempts: max_dispatch_attempts.max(1),
        }
    }

    pub fn max_dispatch_attempts(&self) -> u32 {
        self.max_dispatch_attempts
    }

    /// Destination for `trigger` from the record's current state, without
    /// mutating anything.
    pub fn next_status(
        &self,
        record: &SubmissionRecord,
        trigger: &Trigger,
    ) -> SubmissionResult<SubmissionStatus> {
        use SubmissionStatus::*;

        let from = record.status;
        let to = match (trigger, from) {
            (Trigger::UploadSucceeded { .. }, Uploading) => Some(Uploaded),
            (Trigger::UploadFailed { .. }, Uploading) => Some(Error),

            (Trigger::DispatchAccepted, Submitted | Uploaded | Queued) => Some(Dispatched),

            (Trigger::DispatchFailed { retryable, .. }, Submitted | Uploaded | Dispatched | Queued) => {
                let attempts = record.dispatch_attempts.saturating_add(1);
                if *retryable && attempts < self.max_dispatch_attempts {
                    Some(Queued)
                } else {
                    Some(Error)
                }
            }

            (Trigger::AnalysisStarted { .. }, Dispatched | Queued) => Some(AnalysisStarted),
            (Trigger::AnalysisUpdate { .. }, AnalysisStarted | AnalysisUpdate) => {
                Some(AnalysisUpdate)
            }
            (
                Trigger::ReportReady { .. },
                AnalysisStarted | AnalysisUpdate | Dispatched | Queued,
            ) => Some(Completed),

            (Trigger::Failed { .. }, status) if !status.is_terminal() => Some(Error),

            (Trigger::Retry, Error) => Some(Queued),

            _ => None,
        };

        to.ok_or(SubmissionError::InvalidTransition {
            from,
            trigger: trigger.kind(),
        })
    }

    /// Validate and apply `trigger`. On error the record is left untouched.
    pub fn apply(
        &self,
        record: &mut SubmissionRecord,
        trigger: &Trigger,
    ) -> SubmissionResult<Transition> {
        let from = record.status;
        let to = self.next_status(record, trigger)?;

        match trigger {
            Trigger::UploadSucceeded { attachments } => {
                record.attachment_refs = attachments.clone();
            }
            Trigger::UploadFailed { reason } => {
                record.last_error = Some(reason.clone());
            }
            Trigger::DispatchAccepted => {}
            Trigger::DispatchFailed { reason, .. } => {
                record.dispatch_attempts = record.dispatch_attempts.saturating_add(1);
                record.last_error = Some(reason.clone());
            }
            Trigger::AnalysisStarted { .. } | Trigger::AnalysisUpdate { .. } => {}
            Trigger::ReportReady { report_id } => {
                record.report_ref = Some(*report_id);
            }
            Trigger::Failed { note } => {
                record.last_error = Some(note.clone());
            }
            Trigger::Retry => {
                record.dispatch_attempts = 0;
            }
        }

        record.status = to;
        record.updated_at = Utc::now();

        Ok(Transition {
            from,
            to,
            trigger: trigger.kind(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::OwnerId;
    use crate::domains::submissions::models::{Channel, NewSubmission};

    fn text_record() -> SubmissionRecord {
        SubmissionRecord::new(
            NewSubmission::builder()
                .owner_id(OwnerId::new())
                .channel(Channel::Email)
                .content("click here to claim your prize")
                .build(),
        )
        .unwrap()
    }

    fn file_record() -> SubmissionRecord {
        SubmissionRecord::new(
            NewSubmission::builder()
                .owner_id(OwnerId::new())
                .channel(Channel::Video)
                .build(),
        )
        .unwrap()
    }

    fn failure(retryable: bool) -> Trigger {
        Trigger::DispatchFailed {
            reason: "classifier did not answer within 15s".into(),
            retryable,
        }
    }

    fn attachment() -> AttachmentRef {
        AttachmentRef {
            bucket: "submissions".into(),
            key: "a/b.mp4".into(),
            mime: "video/mp4".into(),
            size: 1024,
        }
    }

    #[test]
    fn text_happy_path_reaches_completed() {
        let machine = SubmissionMachine::default();
        let mut record = text_record();
        let report_id = ReportId::new();

        machine.apply(&mut record, &Trigger::DispatchAccepted).unwrap();
        machine
            .apply(&mut record, &Trigger::AnalysisStarted { note: None })
            .unwrap();
        machine
            .apply(
                &mut record,
                &Trigger::AnalysisUpdate {
                    progress: Some(40.0),
                    note: None,
                },
            )
            .unwrap();
        machine
            .apply(
                &mut record,
                &Trigger::AnalysisUpdate {
                    progress: Some(80.0),
                    note: None,
                },
            )
            .unwrap();
        let transition = machine
            .apply(&mut record, &Trigger::ReportReady { report_id })
            .unwrap();

        assert_eq!(transition.from, SubmissionStatus::AnalysisUpdate);
        assert_eq!(record.status(), SubmissionStatus::Completed);
        assert_eq!(record.report_ref(), Some(report_id));
    }

    #[test]
    fn file_upload_then_dispatch() {
        let machine = SubmissionMachine::default();
        let mut record = file_record();

        machine
            .apply(
                &mut record,
                &Trigger::UploadSucceeded {
                    attachments: vec![attachment()],
                },
            )
            .unwrap();
        assert_eq!(record.status(), SubmissionStatus::Uploaded);
        assert_eq!(record.attachment_refs().len(), 1);

        machine.apply(&mut record, &Trigger::DispatchAccepted).unwrap();
        assert_eq!(record.status(), SubmissionStatus::Dispatched);
    }

    #[test]
    fn upload_failure_is_terminal() {
        let machine = SubmissionMachine::default();
        let mut record = file_record();

        machine
            .apply(
                &mut record,
                &Trigger::UploadFailed {
                    reason: "disk full".into(),
                },
            )
            .unwrap();

        assert_eq!(record.status(), SubmissionStatus::Error);
        assert_eq!(record.last_error(), Some("disk full"));
        assert!(record.report_ref().is_none());
    }

    #[test]
    fn text_record_cannot_receive_upload_triggers() {
        let machine = SubmissionMachine::default();
        let mut record = text_record();

        let err = machine
            .apply(
                &mut record,
                &Trigger::UploadSucceeded {
                    attachments: vec![attachment()],
                },
            )
            .unwrap_err();

        assert!(matches!(
            err,
            SubmissionError::InvalidTransition {
                from: SubmissionStatus::Submitted,
                trigger: TriggerKind::UploadSucceeded
            }
        ));
        assert!(record.attachment_refs().is_empty());
    }

    #[test]
    fn retryable_failure_queues_until_attempts_run_out() {
        let machine = SubmissionMachine::new(3);
        let mut record = text_record();

        machine.apply(&mut record, &failure(true)).unwrap();
        assert_eq!(record.status(), SubmissionStatus::Queued);
        assert_eq!(record.dispatch_attempts(), 1);

        machine.apply(&mut record, &Trigger::DispatchAccepted).unwrap();
        machine.apply(&mut record, &failure(true)).unwrap();
        assert_eq!(record.status(), SubmissionStatus::Queued);

        machine.apply(&mut record, &failure(true)).unwrap();
        assert_eq!(record.status(), SubmissionStatus::Error);
        assert_eq!(record.dispatch_attempts(), 3);
        assert!(record.last_error().is_some());
    }

    #[test]
    fn fatal_failure_goes_straight_to_error() {
        let machine = SubmissionMachine::new(5);
        let mut record = text_record();

        machine.apply(&mut record, &failure(false)).unwrap();

        assert_eq!(record.status(), SubmissionStatus::Error);
        assert!(!record.last_error().unwrap_or_default().is_empty());
    }

    #[test]
    fn report_after_error_requires_explicit_retry() {
        let machine = SubmissionMachine::default();
        let mut record = text_record();
        machine.apply(&mut record, &failure(false)).unwrap();

        let report = Trigger::ReportReady {
            report_id: ReportId::new(),
        };
        let err = machine.apply(&mut record, &report).unwrap_err();
        assert!(matches!(err, SubmissionError::InvalidTransition { .. }));
        assert_eq!(record.status(), SubmissionStatus::Error);

        machine.apply(&mut record, &Trigger::Retry).unwrap();
        assert_eq!(record.status(), SubmissionStatus::Queued);
        assert_eq!(record.dispatch_attempts(), 0);

        machine.apply(&mut record, &report).unwrap();
        assert_eq!(record.status(), SubmissionStatus::Completed);
    }

    #[test]
    fn stale_started_after_completion_is_rejected() {
        let machine = SubmissionMachine::default();
        let mut record = text_record();
        machine.apply(&mut record, &Trigger::DispatchAccepted).unwrap();
        machine
            .apply(
                &mut record,
                &Trigger::ReportReady {
                    report_id: ReportId::new(),
                },
            )
            .unwrap();
        let before = record.clone();

        let err = machine
            .apply(&mut record, &Trigger::AnalysisStarted { note: None })
            .unwrap_err();

        assert!(matches!(err, SubmissionError::InvalidTransition { .. }));
        assert_eq!(record, before);
    }

    #[test]
    fn webhook_error_applies_to_any_non_terminal_state() {
        let machine = SubmissionMachine::default();
        for setup in [
            vec![],
            vec![Trigger::DispatchAccepted],
            vec![
                Trigger::DispatchAccepted,
                Trigger::AnalysisStarted { note: None },
            ],
        ] {
            let mut record = text_record();
            for trigger in &setup {
                machine.apply(&mut record, trigger).unwrap();
            }
            machine
                .apply(
                    &mut record,
                    &Trigger::Failed {
                        note: "model crashed".into(),
                    },
                )
                .unwrap();
            assert_eq!(record.status(), SubmissionStatus::Error);
            assert_eq!(record.last_error(), Some("model crashed"));
        }
    }

    #[test]
    fn terminal_states_reject_webhook_error() {
        let machine = SubmissionMachine::default();
        let mut record = text_record();
        machine.apply(&mut record, &failure(false)).unwrap();

        assert!(machine
            .apply(
                &mut record,
                &Trigger::Failed {
                    note: "again".into()
                }
            )
            .is_err());
    }

    #[test]
    fn update_requires_started() {
        let machine = SubmissionMachine::default();
        let mut record = text_record();
        machine.apply(&mut record, &Trigger::DispatchAccepted).unwrap();

        let err = machine
            .apply(
                &mut record,
                &Trigger::AnalysisUpdate {
                    progress: Some(10.0),
                    note: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, SubmissionError::InvalidTransition { .. }));
    }

    #[test]
    fn report_ref_set_only_in_completed() {
        let machine = SubmissionMachine::default();
        let sequences = vec![
            vec![Trigger::DispatchAccepted],
            vec![failure(true)],
            vec![failure(false), Trigger::Retry],
            vec![
                Trigger::DispatchAccepted,
                Trigger::ReportReady {
                    report_id: ReportId::new(),
                },
            ],
        ];

        for sequence in sequences {
            let mut record = text_record();
            for trigger in &sequence {
                machine.apply(&mut record, trigger).unwrap();
            }
            assert_eq!(
                record.report_ref().is_some(),
                record.status() == SubmissionStatus::Completed
            );
        }
    }

    #[test]
    fn status_round_trips_through_its_wire_name() {
        for status in SubmissionStatus::ALL {
            assert_eq!(status.as_str().parse::<SubmissionStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.as_str())
            );
        }
    }
}
