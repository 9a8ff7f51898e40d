use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::common::{OwnerId, ReportId, SubmissionId};
use crate::domains::submissions::errors::{SubmissionError, SubmissionResult};
use crate::domains::submissions::machines::SubmissionStatus;

/// Where the suspicious content came from. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
    Chat,
    Image,
    Video,
    Document,
    Audio,
}

/// Classifier workload class; decides timeout and concurrency budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFamily {
    Text,
    File,
    Media,
}

impl Channel {
    pub const ALL: [Channel; 7] = [
        Channel::Sms,
        Channel::Email,
        Channel::Chat,
        Channel::Image,
        Channel::Video,
        Channel::Document,
        Channel::Audio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::Chat => "chat",
            Channel::Image => "image",
            Channel::Video => "video",
            Channel::Document => "document",
            Channel::Audio => "audio",
        }
    }

    pub fn family(&self) -> ChannelFamily {
        match self {
            Channel::Sms | Channel::Email | Channel::Chat => ChannelFamily::Text,
            Channel::Image | Channel::Document => ChannelFamily::File,
            Channel::Audio | Channel::Video => ChannelFamily::Media,
        }
    }

    pub fn is_text(&self) -> bool {
        self.family() == ChannelFamily::Text
    }

    /// Text starts ready for dispatch; files start waiting on their upload.
    pub fn initial_status(&self) -> SubmissionStatus {
        if self.is_text() {
            SubmissionStatus::Submitted
        } else {
            SubmissionStatus::Uploading
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = SubmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| SubmissionError::validation(format!("unknown channel '{}'", s)))
    }
}

/// Pointer to an uploaded object in the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub bucket: String,
    pub key: String,
    pub mime: String,
    pub size: u64,
}

/// Input for creating a submission.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NewSubmission {
    pub owner_id: OwnerId,
    pub channel: Channel,
    #[builder(default, setter(strip_option, into))]
    pub content: Option<String>,
}

/// One analysis job and its current lifecycle state.
///
/// Fields are only writable inside the submissions domain; `status`,
/// `last_error`, `attachment_refs`, `report_ref` and `dispatch_attempts`
/// change exclusively through `SubmissionMachine::apply`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    pub(in crate::domains::submissions) id: SubmissionId,
    pub(in crate::domains::submissions) owner_id: OwnerId,
    pub(in crate::domains::submissions) channel: Channel,
    pub(in crate::domains::submissions) status: SubmissionStatus,
    #[serde(skip_serializing)]
    pub(in crate::domains::submissions) content: Option<String>,
    pub(in crate::domains::submissions) last_error: Option<String>,
    pub(in crate::domains::submissions) attachment_refs: Vec<AttachmentRef>,
    pub(in crate::domains::submissions) report_ref: Option<ReportId>,
    pub(in crate::domains::submissions) dispatch_attempts: u32,
    pub(in crate::domains::submissions) created_at: DateTime<Utc>,
    pub(in crate::domains::submissions) updated_at: DateTime<Utc>,
}

impl SubmissionRecord {
    pub fn new(input: NewSubmission) -> SubmissionResult<Self> {
        let content = input
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        if input.channel.is_text() && content.is_none() {
            return Err(SubmissionError::validation(format!(
                "content is required for {} submissions",
                input.channel
            )));
        }
        if !input.channel.is_text() && content.is_some() {
            return Err(SubmissionError::validation(format!(
                "{} submissions carry files, not inline content",
                input.channel
            )));
        }

        let now = Utc::now();
        Ok(Self {
            id: SubmissionId::new(),
            owner_id: input.owner_id,
            channel: input.channel,
            status: input.channel.initial_status(),
            content,
            last_error: None,
            attachment_refs: Vec::new(),
            report_ref: None,
            dispatch_attempts: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> SubmissionId {
        self.id
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn status(&self) -> SubmissionStatus {
        self.status
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn attachment_refs(&self) -> &[AttachmentRef] {
        &self.attachment_refs
    }

    pub fn report_ref(&self) -> Option<ReportId> {
        self.report_ref
    }

    pub fn dispatch_attempts(&self) -> u32 {
        self.dispatch_attempts
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_owned_by(&self, owner: OwnerId) -> bool {
        self.owner_id == owner
    }
}
