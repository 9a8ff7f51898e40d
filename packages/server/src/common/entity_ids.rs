//! Typed ids for the entities the core handles.

pub use super::id::Id;

/// Marker for submission records (one analysis job each).
pub struct Submission;

/// Marker for classifier reports.
pub struct AnalysisReport;

/// Marker for submitting principals. Owners are managed by the auth
/// collaborator; the core only ever sees their ids.
pub struct Owner;

pub type SubmissionId = Id<Submission>;
pub type ReportId = Id<AnalysisReport>;
pub type OwnerId = Id<Owner>;
