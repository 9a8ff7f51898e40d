//! Fraud submissions: intake, lifecycle, dispatch and classifier callbacks.

pub mod actions;
pub mod activities;
pub mod data;
pub mod errors;
pub mod events;
pub mod machines;
pub mod models;

pub use errors::{SubmissionError, SubmissionResult};
pub use machines::{SubmissionMachine, SubmissionStatus, Trigger};
pub use models::{Channel, Report, SubmissionRecord, Verdict};
