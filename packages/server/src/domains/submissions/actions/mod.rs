pub mod lifecycle;
pub mod submit;

pub use lifecycle::{Applied, SubmissionLifecycle};
pub use submit::{queue_uploaded, retry_submission, submit_files, submit_text, UploadedFile};
