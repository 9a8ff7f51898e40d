pub mod report;
pub mod submission;

pub use report::*;
pub use submission::*;
