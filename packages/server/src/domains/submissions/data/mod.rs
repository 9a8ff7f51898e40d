pub mod postgres;
pub mod store;

pub use postgres::PostgresSubmissionStore;
pub use store::{InMemorySubmissionStore, SubmissionStore};
