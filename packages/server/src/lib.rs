// Fraud submission core
//
// Accepts suspicious content, hands it to the external analysis service,
// ingests the service's callbacks and fans lifecycle events out to the
// submitting owner's live connections.
//
// Domain logic lives in domains/submissions; shared infrastructure
// (event bus, storage, signatures) in kernel/.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
