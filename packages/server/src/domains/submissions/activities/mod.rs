pub mod dispatch;
pub mod webhook;

pub use dispatch::{
    DispatchConfig, DispatchJob, DispatchOutcome, DispatchQueue, DispatchRunner, Dispatcher,
};
pub use webhook::{WebhookIngester, WebhookPayload, WebhookStatus};
