//! Classifier dispatch for submissions.
//!
//! Submissions are handed to the classifier through an in-process queue so
//! the request that created them never waits on classification.
//!
//! # Architecture
//!
//! ```text
//! DispatchQueue ──► DispatchRunner ──► Dispatcher (one task per job)
//!                        │                 ├─► lifecycle: dispatch accepted   (record lock)
//!                        │                 ├─► classifier call with timeout   (no lock)
//!                        │                 └─► lifecycle: report / failure    (record lock)
//!                        └─► per-family semaphores (text, file/media)
//! ```
//!
//! A failed call with attempts left moves the record to `QUEUED` and puts
//! the job back on the queue after a linear backoff.
//!
//! On shutdown the runner stops taking jobs, interrupts the calls in flight
//! and waits for every job task to record its outcome. A record still
//! `DISPATCHED` when a process died is picked up by [`Dispatcher::recover`]
//! on the next start once its channel timeout has passed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use classifier::ClassifierError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::common::SubmissionId;
use crate::domains::submissions::actions::SubmissionLifecycle;
use crate::domains::submissions::errors::{SubmissionError, SubmissionResult};
use crate::domains::submissions::machines::{SubmissionStatus, Trigger};
use crate::domains::submissions::models::{Channel, ChannelFamily, SubmissionRecord};
use crate::kernel::{
    BaseClassifier, BaseObjectStorage, ClassificationOutcome, ClassificationRequest, MediaFile,
};

pub const WEBHOOK_PATH: &str = "/api/webhooks/analysis";

const INTERRUPTED_BY_SHUTDOWN: &str = "dispatch interrupted by shutdown";
const INTERRUPTED_BY_RESTART: &str = "dispatch interrupted by restart";

/// Configuration for classifier dispatch.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub text_timeout: Duration,
    pub file_timeout: Duration,
    /// Audio and video deepfake checks run far longer than anything else.
    pub media_timeout: Duration,
    /// Multiplied by the attempt number before a queued job is retried.
    pub retry_backoff: Duration,
    pub text_concurrency: usize,
    pub media_concurrency: usize,
    /// Externally reachable base URL of this server.
    pub public_base_url: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            text_timeout: Duration::from_secs(15),
            file_timeout: Duration::from_secs(60),
            media_timeout: Duration::from_secs(120),
            retry_backoff: Duration::from_secs(10),
            text_concurrency: 16,
            media_concurrency: 2,
            public_base_url: "http://localhost:8080".to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn timeout_for(&self, channel: Channel) -> Duration {
        match channel.family() {
            ChannelFamily::Text => self.text_timeout,
            ChannelFamily::File => self.file_timeout,
            ChannelFamily::Media => self.media_timeout,
        }
    }

    /// Webhook URL handed to the classifier with every job.
    pub fn callback_url(&self) -> String {
        Url::parse(&self.public_base_url)
            .and_then(|base| base.join(WEBHOOK_PATH))
            .map(|url| url.to_string())
            .unwrap_or_else(|_| {
                format!(
                    "{}{}",
                    self.public_base_url.trim_end_matches('/'),
                    WEBHOOK_PATH
                )
            })
    }
}

/// One queued request to classify a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchJob {
    pub submission_id: SubmissionId,
    pub channel: Channel,
    /// Dispatch attempts already made for this record.
    pub attempt: u32,
}

impl DispatchJob {
    pub fn for_record(record: &SubmissionRecord) -> Self {
        Self {
            submission_id: record.id(),
            channel: record.channel(),
            attempt: record.dispatch_attempts(),
        }
    }
}

/// Sending half of the dispatch queue. Cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<DispatchJob>,
}

/// Receiving half, consumed by `DispatchRunner`.
pub type DispatchReceiver = mpsc::UnboundedReceiver<DispatchJob>;

impl DispatchQueue {
    pub fn channel() -> (Self, DispatchReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, job: DispatchJob) {
        debug!(submission_id = %job.submission_id, attempt = job.attempt, "dispatch enqueued");
        if self.tx.send(job).is_err() {
            warn!(
                submission_id = %job.submission_id,
                "dispatch queue closed; job will be recovered on next start"
            );
        }
    }

    /// Enqueue from a detached task that first yields, so the calling
    /// handler finishes writing its response before the runner can see the
    /// job.
    pub fn enqueue_detached(&self, job: DispatchJob) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            queue.enqueue(job);
        });
    }

    pub fn enqueue_after(&self, job: DispatchJob, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(job);
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The classifier answered inline and the record is complete.
    Completed,
    /// The classifier accepted the job; the webhook will finish it.
    AwaitingCallback,
    /// The call failed and the job went back on the queue.
    Requeued { attempt: u32, delay: Duration },
    /// The call failed and the record is now in `ERROR`.
    Failed,
    /// The record was not in a state this job applies to.
    Skipped,
}

pub struct Dispatcher {
    lifecycle: SubmissionLifecycle,
    classifier: Arc<dyn BaseClassifier>,
    storage: Arc<dyn BaseObjectStorage>,
    queue: DispatchQueue,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        lifecycle: SubmissionLifecycle,
        classifier: Arc<dyn BaseClassifier>,
        storage: Arc<dyn BaseObjectStorage>,
        queue: DispatchQueue,
        config: DispatchConfig,
    ) -> Self {
        Self {
            lifecycle,
            classifier,
            storage,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    async fn request_for(&self, record: &SubmissionRecord) -> Result<ClassificationRequest> {
        let attachments = record.attachment_refs();
        let file_names: Vec<String> = attachments
            .iter()
            .map(|a| a.key.rsplit('/').next().unwrap_or(&a.key).to_string())
            .collect();

        let media = match (record.channel().family(), attachments.first()) {
            (ChannelFamily::Media, Some(attachment)) => Some(MediaFile {
                filename: file_names[0].clone(),
                mime: attachment.mime.clone(),
                bytes: self.storage.read(attachment).await?,
            }),
            _ => None,
        };

        Ok(ClassificationRequest {
            submission_id: record.id(),
            channel: record.channel(),
            content: record.content().map(str::to_string),
            file_urls: attachments
                .iter()
                .map(|a| self.storage.file_url(a))
                .collect(),
            file_names,
            media,
            callback_url: self.config.callback_url(),
        })
    }

    /// Run one job to the point where the record either has a result, is
    /// waiting on the webhook, or has failed.
    pub async fn dispatch(&self, job: DispatchJob) -> SubmissionResult<DispatchOutcome> {
        let id = job.submission_id;

        let record = match self.lifecycle.apply(id, Trigger::DispatchAccepted).await {
            Ok(applied) => applied.into_record(),
            Err(SubmissionError::InvalidTransition { from, .. }) => {
                debug!(submission_id = %id, status = %from, "dispatch skipped");
                return Ok(DispatchOutcome::Skipped);
            }
            Err(SubmissionError::NotFound(_)) => {
                warn!(submission_id = %id, "dispatch for unknown submission dropped");
                return Ok(DispatchOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let request = match self.request_for(&record).await {
            Ok(request) => request,
            Err(e) => {
                return self
                    .fail(job, format!("could not load upload: {e:#}"), true)
                    .await
            }
        };
        let timeout = self.config.timeout_for(record.channel());

        info!(
            submission_id = %id,
            channel = %record.channel(),
            attempt = record.dispatch_attempts() + 1,
            timeout_secs = timeout.as_secs(),
            "dispatching to classifier"
        );

        let result = match tokio::time::timeout(timeout, self.classifier.classify(&request, timeout))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ClassifierError::Timeout(timeout)),
        };

        match result {
            Ok(ClassificationOutcome::Verdict { verdict, raw }) => {
                match self.lifecycle.complete(id, verdict, raw).await {
                    Ok(_) => Ok(DispatchOutcome::Completed),
                    Err(SubmissionError::InvalidTransition { from, .. }) => {
                        debug!(submission_id = %id, status = %from, "inline verdict arrived after record moved on");
                        Ok(DispatchOutcome::Skipped)
                    }
                    Err(e) => Err(e),
                }
            }
            Ok(ClassificationOutcome::Pending { .. }) => {
                debug!(submission_id = %id, "classifier will report through webhook");
                Ok(DispatchOutcome::AwaitingCallback)
            }
            Err(e) => {
                let retryable = e.is_retryable();
                self.fail(job, e.to_string(), retryable).await
            }
        }
    }

    /// Record that shutdown cut a job short. Only a record this job moved to
    /// `DISPATCHED` is touched; one still waiting for a permit stays where
    /// it is for the next start to pick up.
    pub async fn interrupt(&self, job: DispatchJob) -> SubmissionResult<DispatchOutcome> {
        let id = job.submission_id;
        let trigger = Trigger::DispatchFailed {
            reason: INTERRUPTED_BY_SHUTDOWN.to_string(),
            retryable: true,
        };
        let applied = self
            .lifecycle
            .apply_if(
                id,
                |record| {
                    record.status() == SubmissionStatus::Dispatched
                        && record.dispatch_attempts() == job.attempt
                },
                trigger,
            )
            .await?;

        match applied {
            Some(applied) if applied.record().status() == SubmissionStatus::Queued => {
                info!(submission_id = %id, "in-flight dispatch interrupted; left queued");
                Ok(DispatchOutcome::Requeued {
                    attempt: applied.record().dispatch_attempts(),
                    delay: Duration::ZERO,
                })
            }
            Some(_) => Ok(DispatchOutcome::Failed),
            None => Ok(DispatchOutcome::Skipped),
        }
    }

    /// Re-enqueue records a previous process left behind.
    ///
    /// Records waiting for dispatch go straight back on the queue. A record
    /// still `DISPATCHED` after its channel timeout lost its classifier call
    /// with the process; it is failed as retryable and queued again, or
    /// moved to `ERROR` when it has no attempts left.
    pub async fn recover(&self) -> Result<usize> {
        let store = self.lifecycle.store();

        let pending = store.find_awaiting_dispatch().await?;
        for record in &pending {
            self.queue.enqueue(DispatchJob::for_record(record));
        }

        let shortest = self
            .config
            .text_timeout
            .min(self.config.file_timeout)
            .min(self.config.media_timeout);
        let cutoff = Utc::now() - chrono::Duration::from_std(shortest)?;
        let mut requeued = 0;
        for record in store.find_dispatched_before(cutoff).await? {
            let timeout = self.config.timeout_for(record.channel());
            let trigger = Trigger::DispatchFailed {
                reason: INTERRUPTED_BY_RESTART.to_string(),
                retryable: true,
            };
            let applied = self
                .lifecycle
                .apply_if(record.id(), |r| is_stale(r, timeout), trigger)
                .await?;

            match applied {
                Some(applied) if applied.record().status() == SubmissionStatus::Queued => {
                    self.queue.enqueue(DispatchJob::for_record(applied.record()));
                    requeued += 1;
                }
                Some(_) => {
                    warn!(submission_id = %record.id(), "stale dispatch out of attempts");
                }
                None => {}
            }
        }

        let total = pending.len() + requeued;
        if total > 0 {
            info!(
                awaiting = pending.len(),
                stale_dispatched = requeued,
                "recovered submissions for dispatch"
            );
        }
        Ok(total)
    }

    async fn fail(
        &self,
        job: DispatchJob,
        reason: String,
        retryable: bool,
    ) -> SubmissionResult<DispatchOutcome> {
        let id = job.submission_id;
        warn!(submission_id = %id, error = %reason, retryable, "classifier dispatch failed");

        let trigger = Trigger::DispatchFailed { reason, retryable };
        let record = match self.lifecycle.apply(id, trigger).await {
            Ok(applied) => applied.into_record(),
            Err(SubmissionError::InvalidTransition { from, .. }) => {
                debug!(submission_id = %id, status = %from, "failure arrived after record moved on");
                return Ok(DispatchOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        if record.status() == SubmissionStatus::Queued {
            let attempt = record.dispatch_attempts();
            let delay = self.config.retry_backoff * attempt;
            self.queue.enqueue_after(DispatchJob::for_record(&record), delay);
            info!(submission_id = %id, attempt, delay_secs = delay.as_secs(), "dispatch requeued");
            Ok(DispatchOutcome::Requeued { attempt, delay })
        } else {
            Ok(DispatchOutcome::Failed)
        }
    }
}

fn is_stale(record: &SubmissionRecord, timeout: Duration) -> bool {
    record.status() == SubmissionStatus::Dispatched
        && (Utc::now() - record.updated_at())
            .to_std()
            .is_ok_and(|elapsed| elapsed >= timeout)
}

/// Background consumer of the dispatch queue.
pub struct DispatchRunner {
    dispatcher: Arc<Dispatcher>,
    rx: DispatchReceiver,
    text_permits: Arc<Semaphore>,
    heavy_permits: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl DispatchRunner {
    pub fn new(dispatcher: Arc<Dispatcher>, rx: DispatchReceiver) -> Self {
        let config = dispatcher.config();
        let text_permits = Arc::new(Semaphore::new(config.text_concurrency.max(1)));
        let heavy_permits = Arc::new(Semaphore::new(config.media_concurrency.max(1)));
        Self {
            dispatcher,
            rx,
            text_permits,
            heavy_permits,
            tasks: TaskTracker::new(),
        }
    }

    /// Run until `shutdown` fires or every queue handle is dropped, then
    /// wait for the job tasks already started.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            text_concurrency = self.text_permits.available_permits(),
            media_concurrency = self.heavy_permits.available_permits(),
            "dispatch runner starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("dispatch runner stopping");
                    break;
                }
                job = self.rx.recv() => match job {
                    Some(job) => self.spawn(job, &shutdown),
                    None => {
                        info!("dispatch queue closed");
                        break;
                    }
                },
            }
        }

        self.tasks.close();
        if !self.tasks.is_empty() {
            info!(in_flight = self.tasks.len(), "draining dispatch jobs");
        }
        self.tasks.wait().await;
        info!("dispatch runner stopped");
    }

    fn spawn(&self, job: DispatchJob, shutdown: &CancellationToken) {
        let permits = match job.channel.family() {
            ChannelFamily::Text => self.text_permits.clone(),
            ChannelFamily::File | ChannelFamily::Media => self.heavy_permits.clone(),
        };
        let dispatcher = self.dispatcher.clone();
        let shutdown = shutdown.clone();

        self.tasks.spawn(async move {
            let run = {
                let dispatcher = dispatcher.clone();
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return Ok(DispatchOutcome::Skipped);
                    };
                    dispatcher.dispatch(job).await
                }
            };

            let result = tokio::select! {
                result = run => result,
                _ = shutdown.cancelled() => dispatcher.interrupt(job).await,
            };

            match result {
                Ok(outcome) => {
                    debug!(submission_id = %job.submission_id, ?outcome, "dispatch finished")
                }
                Err(e) => {
                    error!(submission_id = %job.submission_id, error = %e, "dispatch errored")
                }
            }
        });
    }
}
