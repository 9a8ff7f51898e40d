//! Per-record serialization point for submission transitions.
//!
//! Every status change (dispatch outcome, webhook, retry, upload) takes the
//! record's lock, reloads the record, runs the state machine, saves, and
//! publishes the resulting live event before releasing the lock. Nothing in
//! the critical section waits on the network; event publication only does
//! non-blocking channel sends.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::common::{OwnerId, SubmissionId};
use crate::domains::submissions::data::SubmissionStore;
use crate::domains::submissions::errors::{SubmissionError, SubmissionResult};
use crate::domains::submissions::events::SubmissionEvent;
use crate::domains::submissions::machines::{
    SubmissionMachine, SubmissionStatus, Transition, Trigger, TriggerKind,
};
use crate::domains::submissions::models::{NewSubmission, Report, SubmissionRecord, Verdict};
use crate::kernel::EventBus;

/// Result of feeding a trigger to a record.
#[derive(Debug, Clone)]
pub enum Applied {
    Changed {
        record: SubmissionRecord,
        transition: Transition,
    },
    /// Repeat delivery of something already applied.
    Unchanged { record: SubmissionRecord },
}

impl Applied {
    pub fn record(&self) -> &SubmissionRecord {
        match self {
            Applied::Changed { record, .. } | Applied::Unchanged { record } => record,
        }
    }

    pub fn into_record(self) -> SubmissionRecord {
        match self {
            Applied::Changed { record, .. } | Applied::Unchanged { record } => record,
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, Applied::Changed { .. })
    }
}

type LockMap = DashMap<SubmissionId, Arc<Mutex<()>>>;

/// Holds one record's lock; the map entry is dropped with the last holder.
struct RecordGuard {
    id: SubmissionId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Clone)]
pub struct SubmissionLifecycle {
    store: Arc<dyn SubmissionStore>,
    bus: EventBus,
    machine: SubmissionMachine,
    locks: Arc<LockMap>,
}

impl SubmissionLifecycle {
    pub fn new(store: Arc<dyn SubmissionStore>, bus: EventBus, machine: SubmissionMachine) -> Self {
        Self {
            store,
            bus,
            machine,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.store
    }

    pub fn machine(&self) -> &SubmissionMachine {
        &self.machine
    }

    async fn lock(&self, id: SubmissionId) -> RecordGuard {
        let lock = self.locks.entry(id).or_default().clone();
        RecordGuard {
            id,
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    /// Number of records with a transition in flight or waiting.
    pub fn locked_records(&self) -> usize {
        self.locks.len()
    }

    fn publish(&self, owner: OwnerId, event: &SubmissionEvent) {
        self.bus
            .publish(owner, event.event_type(), &event.to_payload());
    }

    /// Persist a new record in its initial state and announce it.
    pub async fn create(&self, input: NewSubmission) -> SubmissionResult<SubmissionRecord> {
        let record = SubmissionRecord::new(input)?;
        self.store.insert(&record).await?;

        info!(
            submission_id = %record.id(),
            owner_id = %record.owner_id(),
            channel = %record.channel(),
            status = %record.status(),
            "submission created"
        );
        self.publish(record.owner_id(), &SubmissionEvent::created(&record));
        Ok(record)
    }

    pub async fn get(&self, id: SubmissionId) -> SubmissionResult<SubmissionRecord> {
        self.store
            .find(id)
            .await?
            .ok_or_else(|| SubmissionError::NotFound(id.to_string()))
    }

    /// Same as `get`, but a record owned by someone else is reported as
    /// missing.
    pub async fn get_for_owner(
        &self,
        id: SubmissionId,
        owner: OwnerId,
    ) -> SubmissionResult<SubmissionRecord> {
        match self.get(id).await {
            Ok(record) if record.is_owned_by(owner) => Ok(record),
            Ok(_) | Err(SubmissionError::NotFound(_)) => {
                Err(SubmissionError::NotFound(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn find_report(&self, id: SubmissionId) -> SubmissionResult<Option<Report>> {
        Ok(self.store.find_report(id).await?)
    }

    /// Apply a trigger that carries no report.
    pub async fn apply(&self, id: SubmissionId, trigger: Trigger) -> SubmissionResult<Applied> {
        let _guard = self.lock(id).await;
        let record = self.get(id).await?;
        self.transition(record, &trigger).await
    }

    /// Apply `trigger` only if `when` holds for the record as read under its
    /// lock. Returns `None` when the record did not qualify.
    pub async fn apply_if(
        &self,
        id: SubmissionId,
        when: impl FnOnce(&SubmissionRecord) -> bool,
        trigger: Trigger,
    ) -> SubmissionResult<Option<Applied>> {
        let _guard = self.lock(id).await;
        let record = self.get(id).await?;
        if !when(&record) {
            return Ok(None);
        }
        self.transition(record, &trigger).await.map(Some)
    }

    async fn transition(
        &self,
        mut record: SubmissionRecord,
        trigger: &Trigger,
    ) -> SubmissionResult<Applied> {
        let id = record.id();
        let transition = match self.machine.apply(&mut record, trigger) {
            Ok(transition) => transition,
            Err(e) => {
                warn!(
                    submission_id = %id,
                    status = %record.status(),
                    trigger = %trigger.kind(),
                    "rejected submission transition"
                );
                return Err(e);
            }
        };
        self.store.save(&record).await?;

        info!(
            submission_id = %id,
            from = %transition.from,
            to = %transition.to,
            trigger = %transition.trigger,
            "submission transitioned"
        );
        if let Some(event) = SubmissionEvent::after(&record, trigger, None) {
            self.publish(record.owner_id(), &event);
        }

        Ok(Applied::Changed { record, transition })
    }

    /// Attach a verdict and complete the record.
    ///
    /// A repeat of the verdict already stored on a completed record is a
    /// no-op. A different verdict for a completed record is rejected.
    pub async fn complete(
        &self,
        id: SubmissionId,
        verdict: Verdict,
        raw: Value,
    ) -> SubmissionResult<Applied> {
        let _guard = self.lock(id).await;
        let mut record = self.get(id).await?;

        if record.status() == SubmissionStatus::Completed {
            let stored = self.store.find_report(id).await?;
            if stored.is_some_and(|report| report.verdict == verdict) {
                debug!(submission_id = %id, "duplicate report ignored");
                return Ok(Applied::Unchanged { record });
            }
            warn!(submission_id = %id, "conflicting report for completed submission");
            return Err(SubmissionError::InvalidTransition {
                from: record.status(),
                trigger: TriggerKind::ReportReady,
            });
        }

        let report_ready = Trigger::ReportReady {
            report_id: Default::default(),
        };
        if let Err(e) = self.machine.next_status(&record, &report_ready) {
            warn!(
                submission_id = %id,
                status = %record.status(),
                trigger = %TriggerKind::ReportReady,
                "rejected submission transition"
            );
            return Err(e);
        }

        let report = self
            .store
            .upsert_report(&Report::new(id, verdict, raw))
            .await?;
        let trigger = Trigger::ReportReady {
            report_id: report.id,
        };
        let transition = self.machine.apply(&mut record, &trigger)?;
        self.store.save(&record).await?;

        info!(
            submission_id = %id,
            from = %transition.from,
            suspicious = report.verdict.suspicious,
            risk_score = report.verdict.risk_score,
            "submission completed"
        );
        if let Some(event) = SubmissionEvent::after(&record, &trigger, Some(&report)) {
            self.publish(record.owner_id(), &event);
        }

        Ok(Applied::Changed { record, transition })
    }
}
