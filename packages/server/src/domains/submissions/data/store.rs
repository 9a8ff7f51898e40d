use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::common::SubmissionId;
use crate::domains::submissions::machines::SubmissionStatus;
use crate::domains::submissions::models::{Report, SubmissionRecord};

/// Durable storage for submissions and their reports.
///
/// Implementations only persist; every status change is decided by the
/// state machine before `save` is called.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn insert(&self, record: &SubmissionRecord) -> Result<()>;

    async fn find(&self, id: SubmissionId) -> Result<Option<SubmissionRecord>>;

    /// Overwrite the mutable fields of an existing record.
    async fn save(&self, record: &SubmissionRecord) -> Result<()>;

    async fn find_report(&self, submission_id: SubmissionId) -> Result<Option<Report>>;

    /// Insert the report, or replace the content of the one already stored
    /// for the same submission. Returns the stored row, whose id is stable
    /// across upserts.
    async fn upsert_report(&self, report: &Report) -> Result<Report>;

    /// Records left in a state the dispatch queue should pick up.
    async fn find_awaiting_dispatch(&self) -> Result<Vec<SubmissionRecord>>;

    /// `DISPATCHED` records whose last transition happened before `cutoff`.
    async fn find_dispatched_before(&self, cutoff: DateTime<Utc>)
        -> Result<Vec<SubmissionRecord>>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Map-backed store for tests and local runs without Postgres.
#[derive(Default)]
pub struct InMemorySubmissionStore {
    records: RwLock<HashMap<SubmissionId, SubmissionRecord>>,
    reports: RwLock<HashMap<SubmissionId, Report>>,
}

impl InMemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn report_count(&self) -> usize {
        self.reports.read().await.len()
    }
}

#[async_trait]
impl SubmissionStore for InMemorySubmissionStore {
    async fn insert(&self, record: &SubmissionRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id()) {
            anyhow::bail!("submission {} already exists", record.id());
        }
        records.insert(record.id(), record.clone());
        Ok(())
    }

    async fn find(&self, id: SubmissionId) -> Result<Option<SubmissionRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn save(&self, record: &SubmissionRecord) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id()) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => anyhow::bail!("submission {} does not exist", record.id()),
        }
    }

    async fn find_report(&self, submission_id: SubmissionId) -> Result<Option<Report>> {
        Ok(self.reports.read().await.get(&submission_id).cloned())
    }

    async fn upsert_report(&self, report: &Report) -> Result<Report> {
        let mut reports = self.reports.write().await;
        let stored = match reports.get(&report.submission_id) {
            Some(existing) => Report {
                id: existing.id,
                created_at: existing.created_at,
                updated_at: Utc::now(),
                ..report.clone()
            },
            None => report.clone(),
        };
        reports.insert(report.submission_id, stored.clone());
        Ok(stored)
    }

    async fn find_awaiting_dispatch(&self) -> Result<Vec<SubmissionRecord>> {
        let mut pending: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.status().awaits_dispatch())
            .cloned()
            .collect();
        pending.sort_by_key(|record| record.created_at());
        Ok(pending)
    }

    async fn find_dispatched_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SubmissionRecord>> {
        let mut stale: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| {
                record.status() == SubmissionStatus::Dispatched && record.updated_at() < cutoff
            })
            .cloned()
            .collect();
        stale.sort_by_key(|record| record.created_at());
        Ok(stale)
    }
}
