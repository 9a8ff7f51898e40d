// TestDependencies - mock implementations for testing
//
// Provides mock services that can be injected into ServerDeps for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use classifier::ClassifierError;
use serde_json::json;

use super::{
    BaseClassifier, BaseObjectStorage, ClassificationOutcome, ClassificationRequest, EventBus,
    EventBusConfig, ServerDeps,
};
use crate::common::OwnerId;
use crate::domains::submissions::data::{InMemorySubmissionStore, SubmissionStore};
use crate::domains::submissions::models::{AttachmentRef, Verdict};
use crate::kernel::storage::{resolve_mime, sanitize_filename};

// =============================================================================
// Mock Classifier
// =============================================================================

/// One scripted classifier answer.
#[derive(Debug, Clone)]
pub enum MockReply {
    Verdict(Verdict),
    Pending,
    /// Fail with a 5xx (retryable) or 4xx (fatal) status.
    Fail { retryable: bool, message: String },
    /// Never answer; the caller's timeout decides.
    Hang,
}

/// Captured call to the classifier
#[derive(Debug, Clone)]
pub struct ClassifyCall {
    pub request: ClassificationRequest,
    pub timeout: Duration,
}

/// Classifier that replays scripted answers in order, then answers
/// `Pending` once the script runs out.
#[derive(Clone, Default)]
pub struct MockClassifier {
    script: Arc<Mutex<VecDeque<MockReply>>>,
    calls: Arc<Mutex<Vec<ClassifyCall>>>,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, reply: MockReply) -> Self {
        self.push(reply);
        self
    }

    pub fn with_verdict(self, suspicious: bool, risk_score: f64, reasons: &[&str]) -> Self {
        let verdict = Verdict::new(
            suspicious,
            risk_score,
            reasons.iter().map(|r| r.to_string()).collect(),
            None,
        )
        .expect("scripted verdict must be valid");
        self.with_reply(MockReply::Verdict(verdict))
    }

    pub fn push(&self, reply: MockReply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> Vec<ClassifyCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl BaseClassifier for MockClassifier {
    async fn classify(
        &self,
        request: &ClassificationRequest,
        timeout: Duration,
    ) -> std::result::Result<ClassificationOutcome, ClassifierError> {
        self.calls.lock().unwrap().push(ClassifyCall {
            request: request.clone(),
            timeout,
        });
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockReply::Pending);

        match reply {
            MockReply::Verdict(verdict) => Ok(ClassificationOutcome::Verdict {
                raw: serde_json::to_value(&verdict).unwrap_or_default(),
                verdict,
            }),
            MockReply::Pending => Ok(ClassificationOutcome::Pending {
                raw: json!({"status": "accepted"}),
            }),
            MockReply::Fail { retryable, message } => Err(ClassifierError::Status {
                status: if retryable { 503 } else { 422 },
                body: message,
            }),
            MockReply::Hang => std::future::pending().await,
        }
    }
}

// =============================================================================
// Mock Object Storage
// =============================================================================

/// Keeps uploaded objects in memory.
#[derive(Clone, Default)]
pub struct MemoryObjectStorage {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    fail_writes: bool,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose writes always fail.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl BaseObjectStorage for MemoryObjectStorage {
    async fn put(
        &self,
        owner: OwnerId,
        filename: &str,
        mime: Option<&str>,
        bytes: Bytes,
    ) -> Result<AttachmentRef> {
        if self.fail_writes {
            anyhow::bail!("object storage unavailable");
        }
        let key = format!("{}/{}", owner, sanitize_filename(filename));
        let size = bytes.len() as u64;
        self.objects.lock().unwrap().insert(key.clone(), bytes);

        Ok(AttachmentRef {
            bucket: "test".to_string(),
            key,
            mime: resolve_mime(filename, mime),
            size,
        })
    }

    async fn read(&self, attachment: &AttachmentRef) -> Result<Bytes> {
        self.object(&attachment.key)
            .ok_or_else(|| anyhow::anyhow!("no object stored under {}", attachment.key))
    }

    fn file_url(&self, attachment: &AttachmentRef) -> String {
        format!("memory://{}/{}", attachment.bucket, attachment.key)
    }
}

// =============================================================================
// TestDependencies builder
// =============================================================================

pub struct TestDependencies {
    pub store: Arc<InMemorySubmissionStore>,
    pub classifier: MockClassifier,
    pub storage: MemoryObjectStorage,
    pub bus_config: EventBusConfig,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemorySubmissionStore::new()),
            classifier: MockClassifier::new(),
            storage: MemoryObjectStorage::new(),
            bus_config: EventBusConfig::default(),
        }
    }

    pub fn mock_classifier(mut self, classifier: MockClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn mock_storage(mut self, storage: MemoryObjectStorage) -> Self {
        self.storage = storage;
        self
    }

    pub fn bus_config(mut self, config: EventBusConfig) -> Self {
        self.bus_config = config;
        self
    }

    pub fn into_deps(self) -> ServerDeps {
        let store: Arc<dyn SubmissionStore> = self.store;
        ServerDeps::new(
            store,
            Arc::new(self.classifier),
            Arc::new(self.storage),
            EventBus::new(self.bus_config),
        )
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
