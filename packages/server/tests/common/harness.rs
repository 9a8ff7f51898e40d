//! Test harness for driving the router in-process.
//!
//! Every test gets its own in-memory store, scripted classifier and recording
//! object storage, wired exactly like production through `AppState::new`.
//! The dispatch runner is held back until `start_dispatch` so tests can
//! observe records before classification starts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use test_context::AsyncTestContext;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use fraudwatch_core::common::{OwnerId, SubmissionId};
use fraudwatch_core::domains::submissions::activities::{DispatchConfig, DispatchRunner};
use fraudwatch_core::domains::submissions::data::{InMemorySubmissionStore, SubmissionStore};
use fraudwatch_core::domains::submissions::{Report, SubmissionRecord, SubmissionStatus};
use fraudwatch_core::kernel::signature::{sign, SIGNATURE_HEADER};
use fraudwatch_core::kernel::test_dependencies::{MemoryObjectStorage, MockClassifier};
use fraudwatch_core::kernel::TestDependencies;
use fraudwatch_core::server::middleware::OWNER_HEADER;
use fraudwatch_core::server::{build_app, AppSettings, AppState};

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";
pub const UPLOAD_MAX_BYTES: usize = 64 * 1024;

/// Test harness that manages test infrastructure.
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let (status, body) = ctx.create_text("email", "hello").await;
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    pub app: Router,
    pub state: AppState,
    pub store: Arc<InMemorySubmissionStore>,
    pub classifier: MockClassifier,
    pub storage: MemoryObjectStorage,
    /// Owner used by the request helpers.
    pub owner: OwnerId,
    runner: Mutex<Option<DispatchRunner>>,
    runner_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new(TestDependencies::new())
    }

    async fn teardown(self) {
        self.shutdown.cancel();
    }
}

impl TestHarness {
    pub fn new(deps: TestDependencies) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let store = deps.store.clone();
        let classifier = deps.classifier.clone();
        let storage = deps.storage.clone();

        let settings = AppSettings {
            webhook_secret: WEBHOOK_SECRET.to_string(),
            dispatch: DispatchConfig {
                retry_backoff: Duration::from_millis(20),
                text_timeout: Duration::from_secs(2),
                file_timeout: Duration::from_secs(2),
                media_timeout: Duration::from_secs(2),
                ..DispatchConfig::default()
            },
            max_dispatch_attempts: 3,
            upload_max_bytes: UPLOAD_MAX_BYTES,
        };
        let (state, runner) = AppState::new(deps.into_deps(), settings);
        let app = build_app(state.clone(), &[], None);

        Self {
            app,
            state,
            store,
            classifier,
            storage,
            owner: OwnerId::new(),
            runner: Mutex::new(Some(runner)),
            runner_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start consuming the dispatch queue. Jobs enqueued earlier are picked
    /// up immediately.
    pub fn start_dispatch(&self) {
        if let Some(runner) = self.runner.lock().unwrap().take() {
            let task = tokio::spawn(runner.run(self.shutdown.clone()));
            *self.runner_task.lock().unwrap() = Some(task);
        }
    }

    /// Shut the runner down the way the server does and wait until every
    /// job it started has recorded its outcome.
    pub async fn stop_dispatch(&self) {
        self.shutdown.cancel();
        let task = self.runner_task.lock().unwrap().take();
        if let Some(task) = task {
            task.await.unwrap();
        }
    }

    /// A second process over the same store, as after a restart.
    pub fn restarted(&self, classifier: MockClassifier) -> TestHarness {
        let deps = TestDependencies {
            store: self.store.clone(),
            storage: self.storage.clone(),
            ..TestDependencies::new()
        }
        .mock_classifier(classifier);
        TestHarness::new(deps)
    }

    /// Send a request through the router and decode the JSON body (Null when
    /// the body is empty).
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    pub async fn create_text(&self, channel: &str, content: &str) -> (StatusCode, Value) {
        self.create_text_as(self.owner, channel, content).await
    }

    pub async fn create_text_as(
        &self,
        owner: OwnerId,
        channel: &str,
        content: &str,
    ) -> (StatusCode, Value) {
        let body = serde_json::json!({ "channel": channel, "content": content });
        let request = Request::post("/api/submissions")
            .header(OWNER_HEADER, owner.to_string())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// Create a text submission and return its id, asserting it was accepted.
    pub async fn submit_email(&self, content: &str) -> SubmissionId {
        let (status, body) = self.create_text("email", content).await;
        assert_eq!(status, StatusCode::CREATED, "unexpected body {}", body);
        submission_id(&body)
    }

    pub async fn upload(&self, channel: &str, files: &[(&str, &str, &[u8])]) -> (StatusCode, Value) {
        let (content_type, body) = multipart_body(channel, files);
        let request = Request::post("/api/submissions/upload")
            .header(OWNER_HEADER, self.owner.to_string())
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }

    pub async fn get_submission(&self, id: SubmissionId) -> (StatusCode, Value) {
        self.get_submission_as(self.owner, id).await
    }

    pub async fn get_submission_as(&self, owner: OwnerId, id: SubmissionId) -> (StatusCode, Value) {
        let request = Request::get(format!("/api/submissions/{}", id))
            .header(OWNER_HEADER, owner.to_string())
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn retry(&self, id: SubmissionId) -> (StatusCode, Value) {
        let request = Request::post(format!("/api/submissions/{}/retry", id))
            .header(OWNER_HEADER, self.owner.to_string())
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// Deliver a correctly signed webhook.
    pub async fn webhook(&self, payload: &Value) -> (StatusCode, Value) {
        let body = payload.to_string();
        let signature = sign(body.as_bytes(), WEBHOOK_SECRET.as_bytes());
        self.webhook_raw(body, Some(&signature)).await
    }

    pub async fn webhook_raw(&self, body: String, signature: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::post("/api/webhooks/analysis")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        self.send(request.body(Body::from(body)).unwrap()).await
    }

    pub async fn record(&self, id: SubmissionId) -> SubmissionRecord {
        self.store.find(id).await.unwrap().expect("record exists")
    }

    pub async fn report(&self, id: SubmissionId) -> Option<Report> {
        self.store.find_report(id).await.unwrap()
    }

    /// Poll the store until the record reaches `status`.
    pub async fn wait_for_status(&self, id: SubmissionId, status: SubmissionStatus) -> SubmissionRecord {
        self.wait_for(id, &format!("status {}", status), |record| record.status() == status)
            .await
    }

    /// Poll the store until `done` holds for the record.
    pub async fn wait_for(
        &self,
        id: SubmissionId,
        what: &str,
        done: impl Fn(&SubmissionRecord) -> bool,
    ) -> SubmissionRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let record = self.record(id).await;
            if done(&record) {
                return record;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "submission {} stuck in {} waiting for {}",
                    id,
                    record.status(),
                    what
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn submission_id(body: &Value) -> SubmissionId {
    body["submissionId"]
        .as_str()
        .and_then(|id| SubmissionId::parse(id).ok())
        .unwrap_or_else(|| panic!("no submissionId in {}", body))
}

pub fn report_ready(id: SubmissionId, suspicious: bool, risk_score: f64, reasons: &[&str]) -> Value {
    serde_json::json!({
        "submissionId": id.to_string(),
        "status": "REPORT_READY",
        "suspicious": suspicious,
        "riskScore": risk_score,
        "reasons": reasons,
    })
}

const BOUNDARY: &str = "fraudwatch-test-boundary";

/// Encode a multipart body with a `channel` field and `(filename, mime,
/// bytes)` file parts.
pub fn multipart_body(channel: &str, files: &[(&str, &str, &[u8])]) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"channel\"\r\n\r\n{channel}\r\n"
        )
        .as_bytes(),
    );
    for (filename, mime, bytes) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {mime}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    (format!("multipart/form-data; boundary={BOUNDARY}"), body)
}
