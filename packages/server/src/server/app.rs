//! Application setup and server configuration.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Extension},
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower::Layer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::domains::submissions::actions::SubmissionLifecycle;
use crate::domains::submissions::activities::dispatch::WEBHOOK_PATH;
use crate::domains::submissions::activities::{
    DispatchConfig, DispatchQueue, DispatchRunner, Dispatcher, WebhookIngester,
};
use crate::domains::submissions::SubmissionMachine;
use crate::kernel::signature::SIGNATURE_HEADER;
use crate::kernel::ServerDeps;
use crate::server::middleware::{
    owner_identity_middleware, signed_file_middleware, FileUrlSecret, OWNER_HEADER,
};
use crate::server::routes::{
    analysis_webhook_handler, create_submission_handler, get_submission_handler, health_handler,
    retry_submission_handler, stream_handler, upload_submission_handler,
};

/// Multipart framing allowance on top of the per-file limit.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// Knobs the router and its background runner need beyond `ServerDeps`.
#[derive(Debug, Clone)]
pub struct AppSettings {
    pub webhook_secret: String,
    pub dispatch: DispatchConfig,
    pub max_dispatch_attempts: u32,
    pub upload_max_bytes: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            webhook_secret: String::new(),
            dispatch: DispatchConfig::default(),
            max_dispatch_attempts: SubmissionMachine::default().max_dispatch_attempts(),
            upload_max_bytes: 200 * 1024 * 1024,
        }
    }
}

/// Local upload directory served under `/files`, and the key its URLs are
/// signed with.
#[derive(Clone)]
pub struct FileServing {
    pub dir: PathBuf,
    pub url_secret: Arc<[u8]>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub deps: ServerDeps,
    pub lifecycle: SubmissionLifecycle,
    pub queue: DispatchQueue,
    pub dispatcher: Arc<Dispatcher>,
    pub ingester: WebhookIngester,
    pub upload_max_bytes: usize,
}

impl AppState {
    /// Wire the lifecycle, dispatcher and webhook ingester over `deps`.
    ///
    /// The returned runner owns the receiving end of the dispatch queue and
    /// must be spawned by the caller; until it runs, jobs only accumulate.
    pub fn new(deps: ServerDeps, settings: AppSettings) -> (Self, DispatchRunner) {
        let lifecycle = SubmissionLifecycle::new(
            deps.store.clone(),
            deps.event_bus.clone(),
            SubmissionMachine::new(settings.max_dispatch_attempts),
        );
        let (queue, rx) = DispatchQueue::channel();

        let dispatcher = Arc::new(Dispatcher::new(
            lifecycle.clone(),
            deps.classifier.clone(),
            deps.storage.clone(),
            queue.clone(),
            settings.dispatch,
        ));
        let runner = DispatchRunner::new(dispatcher.clone(), rx);

        let ingester = WebhookIngester::new(lifecycle.clone(), settings.webhook_secret.as_bytes());

        let state = Self {
            deps,
            lifecycle,
            queue,
            dispatcher,
            ingester,
            upload_max_bytes: settings.upload_max_bytes,
        };
        (state, runner)
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static(OWNER_HEADER),
            HeaderName::from_static(SIGNATURE_HEADER),
        ]);

    if allowed_origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

/// Build the Axum application router
///
/// `files` is served under `/files` so the classifier can fetch uploads by
/// signed URL; leave it `None` when storage lives elsewhere.
pub fn build_app(state: AppState, allowed_origins: &[String], files: Option<FileServing>) -> Router {
    let body_limit = state.upload_max_bytes.saturating_add(MULTIPART_OVERHEAD);

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/api/submissions", post(create_submission_handler))
        .route("/api/submissions/upload", post(upload_submission_handler))
        .route("/api/submissions/events", get(stream_handler))
        .route("/api/submissions/:id", get(get_submission_handler))
        .route("/api/submissions/:id/retry", post(retry_submission_handler))
        .route(WEBHOOK_PATH, post(analysis_webhook_handler));

    if let Some(files) = files {
        let gate = middleware::from_fn_with_state(
            FileUrlSecret(files.url_secret),
            signed_file_middleware,
        );
        router = router.nest_service("/files", gate.layer(ServeDir::new(files.dir)));
    }

    router
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(middleware::from_fn(owner_identity_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(state))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
}
