//! Integration tests for the signed `/files` route the classifier fetches
//! uploads from.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

use fraudwatch_core::common::OwnerId;
use fraudwatch_core::domains::submissions::models::AttachmentRef;
use fraudwatch_core::kernel::{BaseObjectStorage, LocalObjectStorage, TestDependencies};
use fraudwatch_core::server::{build_app, AppSettings, AppState, FileServing};

const URL_SECRET: &str = "files-url-secret";

struct Served {
    app: Router,
    storage: LocalObjectStorage,
    root: PathBuf,
}

impl Served {
    fn new() -> Self {
        let root = std::env::temp_dir().join(format!("fraudwatch-files-{}", Uuid::now_v7()));
        let storage =
            LocalObjectStorage::new(&root, "http://core.test").with_url_secret(URL_SECRET);

        let (state, _runner) = AppState::new(
            TestDependencies::new().into_deps(),
            AppSettings {
                webhook_secret: "test-webhook-secret".to_string(),
                ..AppSettings::default()
            },
        );
        let files = FileServing {
            dir: root.clone(),
            url_secret: Arc::from(URL_SECRET.as_bytes()),
        };
        let app = build_app(state, &[], Some(files));

        Self { app, storage, root }
    }

    async fn store(&self, name: &str, bytes: &'static [u8]) -> AttachmentRef {
        self.storage
            .put(OwnerId::new(), name, None, Bytes::from_static(bytes))
            .await
            .unwrap()
    }

    /// Path and query of the URL storage hands to the classifier.
    fn signed_path(&self, attachment: &AttachmentRef) -> String {
        let url = url::Url::parse(&self.storage.file_url(attachment)).unwrap();
        format!("{}?{}", url.path(), url.query().unwrap_or_default())
    }

    async fn get(&self, uri: &str) -> (StatusCode, Bytes) {
        let response = self
            .app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }
}

impl Drop for Served {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

#[tokio::test]
async fn signed_url_serves_the_stored_file() {
    let served = Served::new();
    let attachment = served.store("voice.wav", b"RIFF").await;

    let (status, body) = served.get(&served.signed_path(&attachment)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"RIFF");
}

#[tokio::test]
async fn unsigned_or_foreign_signatures_are_rejected() {
    let served = Served::new();
    let voice = served.store("voice.wav", b"RIFF").await;
    let clip = served.store("clip.mp4", b"mp4").await;

    let bare = format!("/files/{}/{}", voice.bucket, voice.key);
    let (status, _) = served.get(&bare).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = served.get(&format!("{}?sig=00ff", bare)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let clip_signed = served.signed_path(&clip);
    let clip_query = clip_signed.split_once('?').map(|(_, q)| q).unwrap();
    let (status, _) = served.get(&format!("{}?{}", bare, clip_query)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_file_with_valid_signature_is_not_found() {
    let served = Served::new();
    let attachment = served.store("voice.wav", b"RIFF").await;
    tokio::fs::remove_file(served.root.join(&attachment.bucket).join(&attachment.key))
        .await
        .unwrap();

    let (status, _) = served.get(&served.signed_path(&attachment)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
