//! Minimal reader for SSE responses returned by the router.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use fraudwatch_core::common::OwnerId;
use fraudwatch_core::server::middleware::OWNER_HEADER;

use super::TestHarness;

#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.data).unwrap()
    }
}

/// An open live-update connection.
pub struct SseReader {
    body: Body,
    buffer: String,
}

impl SseReader {
    /// Next complete event, or `None` if nothing arrives within `wait` or the
    /// stream ends.
    pub async fn next_event_within(&mut self, wait: Duration) -> Option<SseEvent> {
        loop {
            if let Some(event) = self.take_buffered() {
                return Some(event);
            }
            let frame = match tokio::time::timeout(wait, self.body.frame()).await {
                Ok(Some(Ok(frame))) => frame,
                _ => return None,
            };
            if let Ok(data) = frame.into_data() {
                self.buffer.push_str(&String::from_utf8_lossy(&data));
            }
        }
    }

    pub async fn next_event(&mut self) -> SseEvent {
        self.next_event_within(Duration::from_secs(5))
            .await
            .expect("expected a live event")
    }

    /// Skip events until one named `name` arrives.
    pub async fn wait_for(&mut self, name: &str) -> SseEvent {
        loop {
            let event = self.next_event().await;
            if event.event == name {
                return event;
            }
        }
    }

    fn take_buffered(&mut self) -> Option<SseEvent> {
        let end = self.buffer.find("\n\n")?;
        let block: String = self.buffer.drain(..end + 2).collect();

        let mut event = SseEvent {
            event: "message".to_string(),
            data: String::new(),
        };
        for line in block.lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event.event = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                if !event.data.is_empty() {
                    event.data.push('\n');
                }
                event.data.push_str(data.strip_prefix(' ').unwrap_or(data));
            }
        }
        Some(event)
    }
}

impl TestHarness {
    /// Open the live channel for `owner` through the router.
    pub async fn connect(&self, owner: OwnerId) -> SseReader {
        let request = Request::get("/api/submissions/events")
            .header(OWNER_HEADER, owner.to_string())
            .body(Body::empty())
            .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        SseReader {
            body: response.into_body(),
            buffer: String::new(),
        }
    }

    /// Open the live channel with an arbitrary URI and no owner header.
    pub async fn connect_raw(&self, uri: &str) -> (StatusCode, Option<SseReader>) {
        let request = Request::get(uri).body(Body::empty()).unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let reader = (status == StatusCode::OK).then(|| SseReader {
            body: response.into_body(),
            buffer: String::new(),
        });
        (status, reader)
    }
}
