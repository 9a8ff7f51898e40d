//! Server-sent event plumbing for live connections.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::sse::{Event, Sse};
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::connection_registry::{EventFrame, Registration};

pub const CONNECTED_EVENT: &str = "connected";

/// Frames for one live connection. Holds the registry entry open; dropping
/// the stream (client disconnect) removes it.
pub struct LiveEventStream {
    rx: ReceiverStream<EventFrame>,
    registration: Registration,
}

impl LiveEventStream {
    pub(crate) fn new(rx: mpsc::Receiver<EventFrame>, registration: Registration) -> Self {
        Self {
            rx: ReceiverStream::new(rx),
            registration,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.registration.connection_id()
    }

    /// First frame sent on a new connection.
    pub fn connected_frame(&self) -> EventFrame {
        EventFrame::new(
            CONNECTED_EVENT,
            &json!({
                "type": CONNECTED_EVENT,
                "connectionId": self.connection_id(),
                "ownerId": self.registration.owner(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
    }
}

impl Stream for LiveEventStream {
    type Item = EventFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl From<EventFrame> for Event {
    fn from(frame: EventFrame) -> Self {
        Event::default().event(frame.event).data(frame.data)
    }
}

/// Turn a live connection into an SSE response that opens with `connected`.
pub fn into_sse(
    live: LiveEventStream,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let connected = stream::once(futures::future::ready(live.connected_frame()));
    let events = connected
        .chain(live)
        .map(|frame| Ok::<_, Infallible>(Event::from(frame)));

    Sse::new(events)
}
