//! Live-update channel.
//!
//! GET /api/submissions/events
//!
//! One SSE connection per browser tab. The owner comes from `X-Owner-Id`, or
//! from `?owner_id=` since EventSource can't send custom headers. The first
//! event is `connected`; after that the owner's lifecycle events and periodic
//! `heartbeat` frames follow. Closing the connection removes it from the
//! registry.

use std::convert::Infallible;

use axum::{
    extract::Extension,
    response::sse::{Event, Sse},
};
use futures::Stream;
use tracing::info;

use crate::domains::submissions::SubmissionResult;
use crate::kernel::sse::into_sse;
use crate::server::app::AppState;
use crate::server::middleware::AuthOwner;

pub async fn stream_handler(
    Extension(state): Extension<AppState>,
    owner: Option<Extension<AuthOwner>>,
) -> SubmissionResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let owner = AuthOwner::require(owner)?;

    let live = state.deps.event_bus.subscribe(owner);
    info!(owner_id = %owner, connection_id = live.connection_id(), "live connection opened");

    Ok(into_sse(live))
}
