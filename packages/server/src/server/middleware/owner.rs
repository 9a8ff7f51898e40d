use axum::{middleware::Next, response::Response};
use tracing::debug;

use crate::common::OwnerId;
use crate::domains::submissions::SubmissionError;

pub const OWNER_HEADER: &str = "x-owner-id";
const OWNER_QUERY_PARAM: &str = "owner_id";

/// Submitting principal, as asserted by the authenticating proxy in front
/// of this service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthOwner {
    pub owner_id: OwnerId,
}

impl AuthOwner {
    /// Unwrap an optional extension, failing with an authentication error.
    pub fn require(owner: Option<axum::Extension<AuthOwner>>) -> Result<OwnerId, SubmissionError> {
        owner.map(|ext| ext.0.owner_id).ok_or_else(|| {
            SubmissionError::Authentication("missing or invalid owner identity".to_string())
        })
    }
}

/// Owner identity middleware
///
/// Reads the owner id from the `X-Owner-Id` header, falling back to the
/// `owner_id` query parameter (EventSource cannot set headers), and adds
/// `AuthOwner` to request extensions. Requests without a valid id continue
/// without it; handlers that need an owner reject them.
pub async fn owner_identity_middleware(
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    match extract_owner(&request) {
        Some(owner) => {
            request.extensions_mut().insert(owner);
        }
        None => debug!("request without owner identity"),
    }

    next.run(request).await
}

fn extract_owner(request: &axum::http::Request<axum::body::Body>) -> Option<AuthOwner> {
    let from_header = request
        .headers()
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let from_query = || {
        request.uri().query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == OWNER_QUERY_PARAM)
                .map(|(_, value)| value.into_owned())
        })
    };

    let raw = from_header.or_else(from_query)?;
    let owner_id = OwnerId::parse(raw.trim()).ok()?;
    Some(AuthOwner { owner_id })
}
