use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::domains::submissions::SubmissionError;
use crate::kernel::signature::{verify_object, OBJECT_SIGNATURE_PARAM};

/// Key the `/files` route checks object URL signatures against.
#[derive(Clone)]
pub struct FileUrlSecret(pub Arc<[u8]>);

/// Stored-object gate
///
/// Runs inside the `/files` nest, so the request path is the object's
/// `<bucket>/<key>`. Requests without a matching `sig` query parameter are
/// rejected before the file system is touched.
pub async fn signed_file_middleware(
    State(secret): State<FileUrlSecret>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let signature = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == OBJECT_SIGNATURE_PARAM)
            .map(|(_, value)| value.into_owned())
    });

    match signature {
        Some(sig) if verify_object(&path, &sig, &secret.0) => next.run(request).await,
        _ => {
            warn!(%path, "rejected unsigned or mis-signed file request");
            SubmissionError::Authentication("missing or invalid file signature".to_string())
                .into_response()
        }
    }
}
