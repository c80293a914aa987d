use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Request failure taxonomy. Validation and auth failures are produced at
/// the boundary and never reach persistence logic; store and crypto
/// failures are translated at each call site into `Internal`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Shape or type violation. Fails before any side effect; the client
    /// gets a bare rejection with no payload.
    #[error("malformed request")]
    Malformed,

    /// Invalid or expired token. Returned as a structured payload, not an
    /// HTTP error, so clients can tell it apart from transport failure.
    #[error("not authenticated")]
    Unauthenticated,

    /// Authenticated but lacking permission. Deliberately uninformative:
    /// "does not exist" and "not a member" are indistinguishable.
    #[error("forbidden")]
    Forbidden,

    /// Benign conflict from concurrent membership change. Carries a retry
    /// hint; the client refreshes and resubmits.
    #[error("{0}")]
    RecoverableConflict(&'static str),

    /// Store or crypto failure. Logged server-side, opaque to the client.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Malformed => StatusCode::BAD_REQUEST.into_response(),
            ApiError::Unauthenticated => Json(json!({
                "authenticated": false,
                "error": "auth token not valid",
            }))
            .into_response(),
            ApiError::Forbidden => StatusCode::FORBIDDEN.into_response(),
            ApiError::RecoverableConflict(hint) => Json(json!({
                "error": hint,
                "retry": true,
            }))
            .into_response(),
            ApiError::Internal(e) => {
                error!("internal error: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
