use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;

use courier_db::{session, Database};
use courier_gateway::presence::PresenceDirectory;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub presence: PresenceDirectory,
}

/// Run a blocking store closure off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(anyhow!("blocking task join error: {e}")))?
        .map_err(ApiError::Internal)
}

/// Resolve the request's auth token to a user, sliding the token's
/// expiration as a side effect of verified use.
pub(crate) async fn authenticate(
    state: &AppState,
    token: String,
) -> Result<session::VerifiedSession, ApiError> {
    let db = state.db.clone();
    let now_ms = Utc::now().timestamp_millis();
    let verified = blocking(move || session::verify_token(&db, &token, now_ms)).await?;
    verified.ok_or(ApiError::Unauthenticated)
}
