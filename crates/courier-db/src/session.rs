//! Session token authority.
//!
//! Tokens are opaque 256-bit random values stored with a sliding
//! expiration. Issue and verify share the two constants below; every
//! authenticated operation funnels through [`verify_token`], so the
//! opportunistic refresh happens on any verified use.

use anyhow::Result;
use rand::{rngs::OsRng, RngCore};
use tracing::warn;

use crate::queries::InsertOutcome;
use crate::Database;

/// How long an issued token stays valid: 24 hours.
pub const TOKEN_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// A verified use refreshes the expiration at most once per hour.
pub const REFRESH_WINDOW_MS: i64 = 60 * 60 * 1000;

/// Identity resolved from a valid token.
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    pub user_id: i64,
    pub public_key: String,
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Issue a fresh token for `user_id`, bound to the public key the login
/// presented. Uniqueness is the store's UNIQUE constraint: on a collision
/// the token is regenerated and the insert retried, never pre-checked.
pub fn issue_token(db: &Database, user_id: i64, public_key: &str, now_ms: i64) -> Result<String> {
    let expiration = now_ms + TOKEN_TTL_MS;
    loop {
        let token = generate_token();
        match db.insert_auth_token(&token, user_id, expiration, public_key)? {
            InsertOutcome::Inserted(_) => return Ok(token),
            InsertOutcome::Conflict => continue,
        }
    }
}

/// Resolve a token to its user. Returns `None` for unknown or expired
/// tokens. A token that has not been refreshed within the last hour gets
/// its expiration extended to `now + TTL`; that write is best-effort and
/// a failure is logged, not surfaced — it only affects session longevity.
pub fn verify_token(db: &Database, token: &str, now_ms: i64) -> Result<Option<VerifiedSession>> {
    let Some(row) = db.get_auth_token(token)? else {
        return Ok(None);
    };
    if row.expiration < now_ms {
        return Ok(None);
    }

    if row.expiration < now_ms + TOKEN_TTL_MS - REFRESH_WINDOW_MS {
        if let Err(e) = db.update_auth_token_expiration(token, now_ms + TOKEN_TTL_MS) {
            warn!("failed to refresh auth token expiration: {e}");
        }
    }

    Ok(Some(VerifiedSession {
        user_id: row.user_id,
        public_key: row.public_key,
    }))
}
