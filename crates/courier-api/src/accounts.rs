//! Account endpoints: salt retrieval, registration, login, whoami.
//!
//! Password handling is split with the client: the client derives its own
//! hash from the password and per-user salts, and the server only ever
//! sees that hash, chained once more through SHA3-256 with a server-side
//! salt before storage. The server therefore cannot recover the password
//! or the client-side keys.

use axum::extract::State;
use axum::http::header;
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng, RngCore};
use serde_json::{json, Value};
use sha3::{Digest, Sha3_256};

use courier_db::models::NewUser;
use courier_db::{session, InsertOutcome};
use courier_types::api::{
    AuthTokenResponse, LoginRequest, RegisterRequest, SaltsRequest, SaltsResponse, SessionRequest,
    SessionResponse,
};
use courier_types::schema::{is_malformed, FieldType, Shape};

use crate::error::ApiError;
use crate::state::{authenticate, blocking, AppState};

/// Cookie names for the page-load identity check. Cookies are set in
/// plaintext mode only and are never consulted for API authorization.
pub const COOKIE_AUTH_TOKEN: &str = "courier-auth-token";
pub const COOKIE_PUBLIC_KEY: &str = "courier-public-key";

/// Random ASCII salt, 6 to 9 characters.
fn generate_salt() -> String {
    let mut rng = OsRng;
    let length = 6 + (rng.next_u32() % 4) as usize;
    (0..length).map(|_| char::from(rng.sample(Alphanumeric))).collect()
}

/// SHA3-256 over the client-derived hash chained with the server salt.
fn chain_hash(client_hash: &str, server_salt: &str) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(client_hash.as_bytes());
    hasher.update(server_salt.as_bytes());
    hex::encode(hasher.finalize())
}

fn auth_cookies(token: &str, public_key: &str) -> AppendHeaders<[(header::HeaderName, String); 2]> {
    AppendHeaders([
        (
            header::SET_COOKIE,
            format!("{COOKIE_AUTH_TOKEN}={token}; Path=/; HttpOnly"),
        ),
        (
            header::SET_COOKIE,
            format!("{COOKIE_PUBLIC_KEY}={public_key}; Path=/"),
        ),
    ])
}

/// `POST /auth/salts` — fresh salts for a new account, or the stored
/// salts for an existing username so the client can re-derive its keys.
pub async fn salts(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let shape = Shape::new()
        .required("action", FieldType::String)
        .optional("username", FieldType::String);
    if is_malformed(&body, &shape) {
        return Err(ApiError::Malformed);
    }
    let req: SaltsRequest = serde_json::from_value(body).map_err(|_| ApiError::Malformed)?;

    match req.action.as_str() {
        "new" => Ok(Json(SaltsResponse {
            client_salt: generate_salt(),
            keygen_salt: generate_salt(),
        })
        .into_response()),
        "get" => {
            let Some(username) = req.username else {
                return Err(ApiError::Malformed);
            };
            let username = username.to_lowercase();
            let db = state.db.clone();
            let user = blocking(move || db.get_user_by_username(&username)).await?;
            match user {
                None => Ok(Json(json!({ "error": "user does not exist" })).into_response()),
                Some(user) => Ok(Json(SaltsResponse {
                    client_salt: user.client_salt,
                    keygen_salt: user.keygen_salt,
                })
                .into_response()),
            }
        }
        _ => Err(ApiError::Malformed),
    }
}

/// `POST /auth/register` — create an account, optionally registering a
/// first device key, and log straight in.
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let shape = Shape::new()
        .required("email", FieldType::String)
        .required("username", FieldType::String)
        .required("hash", FieldType::Hash)
        .required("clientSalt", FieldType::String)
        .required("keygenSalt", FieldType::String)
        .required("publicKey", FieldType::Key)
        .optional("deviceName", FieldType::String)
        .optional("devicePublicKey", FieldType::Key);
    if is_malformed(&body, &shape) {
        return Err(ApiError::Malformed);
    }
    let req: RegisterRequest = serde_json::from_value(body).map_err(|_| ApiError::Malformed)?;

    let username = req.username.to_lowercase();
    let alphanumeric = username
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if !alphanumeric {
        return Ok(Json(json!({
            "error": "only alphanumeric characters allowed in username"
        }))
        .into_response());
    }

    let db = state.db.clone();
    let now_ms = Utc::now().timestamp_millis();
    let result = blocking(move || {
        if db.get_user_by_username(&username)?.is_some() {
            return Ok(Err("user already exists"));
        }
        if db.get_user_id_by_email(&req.email)?.is_some() {
            return Ok(Err("email already in use"));
        }

        let server_salt = generate_salt();
        let hash = chain_hash(&req.hash, &server_salt);
        let user_id = match db.insert_user(&NewUser {
            email: &req.email,
            username: &username,
            hash: &hash,
            client_salt: &req.client_salt,
            keygen_salt: &req.keygen_salt,
            server_salt: &server_salt,
            pw_public_key: &req.public_key,
        })? {
            InsertOutcome::Inserted(id) => id,
            // Lost the race with a concurrent registration.
            InsertOutcome::Conflict => return Ok(Err("user already exists")),
        };

        if let Some(device_public_key) = &req.device_public_key {
            db.insert_device(user_id, req.device_name.as_deref(), device_public_key)?;
        }

        let token = session::issue_token(&db, user_id, &req.public_key, now_ms)?;
        Ok(Ok((token, req.public_key)))
    })
    .await?;

    match result {
        Err(message) => Ok(Json(json!({ "error": message })).into_response()),
        Ok((token, public_key)) => Ok((
            auth_cookies(&token, &public_key),
            Json(AuthTokenResponse { auth_token: token }),
        )
            .into_response()),
    }
}

/// `POST /auth/login` — verify the client-derived hash and presented
/// public key, then issue a session token.
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let shape = Shape::new()
        .required("username", FieldType::String)
        .required("hash", FieldType::Hash)
        .required("publicKey", FieldType::Key);
    if is_malformed(&body, &shape) {
        return Err(ApiError::Malformed);
    }
    let req: LoginRequest = serde_json::from_value(body).map_err(|_| ApiError::Malformed)?;

    let username = req.username.to_lowercase();
    let db = state.db.clone();
    let now_ms = Utc::now().timestamp_millis();
    let result = blocking(move || {
        let Some(user) = db.get_user_by_username(&username)? else {
            return Ok(Err("invalid login credentials"));
        };
        if chain_hash(&req.hash, &user.server_salt) != user.hash {
            return Ok(Err("invalid login credentials"));
        }

        // The presented key must be the password-derived key or one of the
        // account's registered device keys.
        if req.public_key != user.pw_public_key
            && db.get_device_by_user_and_key(user.id, &req.public_key)?.is_none()
        {
            return Ok(Err("unrecognised public key, please retry login"));
        }

        let token = session::issue_token(&db, user.id, &req.public_key, now_ms)?;
        Ok(Ok((token, req.public_key)))
    })
    .await?;

    match result {
        Err(message) => Ok(Json(json!({ "error": message })).into_response()),
        Ok((token, public_key)) => Ok((
            auth_cookies(&token, &public_key),
            Json(AuthTokenResponse { auth_token: token }),
        )
            .into_response()),
    }
}

/// `POST /auth/session` — resolve a token to its username.
pub async fn whoami(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let shape = Shape::new().required("authToken", FieldType::String);
    if is_malformed(&body, &shape) {
        return Err(ApiError::Malformed);
    }
    let req: SessionRequest = serde_json::from_value(body).map_err(|_| ApiError::Malformed)?;

    let verified = authenticate(&state, req.auth_token).await?;
    let db = state.db.clone();
    let user = blocking(move || db.get_user_by_id(verified.user_id)).await?;
    let Some(user) = user else {
        return Err(ApiError::Internal(anyhow::anyhow!(
            "token resolved to missing user {}",
            verified.user_id
        )));
    };
    Ok(Json(SessionResponse { username: user.username }).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salts_are_random_ascii_of_bounded_length() {
        for _ in 0..50 {
            let salt = generate_salt();
            assert!((6..=9).contains(&salt.len()), "bad length: {}", salt.len());
            assert!(salt.bytes().all(|b| b.is_ascii_alphanumeric()));
        }
        assert_ne!(generate_salt(), generate_salt());
    }

    #[test]
    fn chained_hash_depends_on_both_inputs() {
        let a = chain_hash("deadbeef", "salt1");
        assert_eq!(a.len(), 64);
        assert_eq!(a, chain_hash("deadbeef", "salt1"));
        assert_ne!(a, chain_hash("deadbeef", "salt2"));
        assert_ne!(a, chain_hash("deadbeee", "salt1"));
    }
}
