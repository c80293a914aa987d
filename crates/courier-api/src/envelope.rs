//! Sealed request/response surface.
//!
//! A client that wants its API traffic encrypted first calls
//! `/keys/negotiate` with its own public key, receiving a fresh server
//! public key and an id token. It then wraps every request body as
//! `{idToken, digest}` where `digest` is the sealed-box ciphertext of the
//! real JSON payload. The middleware below unwraps such bodies before any
//! handler (and before shape validation) and seals the response back to
//! the client's bound key. Bodies that are not a sealed envelope pass
//! through untouched.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use serde_json::{json, Value};
use tracing::{error, warn};

use courier_crypto::{Keypair, PublicKey, SecretKey};
use courier_db::models::KeyPairRecordRow;
use courier_db::InsertOutcome;
use courier_types::api::{NegotiateRequest, NegotiateResponse, SealedRequest, SealedResponse};
use courier_types::schema::{is_malformed, FieldType, Shape};

use crate::error::ApiError;
use crate::state::{blocking, AppState};

/// Negotiated key pairs live for 10 minutes.
pub const KEYPAIR_TTL_MS: i64 = 10 * 60 * 1000;

/// Largest body the envelope layer will buffer.
const MAX_BODY_BYTES: usize = 1 << 20;

fn envelope_shape() -> Shape {
    Shape::new()
        .required("idToken", FieldType::Hex)
        .required("digest", FieldType::Hex)
}

fn generate_id_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `POST /keys/negotiate` — start a sealed session. Returns the server's
/// ephemeral public key plus the id token the client quotes on every
/// subsequent sealed request.
pub async fn negotiate(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let shape = Shape::new().required("publicKey", FieldType::Key);
    if is_malformed(&body, &shape) {
        return Err(ApiError::Malformed);
    }
    let req: NegotiateRequest = serde_json::from_value(body).map_err(|_| ApiError::Malformed)?;
    PublicKey::from_hex(&req.public_key).map_err(|_| ApiError::Malformed)?;

    let pair = Keypair::generate();
    let server_public = pair.public.to_hex();
    let server_secret = pair.secret.to_hex();
    let expiration = Utc::now().timestamp_millis() + KEYPAIR_TTL_MS;

    let db = state.db.clone();
    let public_for_record = server_public.clone();
    let id_token = blocking(move || {
        loop {
            let id_token = generate_id_token();
            let record = KeyPairRecordRow {
                id_token: id_token.clone(),
                server_public_key: public_for_record.clone(),
                server_secret_key: server_secret.clone(),
                client_public_key: req.public_key.clone(),
                expiration,
            };
            match db.insert_key_pair_record(&record)? {
                InsertOutcome::Inserted(_) => return Ok(id_token),
                InsertOutcome::Conflict => continue,
            }
        }
    })
    .await?;

    Ok(Json(NegotiateResponse { id_token, public_key: server_public }).into_response())
}

/// Middleware: transparently decrypt sealed request bodies and encrypt
/// the matching responses. Runs before every API handler.
pub async fn sealed_envelope(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let envelope: Option<SealedRequest> = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .filter(|value| !is_malformed(value, &envelope_shape()))
        .and_then(|value| serde_json::from_value(value).ok());

    let Some(envelope) = envelope else {
        // Plaintext mode: pass the original body through.
        let req = Request::from_parts(parts, Body::from(bytes));
        return next.run(req).await;
    };

    let db = state.db.clone();
    let id_token = envelope.id_token.clone();
    let record = match blocking(move || db.get_key_pair_record(&id_token)).await {
        Ok(Some(record)) => record,
        Ok(None) => return ApiError::Malformed.into_response(),
        Err(e) => return e.into_response(),
    };

    // Expiry is checked before any decryption attempt.
    if record.expiration < Utc::now().timestamp_millis() {
        return Json(json!({ "error": "keypair expired" })).into_response();
    }

    let secret = match SecretKey::from_hex(&record.server_secret_key) {
        Ok(secret) => secret,
        Err(e) => {
            error!("stored server key for id token is unreadable: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let plain = match courier_crypto::open_hex(&secret, &envelope.digest) {
        Ok(plain) => plain,
        Err(e) => {
            warn!("failed to unseal request body: {e}");
            return ApiError::Malformed.into_response();
        }
    };

    // The decrypted object becomes the effective request body for every
    // downstream layer, shape validation included.
    parts.headers.remove(header::CONTENT_LENGTH);
    let req = Request::from_parts(parts, Body::from(plain));
    let response = next.run(req).await;

    let client_key = match PublicKey::from_hex(&record.client_public_key) {
        Ok(key) => key,
        Err(e) => {
            error!("stored client key for id token is unreadable: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let (response_parts, response_body) = response.into_parts();
    let response_bytes = match axum::body::to_bytes(response_body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    // Only the status survives from the inner response. Headers (auth
    // cookies included) are a plaintext-mode concern and stay inside.
    let mut sealed_response = Json(SealedResponse {
        id_token: record.id_token,
        encrypted_object: courier_crypto::seal_hex(&client_key, &response_bytes),
    })
    .into_response();
    *sealed_response.status_mut() = response_parts.status;
    sealed_response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use courier_db::Database;
    use courier_gateway::presence::PresenceDirectory;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::state::AppStateInner;

    async fn echo(Json(body): Json<Value>) -> Json<Value> {
        Json(json!({ "echo": body }))
    }

    fn test_app() -> (Router, AppState) {
        let state: AppState = Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            presence: PresenceDirectory::new(),
        });
        let app = Router::new()
            .route("/echo", post(echo))
            .route("/keys/negotiate", post(negotiate))
            .layer(axum::middleware::from_fn_with_state(state.clone(), sealed_envelope))
            .with_state(state.clone());
        (app, state)
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn plaintext_bodies_pass_through() {
        let (app, _state) = test_app();
        let (status, body) = post_json(&app, "/echo", json!({ "hello": "world" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["echo"]["hello"], "world");
    }

    #[tokio::test]
    async fn sealed_roundtrip_through_negotiate() {
        let (app, _state) = test_app();
        let client = Keypair::generate();

        let (status, negotiated) = post_json(
            &app,
            "/keys/negotiate",
            json!({ "publicKey": client.public.to_hex() }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id_token = negotiated["idToken"].as_str().unwrap().to_string();
        let server_key = PublicKey::from_hex(negotiated["publicKey"].as_str().unwrap()).unwrap();

        let inner = json!({ "secret": "payload" });
        let digest = courier_crypto::seal_hex(&server_key, inner.to_string().as_bytes());
        let (status, sealed) = post_json(
            &app,
            "/echo",
            json!({ "idToken": id_token, "digest": digest }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sealed["idToken"].as_str().unwrap(), id_token);

        let opened = courier_crypto::open_hex(
            &client.secret,
            sealed["encryptedObject"].as_str().unwrap(),
        )
        .unwrap();
        let response: Value = serde_json::from_slice(&opened).unwrap();
        assert_eq!(response["echo"]["secret"], "payload");
    }

    #[tokio::test]
    async fn expired_id_token_is_reported_without_decrypting() {
        let (app, state) = test_app();
        let client = Keypair::generate();
        let server = Keypair::generate();

        state
            .db
            .insert_key_pair_record(&KeyPairRecordRow {
                id_token: "aa".repeat(32),
                server_public_key: server.public.to_hex(),
                server_secret_key: server.secret.to_hex(),
                client_public_key: client.public.to_hex(),
                expiration: 1, // long past
            })
            .unwrap();

        let digest = courier_crypto::seal_hex(&server.public, b"{}");
        let (status, body) = post_json(
            &app,
            "/echo",
            json!({ "idToken": "aa".repeat(32), "digest": digest }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], "keypair expired");
    }

    #[tokio::test]
    async fn unknown_id_token_and_garbage_digest_are_rejected() {
        let (app, _state) = test_app();
        let (status, _) = post_json(
            &app,
            "/echo",
            json!({ "idToken": "ab".repeat(32), "digest": "abcd" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn negotiate_rejects_bad_public_key() {
        let (app, _state) = test_app();
        let (status, _) = post_json(&app, "/keys/negotiate", json!({ "publicKey": "tooshort" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            post_json(&app, "/keys/negotiate", json!({ "publicKey": "ab".repeat(32), "x": 1 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
