//! Conversation endpoints: create, list, per-conversation keys and
//! digest history.
//!
//! Membership is checked on every per-conversation operation. The denial
//! response never says whether the conversation exists — a non-member and
//! a bad id look identical from outside.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use courier_types::api::{
    ConversationCreateRequest, ConversationCreateResponse, ConversationKeysRequest,
    ConversationKeysResponse, ConversationListRequest, ConversationListResponse,
    ConversationSummary, IdentityKey, LastMessageRequest, LastMessageResponse,
    MessageHistoryRequest, MessageHistoryResponse, MessageView,
};
use courier_types::events::ServerEvent;
use courier_types::models::DigestRecipient;
use courier_types::schema::{is_malformed, FieldType, Shape};

use crate::error::ApiError;
use crate::state::{authenticate, blocking, AppState};

/// The identity whose digest stream a request is asking for: the device
/// stream when a device id is supplied, the caller's user stream otherwise.
fn stream_identity(user_id: i64, device_id: Option<i64>) -> DigestRecipient {
    match device_id {
        Some(device_id) => DigestRecipient::Device(device_id),
        None => DigestRecipient::User(user_id),
    }
}

async fn require_membership(
    state: &AppState,
    user_id: i64,
    conversation_id: i64,
) -> Result<(), ApiError> {
    let db = state.db.clone();
    let membership = blocking(move || db.get_membership(user_id, conversation_id)).await?;
    match membership {
        Some(_) => Ok(()),
        None => Err(ApiError::Forbidden),
    }
}

/// `POST /conversations` — create a conversation between the caller and
/// the named participants, then notify everyone who is online.
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let created_at = Utc::now().timestamp_millis();
    let shape = Shape::new()
        .required("authToken", FieldType::String)
        .required("participants", FieldType::Array(Box::new(FieldType::String)))
        .optional("name", FieldType::String);
    if is_malformed(&body, &shape) {
        return Err(ApiError::Malformed);
    }
    let req: ConversationCreateRequest =
        serde_json::from_value(body).map_err(|_| ApiError::Malformed)?;

    let verified = authenticate(&state, req.auth_token).await?;

    // Resolve every participant before any write.
    let db = state.db.clone();
    let participants = req.participants.clone();
    let resolved = blocking(move || {
        let mut ids = Vec::with_capacity(participants.len());
        for username in &participants {
            match db.get_user_by_username(username)? {
                Some(user) => ids.push(user.id),
                None => return Ok(None),
            }
        }
        Ok(Some(ids))
    })
    .await?;
    let Some(user_ids) = resolved else {
        return Ok(Json(json!({ "error": "some users not found" })).into_response());
    };
    if !user_ids.contains(&verified.user_id) {
        return Ok(Json(json!({ "error": "participants did not contain user" })).into_response());
    }

    let name = req
        .name
        .clone()
        .unwrap_or_else(|| req.participants.join(" "));

    let db = state.db.clone();
    let caller = verified.user_id;
    let custom_name = req.name.clone();
    let insert_name = name.clone();
    let member_ids = user_ids.clone();
    let conversation_id = blocking(move || {
        let members: Vec<(i64, Option<&str>)> = member_ids
            .iter()
            .map(|&id| {
                let custom = (id == caller).then_some(custom_name.as_deref()).flatten();
                (id, custom)
            })
            .collect();
        db.insert_conversation_with_members(&insert_name, created_at, &members)
    })
    .await?;

    for user_id in user_ids {
        state
            .presence
            .notify_user(
                user_id,
                ServerEvent::NewConversation { conversation_id, name: name.clone() },
            )
            .await;
    }

    Ok(Json(ConversationCreateResponse { conversation_id, name }).into_response())
}

/// `POST /conversations/list` — the caller's conversations with their
/// display name and the latest digest addressed to the calling identity.
pub async fn list(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let shape = Shape::new()
        .required("authToken", FieldType::String)
        .optional("deviceID", FieldType::Number);
    if is_malformed(&body, &shape) {
        return Err(ApiError::Malformed);
    }
    let req: ConversationListRequest =
        serde_json::from_value(body).map_err(|_| ApiError::Malformed)?;

    let verified = authenticate(&state, req.auth_token).await?;
    let identity = stream_identity(verified.user_id, req.device_id);

    let db = state.db.clone();
    let user_id = verified.user_id;
    let summaries = blocking(move || {
        let entries = db.list_conversations_for_user(user_id)?;
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            let last_msg_digest = db
                .last_digest_for_conversation(entry.conversation_id, identity)?
                .unwrap_or_default();
            summaries.push(ConversationSummary {
                id: entry.conversation_id,
                name: entry.custom_name.unwrap_or(entry.default_name),
                last_msg_digest,
            });
        }
        Ok(summaries)
    })
    .await?;

    Ok(Json(ConversationListResponse { conversation_objects: summaries }).into_response())
}

/// `POST /conversations/messages` — digest history for one conversation,
/// newest first.
pub async fn messages(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let shape = Shape::new()
        .required("authToken", FieldType::String)
        .required("conversationID", FieldType::Number)
        .optional("deviceID", FieldType::Number);
    if is_malformed(&body, &shape) {
        return Err(ApiError::Malformed);
    }
    let req: MessageHistoryRequest =
        serde_json::from_value(body).map_err(|_| ApiError::Malformed)?;

    let verified = authenticate(&state, req.auth_token).await?;
    require_membership(&state, verified.user_id, req.conversation_id).await?;

    let identity = stream_identity(verified.user_id, req.device_id);
    let db = state.db.clone();
    let conversation_id = req.conversation_id;
    let rows = blocking(move || db.list_digests_for_conversation(conversation_id, identity)).await?;

    let message_objs = rows
        .into_iter()
        .map(|row| MessageView {
            sender: row.sender_username,
            digest: row.contents,
            time: row.senttime,
        })
        .collect();

    Ok(Json(MessageHistoryResponse { message_objs }).into_response())
}

/// `POST /conversations/keys` — the public keys a sender needs to build
/// one digest per member identity: every member's password-derived key
/// and every member device's key.
pub async fn keys(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let shape = Shape::new()
        .required("authToken", FieldType::String)
        .required("conversationID", FieldType::Number);
    if is_malformed(&body, &shape) {
        return Err(ApiError::Malformed);
    }
    let req: ConversationKeysRequest =
        serde_json::from_value(body).map_err(|_| ApiError::Malformed)?;

    let verified = authenticate(&state, req.auth_token).await?;
    require_membership(&state, verified.user_id, req.conversation_id).await?;

    let db = state.db.clone();
    let conversation_id = req.conversation_id;
    let (user_keys, device_keys) = blocking(move || {
        let users = db.list_member_user_keys(conversation_id)?;
        let devices = db.list_member_device_keys(conversation_id)?;
        Ok((users, devices))
    })
    .await?;

    let into_keys = |pairs: Vec<(i64, String)>| {
        pairs
            .into_iter()
            .map(|(id, key)| IdentityKey { id, key })
            .collect::<Vec<_>>()
    };

    Ok(Json(ConversationKeysResponse {
        user_keys: into_keys(user_keys),
        device_keys: into_keys(device_keys),
    })
    .into_response())
}

/// `POST /conversations/last-message` — just the newest digest for the
/// calling identity, empty string when the conversation has none.
pub async fn last_message(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let shape = Shape::new()
        .required("authToken", FieldType::String)
        .required("conversationID", FieldType::Number)
        .optional("deviceID", FieldType::Number);
    if is_malformed(&body, &shape) {
        return Err(ApiError::Malformed);
    }
    let req: LastMessageRequest = serde_json::from_value(body).map_err(|_| ApiError::Malformed)?;

    let verified = authenticate(&state, req.auth_token).await?;
    require_membership(&state, verified.user_id, req.conversation_id).await?;

    let identity = stream_identity(verified.user_id, req.device_id);
    let db = state.db.clone();
    let conversation_id = req.conversation_id;
    let digest = blocking(move || db.last_digest_for_conversation(conversation_id, identity)).await?;

    Ok(Json(LastMessageResponse { digest: digest.unwrap_or_default() }).into_response())
}
