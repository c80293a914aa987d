//! Message send pipeline.
//!
//! A send request moves through five stages: authenticate, membership
//! check, roster validation, persistence, fan-out. Failures up to the
//! persistence stage leave no trace; persistence is one transaction; and
//! fan-out is best-effort — the sender's acknowledgment reflects
//! persistence alone.

use std::collections::HashSet;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::Value;

use courier_types::api::{DigestSet, SendMessageRequest, SendMessageResponse};
use courier_types::events::{NewMessagePayload, ServerEvent};
use courier_types::models::{DigestRecipient, PreparedDigest, Roster};
use courier_types::schema::{is_malformed, FieldType, Shape};

use crate::error::ApiError;
use crate::state::{authenticate, blocking, AppState};

/// Retry hint returned when the digest set no longer covers the roster —
/// membership may have shifted since the client last fetched it.
const STALE_ROSTER_HINT: &str = "missing digests, refresh to send messages to new members";

fn digest_entry_shape() -> FieldType {
    FieldType::Object(
        Shape::new()
            .required("id", FieldType::Number)
            .required("digest", FieldType::Hex),
    )
}

fn send_shape() -> Shape {
    Shape::new()
        .required("authToken", FieldType::String)
        .required("conversationID", FieldType::Number)
        .required(
            "digests",
            FieldType::Object(
                Shape::new()
                    .required("userDigests", FieldType::Array(Box::new(digest_entry_shape())))
                    .required("deviceDigests", FieldType::Array(Box::new(digest_entry_shape()))),
            ),
        )
}

#[derive(Debug, PartialEq, Eq)]
enum RosterViolation {
    /// An id in the digest set is not a roster member at all — a
    /// malformed or badly stale client, rejected hard.
    ForeignRecipient,
    /// Roster members and digests don't line up one-to-one — a benign
    /// race with membership changes, retried by the client.
    Cardinality,
}

/// Check that the digest set covers the current roster exactly: one
/// digest per member user and one per member device, nothing else.
fn validate_digest_set(
    roster: &Roster,
    digests: &DigestSet,
) -> Result<Vec<PreparedDigest>, RosterViolation> {
    let members: HashSet<i64> = roster.user_ids.iter().copied().collect();
    let devices: HashSet<i64> = roster.device_ids.iter().copied().collect();

    for entry in &digests.user_digests {
        if !members.contains(&entry.id) {
            return Err(RosterViolation::ForeignRecipient);
        }
    }
    for entry in &digests.device_digests {
        if !devices.contains(&entry.id) {
            return Err(RosterViolation::ForeignRecipient);
        }
    }

    let distinct_users: HashSet<i64> = digests.user_digests.iter().map(|d| d.id).collect();
    let distinct_devices: HashSet<i64> = digests.device_digests.iter().map(|d| d.id).collect();
    let users_cover = distinct_users.len() == digests.user_digests.len()
        && distinct_users.len() == members.len();
    let devices_cover = distinct_devices.len() == digests.device_digests.len()
        && distinct_devices.len() == devices.len();
    if !users_cover || !devices_cover {
        return Err(RosterViolation::Cardinality);
    }

    let mut prepared = Vec::with_capacity(digests.user_digests.len() + digests.device_digests.len());
    prepared.extend(digests.user_digests.iter().map(|d| PreparedDigest {
        recipient: DigestRecipient::User(d.id),
        contents: d.digest.clone(),
    }));
    prepared.extend(digests.device_digests.iter().map(|d| PreparedDigest {
        recipient: DigestRecipient::Device(d.id),
        contents: d.digest.clone(),
    }));
    Ok(prepared)
}

/// `POST /messages` — validate, persist, fan out.
pub async fn send(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let senttime = Utc::now().timestamp_millis();
    if is_malformed(&body, &send_shape()) {
        return Err(ApiError::Malformed);
    }
    let req: SendMessageRequest = serde_json::from_value(body).map_err(|_| ApiError::Malformed)?;

    // Authenticated
    let verified = authenticate(&state, req.auth_token).await?;
    let sender_id = verified.user_id;
    let conversation_id = req.conversation_id;

    // PermissionChecked
    let db = state.db.clone();
    let membership = blocking(move || db.get_membership(sender_id, conversation_id)).await?;
    if membership.is_none() {
        return Err(ApiError::Forbidden);
    }

    // RosterValidated — against membership as of now; a shift between
    // this read and the insert surfaces as a client retry, not corruption.
    let db = state.db.clone();
    let roster = blocking(move || db.get_roster(conversation_id)).await?;
    let prepared = validate_digest_set(&roster, &req.digests).map_err(|violation| match violation {
        RosterViolation::ForeignRecipient => ApiError::Malformed,
        RosterViolation::Cardinality => ApiError::RecoverableConflict(STALE_ROSTER_HINT),
    })?;

    // Persisted — message and digests in one transaction.
    let db = state.db.clone();
    let to_insert = prepared.clone();
    let sender_username = blocking(move || {
        db.insert_message_with_digests(conversation_id, sender_id, senttime, &to_insert)?;
        Ok(db
            .get_user_by_id(sender_id)?
            .map(|user| user.username)
            .unwrap_or_default())
    })
    .await?;

    // FannedOut — each live recipient connection gets its own digest and
    // nobody else's. Delivery failures never fail the request.
    let targets = prepared
        .into_iter()
        .map(|digest| {
            (
                digest.recipient,
                ServerEvent::NewMessage {
                    conversation_id,
                    message: NewMessagePayload {
                        sender: sender_username.clone(),
                        digest: digest.contents,
                        time: senttime,
                    },
                },
            )
        })
        .collect();
    state.presence.fanout(targets).await;

    Ok(Json(SendMessageResponse { status: "success".into() }).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::api::DigestEntry;

    fn roster() -> Roster {
        Roster { user_ids: vec![1, 2], device_ids: vec![10] }
    }

    fn entry(id: i64, digest: &str) -> DigestEntry {
        DigestEntry { id, digest: digest.into() }
    }

    #[test]
    fn exact_cover_is_accepted_and_tagged() {
        let digests = DigestSet {
            user_digests: vec![entry(1, "aa"), entry(2, "bb")],
            device_digests: vec![entry(10, "cc")],
        };
        let prepared = validate_digest_set(&roster(), &digests).unwrap();
        assert_eq!(prepared.len(), 3);
        assert!(prepared
            .iter()
            .any(|d| d.recipient == DigestRecipient::User(2) && d.contents == "bb"));
        assert!(prepared
            .iter()
            .any(|d| d.recipient == DigestRecipient::Device(10) && d.contents == "cc"));
    }

    #[test]
    fn strict_subset_is_a_recoverable_conflict() {
        let digests = DigestSet {
            user_digests: vec![entry(1, "aa")],
            device_digests: vec![entry(10, "cc")],
        };
        assert_eq!(
            validate_digest_set(&roster(), &digests),
            Err(RosterViolation::Cardinality)
        );
    }

    #[test]
    fn missing_device_digest_is_a_recoverable_conflict() {
        let digests = DigestSet {
            user_digests: vec![entry(1, "aa"), entry(2, "bb")],
            device_digests: vec![],
        };
        assert_eq!(
            validate_digest_set(&roster(), &digests),
            Err(RosterViolation::Cardinality)
        );
    }

    #[test]
    fn duplicate_recipient_is_a_recoverable_conflict() {
        let digests = DigestSet {
            user_digests: vec![entry(1, "aa"), entry(1, "a2")],
            device_digests: vec![entry(10, "cc")],
        };
        assert_eq!(
            validate_digest_set(&roster(), &digests),
            Err(RosterViolation::Cardinality)
        );
    }

    #[test]
    fn recipient_outside_roster_is_rejected_hard() {
        let digests = DigestSet {
            user_digests: vec![entry(1, "aa"), entry(3, "xx")],
            device_digests: vec![entry(10, "cc")],
        };
        assert_eq!(
            validate_digest_set(&roster(), &digests),
            Err(RosterViolation::ForeignRecipient)
        );

        // a device id in the user list is foreign, not a near-miss
        let digests = DigestSet {
            user_digests: vec![entry(1, "aa"), entry(10, "xx")],
            device_digests: vec![entry(10, "cc")],
        };
        assert_eq!(
            validate_digest_set(&roster(), &digests),
            Err(RosterViolation::ForeignRecipient)
        );
    }

    #[test]
    fn empty_roster_conversation_accepts_empty_set() {
        let roster = Roster::default();
        let digests = DigestSet { user_digests: vec![], device_digests: vec![] };
        assert!(validate_digest_set(&roster, &digests).unwrap().is_empty());
    }
}
