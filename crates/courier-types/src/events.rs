use serde::{Deserialize, Serialize};

/// Commands sent FROM client TO server over the persistent connection.
///
/// Wire form is `{"type": ..., "data": {...}}`. Once a connection has
/// negotiated a secure channel, `data` arrives as a hex sealed box and is
/// unsealed by the connection before deserializing into this enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Ask the server to switch this connection to sealed mode.
    SecureReq {
        #[serde(rename = "publicKey")]
        public_key: String,
    },

    /// Authenticate the connection with a session token.
    AuthRes {
        token: String,
        #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
        device_id: Option<i64>,
    },
}

/// Events sent FROM server TO client over the persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Reply to `secure_req` carrying the per-connection server public key.
    SecureRes {
        #[serde(rename = "publicKey")]
        public_key: String,
    },

    /// Authentication outcome; only sent on failure.
    AuthStatus { status: String },

    /// A message addressed to this connection's identity was persisted.
    /// `message.digest` is always the recipient's own digest.
    NewMessage {
        #[serde(rename = "conversationId")]
        conversation_id: i64,
        message: NewMessagePayload,
    },

    /// The connection's user was added to a freshly created conversation.
    NewConversation {
        #[serde(rename = "conversationId")]
        conversation_id: i64,
        name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessagePayload {
    /// Sender's username.
    pub sender: String,
    /// The recipient-specific digest, hex.
    pub digest: String,
    /// Send time, unix milliseconds.
    pub time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_wire_tags() {
        let cmd: ClientCommand = serde_json::from_value(json!({
            "type": "secure_req",
            "data": { "publicKey": "ab".repeat(32) },
        }))
        .unwrap();
        assert!(matches!(cmd, ClientCommand::SecureReq { .. }));

        let cmd: ClientCommand = serde_json::from_value(json!({
            "type": "auth_res",
            "data": { "token": "t", "deviceId": 4 },
        }))
        .unwrap();
        match cmd {
            ClientCommand::AuthRes { device_id, .. } => assert_eq!(device_id, Some(4)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn event_wire_shape() {
        let event = ServerEvent::NewMessage {
            conversation_id: 9,
            message: NewMessagePayload {
                sender: "alice".into(),
                digest: "deadd0d0".into(),
                time: 1_700_000_000_000,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "new_message");
        assert_eq!(value["data"]["conversationId"], 9);
        assert_eq!(value["data"]["message"]["digest"], "deadd0d0");
    }
}
