use serde::{Deserialize, Serialize};

// -- Sealed request/response envelope --

/// Outer body of a sealed request: the real payload is the sealed-box
/// ciphertext of the inner JSON, keyed by the negotiated id token.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SealedRequest {
    #[serde(rename = "idToken")]
    pub id_token: String,
    pub digest: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SealedResponse {
    #[serde(rename = "idToken")]
    pub id_token: String,
    #[serde(rename = "encryptedObject")]
    pub encrypted_object: String,
}

// -- Key negotiation --

#[derive(Debug, Deserialize)]
pub struct NegotiateRequest {
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NegotiateResponse {
    #[serde(rename = "idToken")]
    pub id_token: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

// -- Salts --

#[derive(Debug, Deserialize)]
pub struct SaltsRequest {
    pub action: String,
    pub username: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaltsResponse {
    #[serde(rename = "clientSalt")]
    pub client_salt: String,
    #[serde(rename = "keygenSalt")]
    pub keygen_salt: String,
}

// -- Accounts --

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub hash: String,
    #[serde(rename = "clientSalt")]
    pub client_salt: String,
    #[serde(rename = "keygenSalt")]
    pub keygen_salt: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "deviceName")]
    pub device_name: Option<String>,
    #[serde(rename = "devicePublicKey")]
    pub device_public_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub hash: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthTokenResponse {
    #[serde(rename = "authToken")]
    pub auth_token: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    #[serde(rename = "authToken")]
    pub auth_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub username: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
pub struct ConversationCreateRequest {
    #[serde(rename = "authToken")]
    pub auth_token: String,
    pub participants: Vec<String>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationCreateResponse {
    #[serde(rename = "conversationID")]
    pub conversation_id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ConversationListRequest {
    #[serde(rename = "authToken")]
    pub auth_token: String,
    #[serde(rename = "deviceID")]
    pub device_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationListResponse {
    #[serde(rename = "conversationObjects")]
    pub conversation_objects: Vec<ConversationSummary>,
}

/// One conversation as the caller sees it: their custom name wins over
/// the default, and the digest preview is the caller's own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: i64,
    pub name: String,
    pub last_msg_digest: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageHistoryRequest {
    #[serde(rename = "authToken")]
    pub auth_token: String,
    #[serde(rename = "conversationID")]
    pub conversation_id: i64,
    #[serde(rename = "deviceID")]
    pub device_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageHistoryResponse {
    #[serde(rename = "message_objs")]
    pub message_objs: Vec<MessageView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub sender: String,
    pub digest: String,
    /// Unix milliseconds.
    pub time: i64,
}

#[derive(Debug, Deserialize)]
pub struct ConversationKeysRequest {
    #[serde(rename = "authToken")]
    pub auth_token: String,
    #[serde(rename = "conversationID")]
    pub conversation_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationKeysResponse {
    #[serde(rename = "userKeys")]
    pub user_keys: Vec<IdentityKey>,
    #[serde(rename = "deviceKeys")]
    pub device_keys: Vec<IdentityKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityKey {
    pub id: i64,
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct LastMessageRequest {
    #[serde(rename = "authToken")]
    pub auth_token: String,
    #[serde(rename = "conversationID")]
    pub conversation_id: i64,
    #[serde(rename = "deviceID")]
    pub device_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LastMessageResponse {
    pub digest: String,
}

// -- Message send --

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(rename = "authToken")]
    pub auth_token: String,
    #[serde(rename = "conversationID")]
    pub conversation_id: i64,
    pub digests: DigestSet,
}

#[derive(Debug, Deserialize)]
pub struct DigestSet {
    #[serde(rename = "userDigests")]
    pub user_digests: Vec<DigestEntry>,
    #[serde(rename = "deviceDigests")]
    pub device_digests: Vec<DigestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DigestEntry {
    pub id: i64,
    pub digest: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub status: String,
}
