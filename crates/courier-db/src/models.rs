#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub hash: String,
    pub client_salt: String,
    pub keygen_salt: String,
    pub server_salt: String,
    pub pw_public_key: String,
}

/// Fields needed to create a user; the server salt and final hash are
/// computed by the caller before insert.
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub username: &'a str,
    pub hash: &'a str,
    pub client_salt: &'a str,
    pub keygen_salt: &'a str,
    pub server_salt: &'a str,
    pub pw_public_key: &'a str,
}

#[derive(Debug, Clone)]
pub struct AuthTokenRow {
    pub token: String,
    pub user_id: i64,
    /// Unix milliseconds.
    pub expiration: i64,
    pub public_key: String,
}

#[derive(Debug, Clone)]
pub struct KeyPairRecordRow {
    pub id_token: String,
    pub server_public_key: String,
    pub server_secret_key: String,
    pub client_public_key: String,
    /// Unix milliseconds.
    pub expiration: i64,
}

#[derive(Debug, Clone)]
pub struct MembershipRow {
    pub user_id: i64,
    pub conversation_id: i64,
    pub custom_name: Option<String>,
}

/// One conversation as listed for a particular member.
#[derive(Debug, Clone)]
pub struct ConversationEntryRow {
    pub conversation_id: i64,
    pub default_name: String,
    pub custom_name: Option<String>,
}

/// One stored digest joined with its message metadata.
#[derive(Debug, Clone)]
pub struct DigestViewRow {
    pub sender_username: String,
    pub contents: String,
    /// Unix milliseconds.
    pub senttime: i64,
}
