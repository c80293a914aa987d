/// The identity a digest is addressed to: a user's password-derived key
/// or one specific device's key. Exactly one, never both — the enum makes
/// the invalid states unrepresentable at the write API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestRecipient {
    User(i64),
    Device(i64),
}

/// One validated digest ready for persistence and fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDigest {
    pub recipient: DigestRecipient,
    /// Opaque hex ciphertext; the server never interprets it.
    pub contents: String,
}

/// Current membership of a conversation at persistence time.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub user_ids: Vec<i64>,
    pub device_ids: Vec<i64>,
}
