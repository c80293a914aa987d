use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key is not 32 bytes / 64 hex characters.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// The key material is not valid hex.
    #[error("invalid key encoding")]
    InvalidKeyEncoding,

    /// The sealed payload is shorter than the fixed framing.
    #[error("sealed payload truncated: {0} bytes")]
    Truncated(usize),

    /// The ciphertext is not valid hex.
    #[error("sealed payload is not hex")]
    NotHex,

    /// Authentication tag mismatch — wrong key or tampered data.
    #[error("decryption failed")]
    DecryptionFailed,
}

pub type CryptoResult<T> = Result<T, CryptoError>;
