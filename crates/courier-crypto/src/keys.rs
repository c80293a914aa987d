use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::{CryptoError, CryptoResult};

/// Key size in bytes; hex form is twice this.
pub const KEY_SIZE: usize = 32;

/// An X25519 public key, hex-rendered on every wire surface.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub(crate) [u8; KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(PublicKey(arr))
    }

    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidKeyEncoding)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_hex()[..16])
    }
}

/// An X25519 secret key. Persisted hex for ephemeral key records; zeroed
/// on drop when held in memory.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SecretKey(pub(crate) [u8; KEY_SIZE]);

impl SecretKey {
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidKeyEncoding)?;
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(SecretKey(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(X25519Public::from(&secret).to_bytes())
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

/// A freshly generated keypair for one transport-encryption session.
#[derive(Clone)]
pub struct Keypair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Keypair {
            public: PublicKey(public.to_bytes()),
            secret: SecretKey(secret.to_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let pair = Keypair::generate();
        let restored = PublicKey::from_hex(&pair.public.to_hex()).unwrap();
        assert_eq!(pair.public, restored);

        let secret = SecretKey::from_hex(&pair.secret.to_hex()).unwrap();
        assert_eq!(secret.public_key(), pair.public);
    }

    #[test]
    fn rejects_bad_key_material() {
        assert_eq!(
            PublicKey::from_hex("ab"),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 1 })
        );
        assert_eq!(PublicKey::from_hex("zz"), Err(CryptoError::InvalidKeyEncoding));
        assert!(SecretKey::from_hex(&"ab".repeat(33)).is_err());
    }
}
