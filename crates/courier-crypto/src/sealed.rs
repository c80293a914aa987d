use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{PublicKey, SecretKey, KEY_SIZE};

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Fixed bytes added to every sealed payload: ephemeral key, nonce, tag.
pub const SEAL_OVERHEAD: usize = KEY_SIZE + NONCE_SIZE + TAG_SIZE;

fn derive_key(shared: &[u8; 32], eph_pk: &[u8; 32], recipient_pk: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(eph_pk);
    hasher.update(recipient_pk);
    hasher.finalize().into()
}

/// Seal `plaintext` to `recipient`. A fresh ephemeral keypair is used per
/// call and discarded, so two seals of the same payload never match.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Vec<u8> {
    let eph_secret = StaticSecret::random_from_rng(OsRng);
    let eph_public = X25519Public::from(&eph_secret).to_bytes();

    let shared = eph_secret
        .diffie_hellman(&X25519Public::from(*recipient.as_bytes()))
        .to_bytes();
    let key = derive_key(&shared, &eph_public, recipient.as_bytes());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new((&key).into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .expect("ChaCha20-Poly1305 encryption is infallible for valid keys");

    let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
    out.extend_from_slice(&eph_public);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Open a sealed payload with the recipient's secret key.
pub fn open(secret: &SecretKey, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::Truncated(sealed.len()));
    }

    let mut eph_public = [0u8; KEY_SIZE];
    eph_public.copy_from_slice(&sealed[..KEY_SIZE]);
    let nonce = &sealed[KEY_SIZE..KEY_SIZE + NONCE_SIZE];
    let ciphertext = &sealed[KEY_SIZE + NONCE_SIZE..];

    let our_secret = StaticSecret::from(secret.0);
    let our_public = X25519Public::from(&our_secret).to_bytes();
    let shared = our_secret
        .diffie_hellman(&X25519Public::from(eph_public))
        .to_bytes();
    let key = derive_key(&shared, &eph_public, &our_public);

    let cipher = ChaCha20Poly1305::new((&key).into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Seal and hex-encode, for payloads that ride inside JSON strings.
pub fn seal_hex(recipient: &PublicKey, plaintext: &[u8]) -> String {
    hex::encode(seal(recipient, plaintext))
}

/// Decode hex and open.
pub fn open_hex(secret: &SecretKey, sealed_hex: &str) -> CryptoResult<Vec<u8>> {
    let sealed = hex::decode(sealed_hex).map_err(|_| CryptoError::NotHex)?;
    open(secret, &sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;

    #[test]
    fn seal_open_roundtrip() {
        let pair = Keypair::generate();
        let payload = br#"{"authToken":"abc123","conversationID":7}"#;

        let sealed = seal(&pair.public, payload);
        assert_eq!(sealed.len(), SEAL_OVERHEAD + payload.len());

        let opened = open(&pair.secret, &sealed).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn sealing_is_randomized() {
        let pair = Keypair::generate();
        let a = seal(&pair.public, b"same payload");
        let b = seal(&pair.public, b"same payload");
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let alice = Keypair::generate();
        let mallory = Keypair::generate();

        let sealed = seal(&alice.public, b"for alice only");
        assert_eq!(open(&mallory.secret, &sealed), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn tampering_is_detected() {
        let pair = Keypair::generate();
        let mut sealed = seal(&pair.public, b"payload");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(open(&pair.secret, &sealed), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn truncated_payload_rejected() {
        let pair = Keypair::generate();
        assert_eq!(
            open(&pair.secret, &[0u8; 10]),
            Err(CryptoError::Truncated(10))
        );
    }

    #[test]
    fn hex_surface_roundtrip() {
        let pair = Keypair::generate();
        let sealed = seal_hex(&pair.public, b"over json");
        assert!(sealed.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(open_hex(&pair.secret, &sealed).unwrap(), b"over json");
        assert_eq!(open_hex(&pair.secret, "not-hex!"), Err(CryptoError::NotHex));
    }

    #[test]
    fn empty_payload_roundtrip() {
        let pair = Keypair::generate();
        let sealed = seal(&pair.public, b"");
        assert_eq!(open(&pair.secret, &sealed).unwrap(), b"");
    }
}
