//! Transport encryption between server and client.
//!
//! One primitive: an anonymous sealed box. Anyone holding a public key can
//! seal to it; only the matching secret key opens it. The primitive gives
//! confidentiality against network observers and nothing else — sender
//! authentication is explicitly not provided.
//!
//! Construction: ephemeral X25519 ECDH, key = SHA-256(shared ‖ eph_pk ‖
//! recipient_pk), ChaCha20-Poly1305 over the payload. Wire layout is
//! `eph_pk(32) ‖ nonce(12) ‖ ciphertext+tag`, hex-encoded where it rides
//! inside JSON.

mod error;
mod keys;
mod sealed;

pub use error::{CryptoError, CryptoResult};
pub use keys::{Keypair, PublicKey, SecretKey, KEY_SIZE};
pub use sealed::{open, open_hex, seal, seal_hex, SEAL_OVERHEAD};
