//! Cryptographic primitives for Kryzbu.
//!
//! - **RSA-OAEP (SHA-256)**: wraps handshake nonces to the server key
//! - **AES-128-EAX**: handshake challenge, session key delivery and the
//!   per-request envelope
//! - **SHA-256**: salted password verifier
//! - **HMAC-SHA256**: audit log integrity tag
//!
//! ## Known weaknesses
//!
//! The password verifier is a single salted SHA-256 digest, and its first
//! 16 bytes are used directly as the AES key for the handshake challenge.
//! There is no KDF stretching and no forward secrecy: anyone who learns the
//! stored verifier can complete a LOGIN and recover the session key. This is
//! the wire-compatible behavior of the protocol and is kept as is.

mod aead;
mod keys;

pub use aead::{open, seal, Nonce, Sealed, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use keys::{ServerKeyPair, ServerPublicKey, SessionKey, DEFAULT_RSA_BITS, SESSION_KEY_SIZE};

use crate::error::{Error, Result};
use crate::logging::RedactedBytes;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Salt size for password verifiers.
pub const SALT_SIZE: usize = 16;

/// Size of a handshake nonce.
pub const HANDSHAKE_NONCE_SIZE: usize = 16;

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// Constant-time comparison of byte slices.
///
/// Prevents timing attacks when comparing secrets.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Salted password digest stored for every user.
///
/// `SHA-256(salt || password)`. The server never sees the password after
/// registration; both sides recompute this value and use it as the
/// handshake key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PasswordVerifier([u8; 32]);

impl PasswordVerifier {
    /// Derive the verifier for `password` under `salt`.
    pub fn derive(password: &str, salt: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Parse from the hex form kept in the user store.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Encoding(format!("bad verifier hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Encoding("verifier must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    /// Hex form for persistence.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// AES-128 key for the handshake: the digest truncated to 16 bytes.
    pub fn handshake_key(&self) -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&self.0[..KEY_SIZE]);
        key
    }
}

impl fmt::Debug for PasswordVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PasswordVerifier({})", RedactedBytes(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let a: [u8; 16] = random_bytes();
        let b: [u8; 16] = random_bytes();
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hi"));
    }

    #[test]
    fn test_verifier_is_salted() {
        let salt_a = [1u8; SALT_SIZE];
        let salt_b = [2u8; SALT_SIZE];

        let v1 = PasswordVerifier::derive("pw1", &salt_a);
        let v2 = PasswordVerifier::derive("pw1", &salt_a);
        let v3 = PasswordVerifier::derive("pw1", &salt_b);
        let v4 = PasswordVerifier::derive("pw2", &salt_a);

        assert_eq!(v1, v2);
        assert_ne!(v1, v3);
        assert_ne!(v1, v4);
    }

    #[test]
    fn test_verifier_hex_and_key() {
        let verifier = PasswordVerifier::derive("pw1", b"salt");
        let hex_form = verifier.to_hex();
        assert_eq!(hex_form.len(), 64);

        let restored = PasswordVerifier::from_hex(&hex_form).expect("parse");
        assert_eq!(restored, verifier);

        let key = verifier.handshake_key();
        assert_eq!(hex::encode(key), hex_form[..32]);
    }
}
