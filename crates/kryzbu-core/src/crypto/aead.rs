//! Authenticated encryption using AES-128 in EAX mode.
//!
//! Every encrypted message on the wire carries its ciphertext, tag and nonce
//! as separate length-prefixed fields, so this module works with detached
//! tags rather than the usual `ciphertext || tag` concatenation.

use crate::error::{Error, Result};
use aes::Aes128;
use eax::aead::{AeadInPlace, Key, KeyInit, Nonce as EaxNonce, Tag};
use eax::Eax;
use rand::RngCore;
use zeroize::Zeroizing;

type Cipher = Eax<Aes128>;

/// Size of encryption key in bytes (128 bits).
pub const KEY_SIZE: usize = 16;

/// Size of nonce in bytes (128 bits).
pub const NONCE_SIZE: usize = 16;

/// Size of authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// A nonce for EAX encryption.
///
/// Drawn fresh from the OS RNG for every message. Session keys are
/// long-lived, so nonces must never be derived from a counter that could
/// reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a new random nonce.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a nonce received from the peer.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; NONCE_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("invalid nonce length".into()))?;
        Ok(Self(bytes))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl From<[u8; NONCE_SIZE]> for Nonce {
    fn from(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }
}

/// Output of [`seal`]: the three fields that travel on the wire.
#[derive(Debug, Clone)]
pub struct Sealed {
    /// Encrypted payload, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// Detached authentication tag.
    pub tag: [u8; TAG_SIZE],
    /// Nonce the payload was encrypted under.
    pub nonce: Nonce,
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Sealed> {
    let nonce = Nonce::random();
    let cipher = Cipher::new(Key::<Cipher>::from_slice(key));

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(EaxNonce::<Cipher>::from_slice(nonce.as_bytes()), b"", &mut buffer)
        .map_err(|_| Error::Crypto("encryption failed".into()))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);

    Ok(Sealed {
        ciphertext: buffer,
        tag: tag_bytes,
        nonce,
    })
}

/// Decrypt and verify a message produced by [`seal`].
///
/// # Security
///
/// Returns a generic error on failure to prevent oracle attacks.
pub fn open(
    key: &[u8; KEY_SIZE],
    ciphertext: &[u8],
    tag: &[u8],
    nonce: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if tag.len() != TAG_SIZE {
        return Err(Error::Crypto("invalid tag length".into()));
    }
    let nonce = Nonce::from_slice(nonce)?;
    let cipher = Cipher::new(Key::<Cipher>::from_slice(key));

    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            EaxNonce::<Cipher>::from_slice(nonce.as_bytes()),
            b"",
            buffer.as_mut(),
            Tag::<Cipher>::from_slice(tag),
        )
        .map_err(|_| Error::Crypto("decryption failed".into()))?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = [42u8; KEY_SIZE];
        let plaintext = b"UPLOAD;notes.txt";

        let sealed = seal(&key, plaintext).expect("seal");
        assert_eq!(sealed.ciphertext.len(), plaintext.len());
        assert_ne!(&sealed.ciphertext[..], &plaintext[..]);

        let opened = open(&key, &sealed.ciphertext, &sealed.tag, sealed.nonce.as_bytes())
            .expect("open");
        assert_eq!(&opened[..], plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&[1u8; KEY_SIZE], b"secret").expect("seal");
        let result = open(&[2u8; KEY_SIZE], &sealed.ciphertext, &sealed.tag, sealed.nonce.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_SIZE];
        let mut sealed = seal(&key, b"secret").expect("seal");
        sealed.ciphertext[0] ^= 0xFF;

        assert!(open(&key, &sealed.ciphertext, &sealed.tag, sealed.nonce.as_bytes()).is_err());
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = [42u8; KEY_SIZE];
        let mut sealed = seal(&key, b"secret").expect("seal");
        sealed.tag[TAG_SIZE - 1] ^= 0x01;

        assert!(open(&key, &sealed.ciphertext, &sealed.tag, sealed.nonce.as_bytes()).is_err());
    }

    #[test]
    fn test_bad_field_lengths_rejected() {
        let key = [42u8; KEY_SIZE];
        let sealed = seal(&key, b"secret").expect("seal");

        assert!(open(&key, &sealed.ciphertext, &sealed.tag[..8], sealed.nonce.as_bytes()).is_err());
        assert!(open(&key, &sealed.ciphertext, &sealed.tag, &[0u8; 12]).is_err());
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let key = [42u8; KEY_SIZE];
        let a = seal(&key, b"same").expect("seal");
        let b = seal(&key, b"same").expect("seal");
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [42u8; KEY_SIZE];
        let sealed = seal(&key, b"").expect("seal");
        assert!(sealed.ciphertext.is_empty());

        let opened = open(&key, &sealed.ciphertext, &sealed.tag, sealed.nonce.as_bytes())
            .expect("open");
        assert!(opened.is_empty());
    }
}
