//! Server RSA key pair and per-user session keys.
//!
//! The RSA pair is the trust anchor of the LOGIN handshake: clients fetch
//! the public half with GETKEY and wrap their nonces with it. The private
//! PEM bytes double as the audit log HMAC secret.

use crate::error::{Error, Result};
use crate::logging::{Redacted, RedactedBytes};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use std::path::Path;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Default RSA modulus size.
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Size of a session key in bytes (AES-128).
pub const SESSION_KEY_SIZE: usize = 16;

/// Public half of the server key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerPublicKey(RsaPublicKey);

impl ServerPublicKey {
    /// Parse a PEM-encoded SubjectPublicKeyInfo.
    pub fn from_pem(pem: &str) -> Result<Self> {
        RsaPublicKey::from_public_key_pem(pem)
            .map(Self)
            .map_err(|e| Error::InvalidKey(format!("bad public key: {}", e)))
    }

    /// Export as PEM, the format served by GETKEY.
    pub fn to_pem(&self) -> Result<String> {
        self.0
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Encoding(format!("public key export failed: {}", e)))
    }

    /// RSA-OAEP(SHA-256) encrypt a short message.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.0
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|_| Error::Crypto("RSA encryption failed".into()))
    }
}

impl fmt::Debug for ServerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerPublicKey(RSA)")
    }
}

/// The server's long-term RSA key pair.
pub struct ServerKeyPair {
    private: RsaPrivateKey,
    public: ServerPublicKey,
    private_pem: Zeroizing<String>,
}

impl ServerKeyPair {
    /// Generate a fresh key pair.
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| Error::Crypto(format!("RSA key generation failed: {}", e)))?;
        Self::from_private(private)
    }

    /// Restore from a PKCS#8 PEM private key.
    pub fn from_private_pem(pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::InvalidKey(format!("bad private key: {}", e)))?;
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self> {
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Encoding(format!("private key export failed: {}", e)))?;
        let public = ServerPublicKey(RsaPublicKey::from(&private));
        Ok(Self {
            private,
            public,
            private_pem,
        })
    }

    /// Load the pair from disk, generating and persisting one if absent.
    ///
    /// The public key file is rewritten from the private key when it is
    /// missing, so a half-deleted pair heals itself.
    pub fn load_or_generate(private_path: &Path, public_path: &Path, bits: usize) -> Result<Self> {
        let keys = if private_path.exists() {
            let pem = Zeroizing::new(std::fs::read_to_string(private_path)?);
            info!(path = ?private_path, "RSA key pair found");
            Self::from_private_pem(&pem)?
        } else {
            info!(bits, "Generating RSA key pair");
            let keys = Self::generate(bits)?;
            if let Some(parent) = private_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_private(private_path, keys.private_pem.as_bytes())?;
            keys
        };

        if !public_path.exists() {
            if let Some(parent) = public_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(public_path, keys.public.to_pem()?)?;
        }

        Ok(keys)
    }

    /// Get the public key.
    pub fn public_key(&self) -> &ServerPublicKey {
        &self.public
    }

    /// RSA-OAEP(SHA-256) decrypt a handshake message.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| Error::Crypto("RSA decryption failed".into()))
    }

    /// Secret used to key the audit log HMAC.
    ///
    /// # Security
    /// Handle with care - this exposes secret key material.
    pub fn hmac_secret(&self) -> &[u8] {
        self.private_pem.as_bytes()
    }
}

/// Write the private key readable by the owner only. It also keys the audit
/// log HMAC.
fn write_private(path: &Path, pem: &[u8]) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    std::io::Write::write_all(&mut file, pem)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

impl fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerKeyPair")
            .field("public", &self.public)
            .field("private", &Redacted(()))
            .finish()
    }
}

/// A user's long-lived AES-128 session key.
///
/// Generated once at registration and never rotated. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Generate a new random session key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a received or stored byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SESSION_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("session key must be 16 bytes".into()))?;
        Ok(Self(bytes))
    }

    /// Parse from the hex form kept in the user store.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(s).map_err(|e| Error::Encoding(format!("bad session key hex: {}", e)))?,
        );
        Self::from_slice(&bytes)
    }

    /// Hex form for persistence.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get the raw bytes.
    ///
    /// # Security
    /// Handle with care - this exposes secret key material.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", RedactedBytes(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BITS: usize = 1024;

    #[test]
    fn test_rsa_roundtrip() {
        let keys = ServerKeyPair::generate(TEST_BITS).expect("generate");
        let ciphertext = keys.public_key().encrypt(b"alice;0123456789abcdef").expect("encrypt");
        let plaintext = keys.decrypt(&ciphertext).expect("decrypt");
        assert_eq!(&plaintext[..], b"alice;0123456789abcdef");
    }

    #[test]
    fn test_rsa_garbage_rejected() {
        let keys = ServerKeyPair::generate(TEST_BITS).expect("generate");
        assert!(keys.decrypt(&[0u8; 128]).is_err());
        assert!(keys.decrypt(b"short").is_err());
    }

    #[test]
    fn test_public_pem_roundtrip() {
        let keys = ServerKeyPair::generate(TEST_BITS).expect("generate");
        let pem = keys.public_key().to_pem().expect("pem");
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));

        let parsed = ServerPublicKey::from_pem(&pem).expect("parse");
        assert_eq!(&parsed, keys.public_key());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let private_path = dir.path().join("keys/priv.pem");
        let public_path = dir.path().join("keys/publ.pem");

        let first = ServerKeyPair::load_or_generate(&private_path, &public_path, TEST_BITS)
            .expect("generate");
        assert!(private_path.exists());
        assert!(public_path.exists());

        let second = ServerKeyPair::load_or_generate(&private_path, &public_path, TEST_BITS)
            .expect("load");
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(first.hmac_secret(), second.hmac_secret());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let private_path = dir.path().join("priv.pem");
        let public_path = dir.path().join("publ.pem");
        ServerKeyPair::load_or_generate(&private_path, &public_path, TEST_BITS).expect("generate");

        let mode = std::fs::metadata(&private_path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_session_key_hex() {
        let key = SessionKey::generate();
        let restored = SessionKey::from_hex(&key.to_hex()).expect("parse");
        assert_eq!(key, restored);

        assert!(SessionKey::from_hex("abcd").is_err());
        assert!(SessionKey::from_hex("zz").is_err());
        assert_eq!(format!("{:?}", key), "SessionKey([16 bytes])");
    }
}
