//! LOGIN handshake.
//!
//! ```text
//! C: LOGIN
//! S: OK;Ready
//! C: RSA(username ; cnonce)
//! S: EAX_v(cnonce ; snonce), salt          v = SHA-256(salt || password)[..16]
//! C: RSA(cnonce ; snonce)
//! S: EAX_v(session_key)                    or ERROR;NotAuthenticatedError
//! ```
//!
//! Both sides are plain state machines over byte messages; the connection
//! handler and the client do the I/O.

use crate::crypto::{
    constant_time_eq, open, random_bytes, seal, PasswordVerifier, Sealed, ServerKeyPair,
    ServerPublicKey, SessionKey, HANDSHAKE_NONCE_SIZE,
};
use crate::error::{Error, Result};
use crate::protocol::validate_username;
use crate::storage::UserRecord;
use std::fmt;
use zeroize::Zeroizing;

type HandshakeNonce = [u8; HANDSHAKE_NONCE_SIZE];

const SEPARATOR: u8 = b';';

/// Server side handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the LOGIN line.
    AwaitLogin,
    /// `OK;Ready` sent.
    SentReady,
    /// Identity message decrypted, waiting for the user lookup.
    AwaitUserNonce,
    /// Challenge sent.
    SentChallenge,
    /// Proof received, being checked.
    AwaitProof,
    /// Proof matched; the session key may be released.
    Authenticated,
    /// Any failure. Terminal.
    Rejected,
}

/// Server challenge: the sealed nonce pair plus the user's salt.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// `EAX_v(cnonce ; snonce)`.
    pub sealed: Sealed,
    /// Salt the client needs to rebuild `v`.
    pub salt: Vec<u8>,
}

impl Challenge {
    /// Wire fields in order: ciphertext, tag, nonce, salt.
    pub fn parts(&self) -> [&[u8]; 4] {
        [
            &self.sealed.ciphertext,
            &self.sealed.tag,
            self.sealed.nonce.as_bytes(),
            &self.salt,
        ]
    }
}

/// `a ; b` with both halves fixed-size nonces.
fn join_nonces(a: &HandshakeNonce, b: &HandshakeNonce) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(2 * HANDSHAKE_NONCE_SIZE + 1));
    out.extend_from_slice(a);
    out.push(SEPARATOR);
    out.extend_from_slice(b);
    out
}

fn split_nonces(bytes: &[u8]) -> Result<(HandshakeNonce, HandshakeNonce)> {
    if bytes.len() != 2 * HANDSHAKE_NONCE_SIZE + 1 || bytes[HANDSHAKE_NONCE_SIZE] != SEPARATOR {
        return Err(Error::Authentication("malformed nonce pair".into()));
    }
    let mut a = [0u8; HANDSHAKE_NONCE_SIZE];
    let mut b = [0u8; HANDSHAKE_NONCE_SIZE];
    a.copy_from_slice(&bytes[..HANDSHAKE_NONCE_SIZE]);
    b.copy_from_slice(&bytes[HANDSHAKE_NONCE_SIZE + 1..]);
    Ok((a, b))
}

/// Server half of one LOGIN exchange.
pub struct ServerHandshake {
    state: HandshakeState,
    username: Option<String>,
    client_nonce: Option<HandshakeNonce>,
    server_nonce: Option<HandshakeNonce>,
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandshake {
    /// Fresh exchange waiting for LOGIN.
    pub fn new() -> Self {
        Self {
            state: HandshakeState::AwaitLogin,
            username: None,
            client_nonce: None,
            server_nonce: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Claimed user name, once the identity message was read.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn require_state(&mut self, state: HandshakeState) -> Result<()> {
        if self.state != state {
            let found = self.state;
            self.state = HandshakeState::Rejected;
            return Err(Error::Protocol(format!(
                "handshake out of order: expected {:?}, in {:?}",
                state, found
            )));
        }
        Ok(())
    }

    fn reject(&mut self, err: Error) -> Error {
        self.state = HandshakeState::Rejected;
        err
    }

    /// LOGIN was received; the caller sends `OK;Ready`.
    pub fn ready(&mut self) -> Result<()> {
        self.require_state(HandshakeState::AwaitLogin)?;
        self.state = HandshakeState::SentReady;
        Ok(())
    }

    /// Decrypt `RSA(username ; cnonce)` and return the claimed user name.
    pub fn receive_identity(&mut self, keys: &ServerKeyPair, blob: &[u8]) -> Result<String> {
        self.require_state(HandshakeState::SentReady)?;

        let plaintext = keys.decrypt(blob).map_err(|e| self.reject(e))?;
        if plaintext.len() < HANDSHAKE_NONCE_SIZE + 2 {
            return Err(self.reject(Error::Authentication("identity message too short".into())));
        }
        let split = plaintext.len() - HANDSHAKE_NONCE_SIZE - 1;
        if plaintext[split] != SEPARATOR {
            return Err(self.reject(Error::Authentication("malformed identity message".into())));
        }

        let username = std::str::from_utf8(&plaintext[..split])
            .map_err(|_| Error::Authentication("user name is not UTF-8".into()))
            .map_err(|e| self.reject(e))?
            .to_string();
        validate_username(&username).map_err(|e| self.reject(e))?;

        let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
        nonce.copy_from_slice(&plaintext[split + 1..]);

        self.username = Some(username.clone());
        self.client_nonce = Some(nonce);
        self.state = HandshakeState::AwaitUserNonce;
        Ok(username)
    }

    /// Build the challenge for the looked-up user.
    ///
    /// `None` means the user does not exist; the exchange is rejected.
    pub fn challenge(&mut self, user: Option<&UserRecord>) -> Result<Challenge> {
        self.require_state(HandshakeState::AwaitUserNonce)?;

        let user = match user {
            Some(user) if Some(user.username.as_str()) == self.username.as_deref() => user,
            _ => return Err(self.reject(Error::Authentication("unknown user".into()))),
        };
        let client_nonce = self
            .client_nonce
            .ok_or_else(|| Error::Protocol("missing client nonce".into()))
            .map_err(|e| self.reject(e))?;

        let server_nonce: HandshakeNonce = random_bytes();
        let key = Zeroizing::new(user.password_verifier.handshake_key());
        let sealed = seal(&key, &join_nonces(&client_nonce, &server_nonce)).map_err(|e| self.reject(e))?;

        self.server_nonce = Some(server_nonce);
        self.state = HandshakeState::SentChallenge;
        Ok(Challenge {
            sealed,
            salt: user.salt.clone(),
        })
    }

    /// Check `RSA(cnonce ; snonce)` against the issued nonces.
    pub fn receive_proof(&mut self, keys: &ServerKeyPair, blob: &[u8]) -> Result<()> {
        self.require_state(HandshakeState::SentChallenge)?;
        self.state = HandshakeState::AwaitProof;

        let plaintext = keys.decrypt(blob).map_err(|e| self.reject(e))?;
        let (client_nonce, server_nonce) = split_nonces(&plaintext).map_err(|e| self.reject(e))?;

        let (expected_client, expected_server) = match (self.client_nonce, self.server_nonce) {
            (Some(c), Some(s)) => (c, s),
            _ => return Err(self.reject(Error::Protocol("missing handshake nonces".into()))),
        };

        if !constant_time_eq(&server_nonce, &expected_server)
            || !constant_time_eq(&client_nonce, &expected_client)
        {
            return Err(self.reject(Error::Authentication("nonce mismatch".into())));
        }

        self.state = HandshakeState::Authenticated;
        Ok(())
    }

    /// Seal the user's session key under `v` for delivery.
    pub fn release_session_key(&self, user: &UserRecord) -> Result<Sealed> {
        if self.state != HandshakeState::Authenticated {
            return Err(Error::Authentication("handshake not complete".into()));
        }
        let key = Zeroizing::new(user.password_verifier.handshake_key());
        seal(&key, user.session_key.as_bytes())
    }
}

impl fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("state", &self.state)
            .field("username", &self.username)
            .finish()
    }
}

/// Client half of one LOGIN exchange.
pub struct ClientHandshake {
    username: String,
    password: Zeroizing<String>,
    client_nonce: HandshakeNonce,
    verifier: Option<PasswordVerifier>,
}

impl ClientHandshake {
    /// Start an exchange for `username` with a fresh client nonce.
    pub fn new(username: &str, password: &str) -> Result<Self> {
        validate_username(username)?;
        Ok(Self {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
            client_nonce: random_bytes(),
            verifier: None,
        })
    }

    /// `RSA(username ; cnonce)`.
    pub fn identity(&self, server_key: &ServerPublicKey) -> Result<Vec<u8>> {
        let mut plaintext = Zeroizing::new(Vec::with_capacity(self.username.len() + 1 + HANDSHAKE_NONCE_SIZE));
        plaintext.extend_from_slice(self.username.as_bytes());
        plaintext.push(SEPARATOR);
        plaintext.extend_from_slice(&self.client_nonce);
        server_key.encrypt(&plaintext)
    }

    /// Open the challenge and produce `RSA(cnonce ; snonce)`.
    ///
    /// A wrong password fails the tag check here.
    pub fn answer(
        &mut self,
        server_key: &ServerPublicKey,
        ciphertext: &[u8],
        tag: &[u8],
        nonce: &[u8],
        salt: &[u8],
    ) -> Result<Vec<u8>> {
        let verifier = PasswordVerifier::derive(&self.password, salt);
        let key = Zeroizing::new(verifier.handshake_key());

        let plaintext = open(&key, ciphertext, tag, nonce)
            .map_err(|_| Error::Authentication("challenge did not verify; wrong password?".into()))?;
        let (client_nonce, server_nonce) = split_nonces(&plaintext)?;
        if !constant_time_eq(&client_nonce, &self.client_nonce) {
            return Err(Error::Authentication("server echoed a different nonce".into()));
        }

        self.verifier = Some(verifier);
        server_key.encrypt(&join_nonces(&client_nonce, &server_nonce))
    }

    /// Open the delivered session key.
    pub fn session_key(&self, ciphertext: &[u8], tag: &[u8], nonce: &[u8]) -> Result<SessionKey> {
        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| Error::Protocol("challenge not answered".into()))?;
        let key = Zeroizing::new(verifier.handshake_key());
        let bytes = open(&key, ciphertext, tag, nonce)?;
        SessionKey::from_slice(&bytes)
    }
}

impl fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandshake")
            .field("username", &self.username)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SALT_SIZE;

    const TEST_BITS: usize = 1024;

    fn user(name: &str, password: &str) -> UserRecord {
        let salt = random_bytes::<SALT_SIZE>().to_vec();
        UserRecord {
            username: name.to_string(),
            password_verifier: PasswordVerifier::derive(password, &salt),
            session_key: SessionKey::generate(),
            salt,
        }
    }

    #[test]
    fn test_full_exchange() {
        let keys = ServerKeyPair::generate(TEST_BITS).expect("keys");
        let alice = user("alice", "pw1");

        let mut server = ServerHandshake::new();
        server.ready().expect("ready");

        let mut client = ClientHandshake::new("alice", "pw1").expect("client");
        let identity = client.identity(keys.public_key()).expect("identity");

        assert_eq!(server.receive_identity(&keys, &identity).expect("identity"), "alice");
        let challenge = server.challenge(Some(&alice)).expect("challenge");
        assert_eq!(server.state(), HandshakeState::SentChallenge);

        let [c, t, n, s] = challenge.parts();
        let proof = client.answer(keys.public_key(), c, t, n, s).expect("answer");

        server.receive_proof(&keys, &proof).expect("proof");
        assert_eq!(server.state(), HandshakeState::Authenticated);

        let sealed = server.release_session_key(&alice).expect("release");
        let session_key = client
            .session_key(&sealed.ciphertext, &sealed.tag, sealed.nonce.as_bytes())
            .expect("session key");
        assert_eq!(session_key, alice.session_key);
    }

    #[test]
    fn test_wrong_password_fails_at_challenge() {
        let keys = ServerKeyPair::generate(TEST_BITS).expect("keys");
        let alice = user("alice", "pw1");

        let mut server = ServerHandshake::new();
        server.ready().expect("ready");
        let mut client = ClientHandshake::new("alice", "wrong").expect("client");

        let identity = client.identity(keys.public_key()).expect("identity");
        server.receive_identity(&keys, &identity).expect("identity");
        let challenge = server.challenge(Some(&alice)).expect("challenge");

        let [c, t, n, s] = challenge.parts();
        let err = client.answer(keys.public_key(), c, t, n, s).expect_err("must fail");
        assert!(err.is_auth_failure());
    }

    #[test]
    fn test_unknown_user_rejected() {
        let keys = ServerKeyPair::generate(TEST_BITS).expect("keys");
        let mut server = ServerHandshake::new();
        server.ready().expect("ready");

        let client = ClientHandshake::new("ghost", "pw").expect("client");
        let identity = client.identity(keys.public_key()).expect("identity");
        server.receive_identity(&keys, &identity).expect("identity");

        assert!(server.challenge(None).expect_err("unknown").is_auth_failure());
        assert_eq!(server.state(), HandshakeState::Rejected);
    }

    #[test]
    fn test_forged_proof_rejected() {
        let keys = ServerKeyPair::generate(TEST_BITS).expect("keys");
        let alice = user("alice", "pw1");

        let mut server = ServerHandshake::new();
        server.ready().expect("ready");
        let client = ClientHandshake::new("alice", "pw1").expect("client");
        let identity = client.identity(keys.public_key()).expect("identity");
        server.receive_identity(&keys, &identity).expect("identity");
        server.challenge(Some(&alice)).expect("challenge");

        let forged = keys
            .public_key()
            .encrypt(&join_nonces(&[1u8; HANDSHAKE_NONCE_SIZE], &[2u8; HANDSHAKE_NONCE_SIZE]))
            .expect("encrypt");
        assert!(server.receive_proof(&keys, &forged).expect_err("forged").is_auth_failure());
        assert!(server.release_session_key(&alice).is_err());
    }

    #[test]
    fn test_garbage_identity_rejected() {
        let keys = ServerKeyPair::generate(TEST_BITS).expect("keys");
        let mut server = ServerHandshake::new();
        server.ready().expect("ready");

        assert!(server.receive_identity(&keys, b"not rsa").is_err());
        assert_eq!(server.state(), HandshakeState::Rejected);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let keys = ServerKeyPair::generate(TEST_BITS).expect("keys");
        let mut server = ServerHandshake::new();
        assert!(matches!(
            server.receive_identity(&keys, b"x"),
            Err(Error::Protocol(_))
        ));
        assert_eq!(server.state(), HandshakeState::Rejected);
    }

    #[test]
    fn test_nonce_pair_layout() {
        let joined = join_nonces(&[1u8; 16], &[2u8; 16]);
        assert_eq!(joined.len(), 33);
        assert_eq!(joined[16], b';');
        assert_eq!(split_nonces(&joined).expect("split"), ([1u8; 16], [2u8; 16]));
        assert!(split_nonces(&joined[..32]).is_err());
    }
}
