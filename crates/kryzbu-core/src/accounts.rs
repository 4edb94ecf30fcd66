//! User administration.

use crate::audit::{AuditEvent, AuditLog, EventStatus};
use crate::crypto::{random_bytes, PasswordVerifier, SessionKey, SALT_SIZE};
use crate::error::{Error, Result};
use crate::protocol::validate_username;
use crate::storage::{SharedStore, UserRecord};
use std::sync::Arc;
use tracing::info;

/// Registers and removes users.
///
/// Removing a user leaves their stored files alone.
#[derive(Clone)]
pub struct Accounts {
    store: SharedStore,
    audit: Arc<AuditLog>,
}

impl Accounts {
    /// Accounts backed by `store`, auditing to `audit`.
    pub fn new(store: SharedStore, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Create `username` with a fresh salt and session key.
    pub async fn register(&self, username: &str, password: &str) -> Result<SessionKey> {
        let result = self.insert(username, password).await;

        match &result {
            Ok(_) => {
                info!(user = %username, "User registered");
                self.audit
                    .record(AuditEvent::Register { user: username }, EventStatus::Success)
                    .await;
            }
            Err(e) => {
                self.audit
                    .record(
                        AuditEvent::Register { user: username },
                        EventStatus::error(e.detail()),
                    )
                    .await;
            }
        }

        result
    }

    async fn insert(&self, username: &str, password: &str) -> Result<SessionKey> {
        validate_username(username)?;
        if password.is_empty() {
            return Err(Error::Config("empty password".into()));
        }

        let salt = random_bytes::<SALT_SIZE>().to_vec();
        let record = UserRecord {
            username: username.to_string(),
            password_verifier: PasswordVerifier::derive(password, &salt),
            session_key: SessionKey::generate(),
            salt,
        };

        let store = self.store.lock().await;
        if store.user_exists(username)? {
            return Err(Error::Storage(format!("user {} already exists", username)));
        }
        store.insert_user(&record)?;

        Ok(record.session_key.clone())
    }

    /// Delete `username`. Returns whether the user existed.
    pub async fn unregister(&self, username: &str) -> Result<bool> {
        let removed = self.store.lock().await.delete_user(username)?;

        if removed {
            info!(user = %username, "User deleted");
            self.audit
                .record(AuditEvent::Unregister { user: username }, EventStatus::Success)
                .await;
        } else {
            self.audit
                .record(
                    AuditEvent::Unregister { user: username },
                    EventStatus::error("no such user"),
                )
                .await;
        }

        Ok(removed)
    }

    /// Whether `username` is registered.
    pub async fn name_exists(&self, username: &str) -> Result<bool> {
        self.store.lock().await.user_exists(username)
    }

    /// Credentials of `username`, if registered.
    pub async fn get(&self, username: &str) -> Result<Option<UserRecord>> {
        self.store.lock().await.get_user(username)
    }

    /// All user names.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.store.lock().await.list_usernames()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_shared, StoreConfig};

    fn accounts(dir: &tempfile::TempDir) -> Accounts {
        let store = open_shared(&StoreConfig {
            in_memory: true,
            ..Default::default()
        })
        .expect("store");
        let audit = AuditLog::new(dir.path().join("kryzbu.log"), store.clone(), b"secret")
            .expect("audit");
        Accounts::new(store, Arc::new(audit))
    }

    #[tokio::test]
    async fn test_register_and_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let accounts = accounts(&dir);

        let key = accounts.register("alice", "pw1").await.expect("register");
        assert!(accounts.name_exists("alice").await.expect("exists"));

        let record = accounts.get("alice").await.expect("get").expect("present");
        assert_eq!(record.session_key, key);
        assert_eq!(record.password_verifier, PasswordVerifier::derive("pw1", &record.salt));

        assert!(accounts.unregister("alice").await.expect("delete"));
        assert!(!accounts.name_exists("alice").await.expect("exists"));
        assert!(!accounts.unregister("alice").await.expect("delete again"));

        let log = std::fs::read_to_string(dir.path().join("kryzbu.log")).expect("log");
        assert!(log.contains("REGISTER User alice was registered."));
        assert!(log.contains("UNREGISTER User alice was deleted."));
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let accounts = accounts(&dir);

        accounts.register("alice", "pw1").await.expect("register");
        assert!(accounts.register("alice", "pw2").await.is_err());
        assert!(accounts.register("a;b", "pw").await.is_err());
        assert!(accounts.register("bob", "").await.is_err());

        assert_eq!(accounts.list().await.expect("list"), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_salts_differ() {
        let dir = tempfile::tempdir().expect("tempdir");
        let accounts = accounts(&dir);

        accounts.register("alice", "same").await.expect("register");
        accounts.register("bob", "same").await.expect("register");

        let alice = accounts.get("alice").await.expect("get").expect("present");
        let bob = accounts.get("bob").await.expect("get").expect("present");
        assert_ne!(alice.salt, bob.salt);
        assert_ne!(alice.password_verifier, bob.password_verifier);
        assert_ne!(alice.session_key, bob.session_key);
    }
}
