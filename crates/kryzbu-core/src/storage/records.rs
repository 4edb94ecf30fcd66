//! Record kinds kept in the store.

use crate::crypto::{PasswordVerifier, SessionKey};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Date format used when a record is shown to a person.
pub const DISPLAY_DATE_FORMAT: &str = "%m/%d/%Y";

/// Credentials of a registered user.
#[derive(Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Unique user name.
    pub username: String,
    /// `SHA-256(salt || password)`.
    pub password_verifier: PasswordVerifier,
    /// Long-lived session key issued at registration.
    pub session_key: SessionKey,
    /// Per-user random salt.
    pub salt: Vec<u8>,
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("username", &self.username)
            .field("password_verifier", &self.password_verifier)
            .field("session_key", &self.session_key)
            .field("salt", &hex::encode(&self.salt))
            .finish()
    }
}

/// Metadata of one stored file.
///
/// Also the element type of the LIST_DIR reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File name, unique per owner.
    pub name: String,
    /// Owning user; also the storage sub-directory.
    pub owner: String,
    /// Upload date.
    pub uploaded: NaiveDate,
    /// Number of served downloads.
    pub downloads: u64,
}

impl FileRecord {
    /// A fresh record dated today with zero downloads.
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            uploaded: chrono::Local::now().date_naive(),
            downloads: 0,
        }
    }

    /// Upload date as `MM/DD/YYYY`.
    pub fn uploaded_display(&self) -> String {
        self.uploaded.format(DISPLAY_DATE_FORMAT).to_string()
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.name,
            self.owner,
            self.uploaded_display(),
            self.downloads
        )
    }
}

/// Stored integrity tag of a log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogIntegrityRecord {
    /// Log file name (not path).
    pub log_file_name: String,
    /// Hex HMAC over the entire file.
    pub hmac_tag: String,
}
