//! SQLite record store.

use super::records::{FileRecord, LogIntegrityRecord, UserRecord};
use super::schema::{CHECK_TABLES, CREATE_SCHEMA, SCHEMA_VERSION, TABLE_COUNT};
use super::StoreConfig;
use crate::crypto::{PasswordVerifier, SessionKey};
use crate::error::{Error, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

/// Column format of `file_index.uploaded`.
const STORED_DATE_FORMAT: &str = "%Y-%m-%d";

/// Handle on the record store.
///
/// Holds users, the file index and the audit log integrity tags. Callers
/// that need a read-then-write sequence to be atomic must hold the
/// surrounding [`super::SharedStore`] lock for the whole sequence.
pub struct RecordStore {
    conn: Connection,
}

impl RecordStore {
    /// Open or create the record store and make sure its tables exist.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let conn = if config.in_memory {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = config.path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Storage(format!("failed to create directory: {}", e)))?;
            }

            Connection::open_with_flags(
                &config.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        }
        .map_err(|e| Error::Storage(format!("failed to open database: {}", e)))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = DELETE;
            PRAGMA secure_delete = ON;
            PRAGMA temp_store = MEMORY;
            "#,
        )
        .map_err(|e| Error::Storage(format!("failed to set pragmas: {}", e)))?;

        let store = Self { conn };
        store.ensure_schema()?;

        Ok(store)
    }

    /// Create any missing table. Safe to call repeatedly.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(&CREATE_SCHEMA.replace('?', &SCHEMA_VERSION.to_string()))
            .map_err(|e| Error::Storage(format!("failed to create schema: {}", e)))?;
        Ok(())
    }

    /// Whether every expected table is present.
    pub fn has_schema(&self) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(CHECK_TABLES, [], |row| row.get(0))
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(count == TABLE_COUNT)
    }

    // ---- users ----

    /// Insert a new user. Fails if the name is taken.
    pub fn insert_user(&self, user: &UserRecord) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        self.conn
            .execute(
                "INSERT INTO users (username, password_verifier, session_key, salt, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    user.username,
                    user.password_verifier.to_hex(),
                    user.session_key.to_hex(),
                    hex::encode(&user.salt),
                    now
                ],
            )
            .map_err(|e| Error::Storage(format!("failed to insert user: {}", e)))?;

        Ok(())
    }

    /// Load a user by name.
    pub fn get_user(&self, username: &str) -> Result<Option<UserRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT username, password_verifier, session_key, salt FROM users WHERE username = ?",
                params![username],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::Storage(e.to_string()))?;

        match row {
            Some((username, verifier, session_key, salt)) => Ok(Some(UserRecord {
                username,
                password_verifier: PasswordVerifier::from_hex(&verifier)?,
                session_key: SessionKey::from_hex(&session_key)?,
                salt: hex::decode(salt)
                    .map_err(|e| Error::Encoding(format!("bad salt hex: {}", e)))?,
            })),
            None => Ok(None),
        }
    }

    /// Whether a user with this name exists.
    pub fn user_exists(&self, username: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE username = ?",
                params![username],
                |row| row.get(0),
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(count > 0)
    }

    /// Remove a user. Returns whether a row was deleted.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM users WHERE username = ?", params![username])
            .map_err(|e| Error::Storage(format!("failed to delete user: {}", e)))?;
        Ok(rows > 0)
    }

    /// All user names, sorted.
    pub fn list_usernames(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT username FROM users ORDER BY username")
            .map_err(|e| Error::Storage(e.to_string()))?;

        let names = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| Error::Storage(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(names)
    }

    // ---- file index ----

    /// Append a file record. Uniqueness of (name, owner) is the caller's job.
    pub fn insert_file(&self, record: &FileRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO file_index (name, owner, uploaded, downloads) VALUES (?, ?, ?, ?)",
                params![
                    record.name,
                    record.owner,
                    record.uploaded.format(STORED_DATE_FORMAT).to_string(),
                    record.downloads as i64
                ],
            )
            .map_err(|e| Error::Storage(format!("failed to insert file record: {}", e)))?;
        Ok(())
    }

    /// Load the record for `name` owned by `owner`.
    pub fn get_file(&self, name: &str, owner: &str) -> Result<Option<FileRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, owner, uploaded, downloads FROM file_index
                 WHERE name = ? AND owner = ? ORDER BY id LIMIT 1",
            )
            .map_err(|e| Error::Storage(e.to_string()))?;

        let result = stmt.query_row(params![name, owner], file_row);

        match result {
            Ok(record) => Ok(Some(record?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    /// Every record owned by `owner`, in insertion order.
    pub fn files_by_owner(&self, owner: &str) -> Result<Vec<FileRecord>> {
        self.query_files(
            "SELECT name, owner, uploaded, downloads FROM file_index WHERE owner = ? ORDER BY id",
            params![owner],
        )
    }

    /// Every record, in insertion order.
    pub fn all_files(&self) -> Result<Vec<FileRecord>> {
        self.query_files(
            "SELECT name, owner, uploaded, downloads FROM file_index ORDER BY id",
            [],
        )
    }

    /// Remove all records for (name, owner). Returns the number removed.
    pub fn delete_file(&self, name: &str, owner: &str) -> Result<usize> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM file_index WHERE name = ? AND owner = ?",
                params![name, owner],
            )
            .map_err(|e| Error::Storage(format!("failed to delete file record: {}", e)))?;
        Ok(rows)
    }

    /// Set the download counter of (name, owner).
    pub fn update_downloads(&self, name: &str, owner: &str, downloads: u64) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE file_index SET downloads = ? WHERE name = ? AND owner = ?",
                params![downloads as i64, name, owner],
            )
            .map_err(|e| Error::Storage(format!("failed to update downloads: {}", e)))?;
        Ok(rows > 0)
    }

    fn query_files<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<FileRecord>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| Error::Storage(e.to_string()))?;

        let rows = stmt
            .query_map(params, file_row)
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| Error::Storage(e.to_string()))??);
        }
        Ok(records)
    }

    // ---- log integrity ----

    /// Store the integrity tag for a log file, replacing any previous one.
    pub fn upsert_log_tag(&self, record: &LogIntegrityRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO log_integrity (log_file_name, hmac_tag) VALUES (?, ?)",
                params![record.log_file_name, record.hmac_tag],
            )
            .map_err(|e| Error::Storage(format!("failed to store log tag: {}", e)))?;
        Ok(())
    }

    /// Load the integrity tag for a log file.
    pub fn get_log_tag(&self, log_file_name: &str) -> Result<Option<LogIntegrityRecord>> {
        let tag: Option<String> = self
            .conn
            .query_row(
                "SELECT hmac_tag FROM log_integrity WHERE log_file_name = ?",
                params![log_file_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(tag.map(|hmac_tag| LogIntegrityRecord {
            log_file_name: log_file_name.to_string(),
            hmac_tag,
        }))
    }

    // ---- settings ----

    /// Set a setting value.
    pub fn set_setting(&self, key: &str, value: &[u8]) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
                params![key, value],
            )
            .map_err(|e| Error::Storage(format!("failed to set setting: {}", e)))?;
        Ok(())
    }

    /// Get a setting value.
    pub fn get_setting(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Storage(e.to_string()))
    }
}

/// Map a `file_index` row. The inner result carries date parse failures.
fn file_row(row: &Row<'_>) -> rusqlite::Result<Result<FileRecord>> {
    let name: String = row.get(0)?;
    let owner: String = row.get(1)?;
    let uploaded: String = row.get(2)?;
    let downloads: i64 = row.get(3)?;

    Ok(NaiveDate::parse_from_str(&uploaded, STORED_DATE_FORMAT)
        .map_err(|e| Error::Storage(format!("bad upload date '{}': {}", uploaded, e)))
        .map(|uploaded| FileRecord {
            name,
            owner,
            uploaded,
            downloads: downloads.max(0) as u64,
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> RecordStore {
        let config = StoreConfig {
            in_memory: true,
            ..Default::default()
        };
        RecordStore::open(&config).expect("Failed to open test store")
    }

    fn test_user(name: &str) -> UserRecord {
        let salt = b"0123456789abcdef".to_vec();
        UserRecord {
            username: name.to_string(),
            password_verifier: PasswordVerifier::derive("pw1", &salt),
            session_key: SessionKey::generate(),
            salt,
        }
    }

    #[test]
    fn test_schema_is_idempotent() {
        let store = test_store();
        assert!(store.has_schema().expect("check"));
        store.ensure_schema().expect("second run");
        assert!(store.has_schema().expect("check"));
    }

    #[test]
    fn test_user_roundtrip() {
        let store = test_store();
        let user = test_user("alice");

        store.insert_user(&user).expect("insert");
        assert!(store.user_exists("alice").expect("exists"));
        assert!(!store.user_exists("bob").expect("exists"));

        let loaded = store.get_user("alice").expect("get").expect("present");
        assert_eq!(loaded, user);

        assert!(store.get_user("bob").expect("get").is_none());
    }

    #[test]
    fn test_duplicate_user_rejected() {
        let store = test_store();
        store.insert_user(&test_user("alice")).expect("insert");
        assert!(store.insert_user(&test_user("alice")).is_err());
    }

    #[test]
    fn test_delete_user() {
        let store = test_store();
        store.insert_user(&test_user("alice")).expect("insert");
        store.insert_user(&test_user("bob")).expect("insert");

        assert_eq!(store.list_usernames().expect("list"), vec!["alice", "bob"]);
        assert!(store.delete_user("alice").expect("delete"));
        assert!(!store.delete_user("alice").expect("delete again"));
        assert_eq!(store.list_usernames().expect("list"), vec!["bob"]);
    }

    #[test]
    fn test_file_records() {
        let store = test_store();
        let uploaded = NaiveDate::from_ymd_opt(2026, 1, 2).expect("date");
        let record = FileRecord {
            name: "notes.txt".into(),
            owner: "alice".into(),
            uploaded,
            downloads: 0,
        };
        store.insert_file(&record).expect("insert");
        store
            .insert_file(&FileRecord::new("other.txt", "bob"))
            .expect("insert");

        let loaded = store.get_file("notes.txt", "alice").expect("get").expect("present");
        assert_eq!(loaded, record);
        assert!(store.get_file("notes.txt", "bob").expect("get").is_none());

        assert!(store.update_downloads("notes.txt", "alice", 4).expect("update"));
        let loaded = store.get_file("notes.txt", "alice").expect("get").expect("present");
        assert_eq!(loaded.downloads, 4);

        assert_eq!(store.files_by_owner("alice").expect("owner").len(), 1);
        assert_eq!(store.all_files().expect("all").len(), 2);

        assert_eq!(store.delete_file("notes.txt", "alice").expect("delete"), 1);
        assert_eq!(store.delete_file("notes.txt", "alice").expect("delete"), 0);
        assert_eq!(store.all_files().expect("all").len(), 1);
    }

    #[test]
    fn test_log_tag_upsert() {
        let store = test_store();
        assert!(store.get_log_tag("kryzbu.log").expect("get").is_none());

        for tag in ["aa", "bb"] {
            store
                .upsert_log_tag(&LogIntegrityRecord {
                    log_file_name: "kryzbu.log".into(),
                    hmac_tag: tag.into(),
                })
                .expect("upsert");
        }

        let record = store.get_log_tag("kryzbu.log").expect("get").expect("present");
        assert_eq!(record.hmac_tag, "bb");
    }

    #[test]
    fn test_settings() {
        let store = test_store();
        store.set_setting("download_folder", b"/tmp").expect("set");
        assert_eq!(
            store.get_setting("download_folder").expect("get"),
            Some(b"/tmp".to_vec())
        );
        assert!(store.get_setting("missing").expect("get").is_none());
    }

    #[test]
    fn test_reopen_file_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StoreConfig {
            path: dir.path().join("nested").join("kryzbu.db"),
            in_memory: false,
        };

        {
            let store = RecordStore::open(&config).expect("open");
            store.insert_user(&test_user("alice")).expect("insert");
        }

        let store = RecordStore::open(&config).expect("reopen");
        assert!(store.user_exists("alice").expect("exists"));
    }
}
