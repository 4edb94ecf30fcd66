//! Database schema definitions.

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create the database schema.
///
/// Every statement is idempotent; running it against an existing store
/// recreates only what is missing.
pub const CREATE_SCHEMA: &str = r#"
-- Registered users
CREATE TABLE IF NOT EXISTS users (
    username TEXT PRIMARY KEY,
    password_verifier TEXT NOT NULL,
    session_key TEXT NOT NULL,
    salt TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Stored file metadata; (name, owner) uniqueness is enforced by the index layer
CREATE TABLE IF NOT EXISTS file_index (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    owner TEXT NOT NULL,
    uploaded TEXT NOT NULL,
    downloads INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_file_index_owner ON file_index(owner);
CREATE INDEX IF NOT EXISTS idx_file_index_name_owner ON file_index(name, owner);

-- One integrity tag per audit log file
CREATE TABLE IF NOT EXISTS log_integrity (
    log_file_name TEXT PRIMARY KEY,
    hmac_tag TEXT NOT NULL
);

-- Settings table
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);

-- Schema version
INSERT OR REPLACE INTO settings (key, value) VALUES ('schema_version', ?);
"#;

/// SQL to check if tables exist.
pub const CHECK_TABLES: &str = r#"
SELECT COUNT(*) FROM sqlite_master
WHERE type='table' AND name IN ('users', 'file_index', 'log_integrity', 'settings');
"#;

/// Number of tables [`CHECK_TABLES`] expects.
pub const TABLE_COUNT: i64 = 4;
