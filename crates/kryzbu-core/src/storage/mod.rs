//! Server-side persistence.
//!
//! A single SQLite file keeps three kinds of records:
//!
//! - users (name, salted password verifier, session key, salt)
//! - the file index (name, owner, upload date, download count)
//! - one HMAC tag per audit log file
//!
//! File contents live on disk under the storage root, one folder per owner;
//! only their metadata is kept here.

mod database;
mod records;
mod schema;

pub use database::RecordStore;
pub use records::{FileRecord, LogIntegrityRecord, UserRecord, DISPLAY_DATE_FORMAT};

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = crate::config::DATABASE_FILE;

/// Record store shared between connection handlers.
pub type SharedStore = Arc<TokioMutex<RecordStore>>;

/// Record store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the database file.
    pub path: PathBuf,
    /// Whether to use in-memory database (for testing).
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DB_NAME),
            in_memory: false,
        }
    }
}

/// Open a store and wrap it for sharing.
pub fn open_shared(config: &StoreConfig) -> crate::Result<SharedStore> {
    Ok(Arc::new(TokioMutex::new(RecordStore::open(config)?)))
}
