//! Catalog of stored files.
//!
//! The index is the authority for ownership and download counts; the
//! storage directory is the authority for existence. [`FileIndex::refresh`]
//! reconciles the two at startup.

use crate::audit::{AuditEvent, AuditLog, EventStatus, LOCAL_ADMIN};
use crate::config::owner_dir;
use crate::error::{Error, Result};
use crate::protocol::validate_file_name;
use crate::storage::{FileRecord, SharedStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Changes made by one [`FileIndex::refresh`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Files found on disk that had no record.
    pub indexed: Vec<(String, String)>,
    /// Records whose file was missing from disk.
    pub dropped: Vec<(String, String)>,
}

impl RefreshReport {
    /// Whether the pass changed nothing.
    pub fn is_empty(&self) -> bool {
        self.indexed.is_empty() && self.dropped.is_empty()
    }
}

/// Per-owner file catalog backed by the record store.
#[derive(Clone)]
pub struct FileIndex {
    store: SharedStore,
    audit: Arc<AuditLog>,
    storage_root: PathBuf,
}

impl FileIndex {
    /// Create the storage root and the table if needed, then reconcile.
    pub async fn init(
        storage_root: impl Into<PathBuf>,
        store: SharedStore,
        audit: Arc<AuditLog>,
    ) -> Result<Self> {
        let storage_root = storage_root.into();
        tokio::fs::create_dir_all(&storage_root).await?;
        store.lock().await.ensure_schema()?;

        let index = Self {
            store,
            audit,
            storage_root,
        };
        let report = index.refresh().await?;
        info!(
            indexed = report.indexed.len(),
            dropped = report.dropped.len(),
            "File index ready"
        );

        Ok(index)
    }

    /// Root folder holding one sub-folder per owner.
    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// On-disk location of `name` owned by `owner`.
    pub fn file_path(&self, owner: &str, name: &str) -> PathBuf {
        owner_dir(&self.storage_root, owner).join(name)
    }

    /// Align the index with the storage directory.
    ///
    /// Files without a record get one, dated today, with a synthetic UPLOAD
    /// event. Records without a file are dropped with a synthetic DELETE
    /// event. A second pass with no changes on disk does nothing.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();

        for (owner, name) in self.scan_disk().await? {
            let inserted = {
                let store = self.store.lock().await;
                if store.get_file(&name, &owner)?.is_some() {
                    false
                } else {
                    store.insert_file(&FileRecord::new(name.as_str(), owner.as_str()))?;
                    true
                }
            };

            if inserted {
                warn!(owner = %owner, file = %name, "File was not indexed, record added");
                self.audit
                    .record(
                        AuditEvent::Upload { file: &name, user: LOCAL_ADMIN },
                        EventStatus::Success,
                    )
                    .await;
                report.indexed.push((owner, name));
            }
        }

        let records = self.store.lock().await.all_files()?;
        for record in records {
            let path = self.file_path(&record.owner, &record.name);
            if tokio::fs::try_exists(&path).await? {
                continue;
            }

            self.store.lock().await.delete_file(&record.name, &record.owner)?;
            warn!(
                owner = %record.owner,
                file = %record.name,
                "File was indexed but missing, record dropped"
            );
            self.audit
                .record(
                    AuditEvent::Delete { file: &record.name, user: LOCAL_ADMIN },
                    EventStatus::Success,
                )
                .await;
            report.dropped.push((record.owner, record.name));
        }

        Ok(report)
    }

    /// `(owner, name)` for every regular file one level below an owner
    /// folder.
    async fn scan_disk(&self) -> Result<Vec<(String, String)>> {
        let mut found = Vec::new();
        let mut owners = tokio::fs::read_dir(&self.storage_root).await?;

        while let Some(owner_entry) = owners.next_entry().await? {
            if !owner_entry.file_type().await?.is_dir() {
                warn!(path = %owner_entry.path().display(), "Ignoring non-directory in storage root");
                continue;
            }
            let owner = match owner_entry.file_name().into_string() {
                Ok(owner) => owner,
                Err(_) => {
                    warn!(path = %owner_entry.path().display(), "Ignoring non UTF-8 owner folder");
                    continue;
                }
            };

            let mut files = tokio::fs::read_dir(owner_entry.path()).await?;
            while let Some(file_entry) = files.next_entry().await? {
                if !file_entry.file_type().await?.is_file() {
                    continue;
                }
                match file_entry.file_name().into_string() {
                    Ok(name) if validate_file_name(&name).is_ok() => {
                        found.push((owner.clone(), name));
                    }
                    _ => {
                        warn!(path = %file_entry.path().display(), "Ignoring unservable file name");
                    }
                }
            }
        }

        found.sort();
        Ok(found)
    }

    /// Record a new upload. An existing (name, owner) pair is left untouched
    /// and `false` is returned.
    pub async fn add(&self, name: &str, owner: &str) -> Result<bool> {
        let store = self.store.lock().await;
        if store.get_file(name, owner)?.is_some() {
            warn!(owner = %owner, file = %name, "File already indexed, keeping existing record");
            return Ok(false);
        }
        store.insert_file(&FileRecord::new(name, owner))?;
        debug!(owner = %owner, file = %name, "File indexed");
        Ok(true)
    }

    /// Count one served download and return the new total.
    pub async fn download(&self, name: &str, owner: &str) -> Result<u64> {
        let store = self.store.lock().await;
        let record = store
            .get_file(name, owner)?
            .ok_or_else(|| Error::NotFound(format!("{} has no file {}", owner, name)))?;
        let downloads = record.downloads.saturating_add(1);
        store.update_downloads(name, owner, downloads)?;
        Ok(downloads)
    }

    /// Drop the record for (name, owner). Returns whether one existed.
    pub async fn delete(&self, name: &str, owner: &str) -> Result<bool> {
        Ok(self.store.lock().await.delete_file(name, owner)? > 0)
    }

    /// Record for (name, owner), if any.
    pub async fn get_record(&self, name: &str, owner: &str) -> Result<Option<FileRecord>> {
        self.store.lock().await.get_file(name, owner)
    }

    /// Whether `owner` has a file called `name`.
    pub async fn user_owns(&self, owner: &str, name: &str) -> Result<bool> {
        Ok(self.get_record(name, owner).await?.is_some())
    }

    /// Every record owned by `owner`.
    pub async fn user_files(&self, owner: &str) -> Result<Vec<FileRecord>> {
        self.store.lock().await.files_by_owner(owner)
    }

    /// Every record.
    pub async fn all(&self) -> Result<Vec<FileRecord>> {
        self.store.lock().await.all_files()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_shared, StoreConfig};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        log_path: PathBuf,
        store: SharedStore,
        audit: Arc<AuditLog>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("files");
        let log_path = dir.path().join("logs").join("kryzbu.log");
        let store = open_shared(&StoreConfig {
            in_memory: true,
            ..Default::default()
        })
        .expect("store");
        let audit = Arc::new(AuditLog::new(&log_path, store.clone(), b"secret").expect("audit"));
        Fixture {
            _dir: dir,
            root,
            log_path,
            store,
            audit,
        }
    }

    fn log_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_add_and_ownership() {
        let f = fixture();
        let index = FileIndex::init(&f.root, f.store.clone(), f.audit.clone())
            .await
            .expect("init");

        assert!(index.add("notes.txt", "alice").await.expect("add"));
        assert!(!index.add("notes.txt", "alice").await.expect("add twice"));
        assert!(index.add("notes.txt", "bob").await.expect("other owner"));

        assert!(index.user_owns("alice", "notes.txt").await.expect("owns"));
        assert!(!index.user_owns("carol", "notes.txt").await.expect("owns"));
        assert_eq!(index.user_files("alice").await.expect("files").len(), 1);
        assert_eq!(index.all().await.expect("all").len(), 2);

        assert!(index.delete("notes.txt", "alice").await.expect("delete"));
        assert!(!index.user_owns("alice", "notes.txt").await.expect("owns"));
        assert!(index.user_owns("bob", "notes.txt").await.expect("owns"));
    }

    #[tokio::test]
    async fn test_download_counter() {
        let f = fixture();
        let index = FileIndex::init(&f.root, f.store.clone(), f.audit.clone())
            .await
            .expect("init");
        index.add("notes.txt", "alice").await.expect("add");

        assert_eq!(index.download("notes.txt", "alice").await.expect("dl"), 1);
        assert_eq!(index.download("notes.txt", "alice").await.expect("dl"), 2);

        let record = index
            .get_record("notes.txt", "alice")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(record.downloads, 2);

        assert!(matches!(
            index.download("missing.txt", "alice").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_reconciles_both_ways() {
        let f = fixture();
        std::fs::create_dir_all(f.root.join("alice")).expect("mkdir");
        std::fs::write(f.root.join("alice").join("stray.txt"), b"x").expect("write");
        std::fs::write(f.root.join("loose.txt"), b"x").expect("write");

        f.store
            .lock()
            .await
            .insert_file(&FileRecord::new("ghost.txt", "bob"))
            .expect("insert");

        let index = FileIndex::init(&f.root, f.store.clone(), f.audit.clone())
            .await
            .expect("init");

        assert!(index.user_owns("alice", "stray.txt").await.expect("owns"));
        assert!(!index.user_owns("bob", "ghost.txt").await.expect("owns"));
        assert_eq!(index.all().await.expect("all").len(), 1);

        let lines = log_lines(&f.log_path);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("UPLOAD User Local_Admin uploaded file stray.txt."));
        assert!(lines[1].ends_with("DELETE User Local_Admin deleted file ghost.txt."));
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let f = fixture();
        std::fs::create_dir_all(f.root.join("alice")).expect("mkdir");
        std::fs::write(f.root.join("alice").join("a.txt"), b"a").expect("write");

        let index = FileIndex::init(&f.root, f.store.clone(), f.audit.clone())
            .await
            .expect("init");
        let before = log_lines(&f.log_path);
        let records = index.all().await.expect("all");

        let report = index.refresh().await.expect("refresh");
        assert!(report.is_empty());
        assert_eq!(log_lines(&f.log_path), before);
        assert_eq!(index.all().await.expect("all"), records);
    }
}
