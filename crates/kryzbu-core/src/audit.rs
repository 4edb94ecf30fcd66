//! Tamper-evident audit log.
//!
//! Every event becomes one line appended to a plain text file. After each
//! append the HMAC-SHA256 of the whole file, keyed with the server's private
//! key material, is recomputed and stored in the record store under the log
//! file name. Editing the file out of band makes [`AuditLog::verify`] fail.

use crate::crypto::constant_time_eq;
use crate::error::{Error, Result};
use crate::logging::{escape_control, RedactedBytes, ShortHex};
use crate::storage::{LogIntegrityRecord, SharedStore};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Timestamp prefix of every line.
pub const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// Actor recorded for changes the server makes on its own.
pub const LOCAL_ADMIN: &str = "Local_Admin";

/// Outcome attached to an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    /// The operation succeeded.
    Success,
    /// The operation failed with this detail.
    Error(String),
}

impl EventStatus {
    /// Error status from anything displayable.
    pub fn error(detail: impl fmt::Display) -> Self {
        EventStatus::Error(detail.to_string())
    }
}

/// An auditable event and its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent<'a> {
    /// A file was stored.
    Upload {
        /// File name.
        file: &'a str,
        /// Acting user.
        user: &'a str,
    },
    /// A file was served.
    Download {
        /// File name.
        file: &'a str,
        /// Acting user.
        user: &'a str,
    },
    /// A file was removed.
    Delete {
        /// File name.
        file: &'a str,
        /// Acting user.
        user: &'a str,
    },
    /// A user account was created.
    Register {
        /// New user.
        user: &'a str,
    },
    /// A user account was deleted.
    Unregister {
        /// Deleted user.
        user: &'a str,
    },
    /// A request was refused.
    AccessDenied {
        /// What was asked for, e.g. `LOGIN` or `DOWNLOAD;notes.txt`.
        resource: &'a str,
        /// Claimed user.
        user: &'a str,
    },
}

impl AuditEvent<'_> {
    /// Event kind token written after the timestamp.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::Upload { .. } => "UPLOAD",
            AuditEvent::Download { .. } => "DOWNLOAD",
            AuditEvent::Delete { .. } => "DELETE",
            AuditEvent::Register { .. } => "REGISTER",
            AuditEvent::Unregister { .. } => "UNREGISTER",
            AuditEvent::AccessDenied { .. } => "ACCESS_DENIED",
        }
    }

    /// The line body after the timestamp, without the trailing newline.
    pub fn render(&self, status: &EventStatus) -> String {
        let kind = self.kind();
        let clean = escape_control;

        match (self, status) {
            (AuditEvent::Upload { file, user }, EventStatus::Success) => {
                format!("{} User {} uploaded file {}.", kind, clean(user), clean(file))
            }
            (AuditEvent::Upload { file, user }, EventStatus::Error(e)) => format!(
                "{} ERROR User {} failed to upload file {} with error {}.",
                kind,
                clean(user),
                clean(file),
                clean(e)
            ),
            (AuditEvent::Download { file, user }, EventStatus::Success) => {
                format!("{} User {} downloaded file {}.", kind, clean(user), clean(file))
            }
            (AuditEvent::Download { file, user }, EventStatus::Error(e)) => format!(
                "{} ERROR User {} failed to download file {} with error {}.",
                kind,
                clean(user),
                clean(file),
                clean(e)
            ),
            (AuditEvent::Delete { file, user }, EventStatus::Success) => {
                format!("{} User {} deleted file {}.", kind, clean(user), clean(file))
            }
            (AuditEvent::Delete { file, user }, EventStatus::Error(e)) => format!(
                "{} ERROR User {} failed to delete file {} with error {}.",
                kind,
                clean(user),
                clean(file),
                clean(e)
            ),
            (AuditEvent::Register { user }, EventStatus::Success) => {
                format!("{} User {} was registered.", kind, clean(user))
            }
            (AuditEvent::Register { user }, EventStatus::Error(e)) => format!(
                "{} ERROR Failed to register user {} with error {}.",
                kind,
                clean(user),
                clean(e)
            ),
            (AuditEvent::Unregister { user }, EventStatus::Success) => {
                format!("{} User {} was deleted.", kind, clean(user))
            }
            (AuditEvent::Unregister { user }, EventStatus::Error(e)) => format!(
                "{} ERROR Failed to delete user {} with error {}.",
                kind,
                clean(user),
                clean(e)
            ),
            (AuditEvent::AccessDenied { resource, user }, EventStatus::Success) => format!(
                "{} User {} was denied access to {}.",
                kind,
                clean(user),
                clean(resource)
            ),
            (AuditEvent::AccessDenied { resource, user }, EventStatus::Error(e)) => format!(
                "{} ERROR User {} was denied access to {} with error {}.",
                kind,
                clean(user),
                clean(resource),
                clean(e)
            ),
        }
    }
}

/// Append-only event log with a keyed integrity tag.
pub struct AuditLog {
    path: PathBuf,
    file_name: String,
    store: SharedStore,
    secret: Zeroizing<Vec<u8>>,
    /// Serializes append + tag update so a slower writer cannot persist a
    /// tag computed before a faster writer's line.
    write_lock: TokioMutex<()>,
}

impl AuditLog {
    /// Open the log at `path`, keyed with `secret`.
    ///
    /// The parent directory is created; the file itself appears with the
    /// first event.
    pub fn new(path: impl Into<PathBuf>, store: SharedStore, secret: &[u8]) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("bad log path: {}", path.display())))?
            .to_string();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self {
            path,
            file_name,
            store,
            secret: Zeroizing::new(secret.to_vec()),
            write_lock: TokioMutex::new(()),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name under which the integrity tag is stored.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Append one event and refresh the stored integrity tag.
    pub async fn event(&self, event: AuditEvent<'_>, status: EventStatus) -> Result<()> {
        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
        let line = format!("{} {}\n", timestamp, event.render(&status));

        let _guard = self.write_lock.lock().await;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        drop(file);

        let tag = self.compute_tag(&self.path).await?;
        debug!(kind = event.kind(), tag = %ShortHex(&tag), "Audit event recorded");
        self.store.lock().await.upsert_log_tag(&LogIntegrityRecord {
            log_file_name: self.file_name.clone(),
            hmac_tag: tag,
        })?;
        Ok(())
    }

    /// Record an event, reporting but not propagating failures.
    ///
    /// Request handlers use this so a full disk does not turn a served
    /// download into a failed one.
    pub async fn record(&self, event: AuditEvent<'_>, status: EventStatus) {
        if let Err(e) = self.event(event, status).await {
            warn!(kind = event.kind(), error = %e, detail = e.detail(), "Failed to write audit event");
        }
    }

    /// Recompute the tag of `log_file_name` (resolved next to this log)
    /// and compare it with the stored one.
    ///
    /// A missing file or missing tag verifies as `false`.
    pub async fn verify(&self, log_file_name: &str) -> Result<bool> {
        let path = match self.path.parent() {
            Some(dir) => dir.join(log_file_name),
            None => PathBuf::from(log_file_name),
        };

        let _guard = self.write_lock.lock().await;

        let stored = match self.store.lock().await.get_log_tag(log_file_name)? {
            Some(record) => record.hmac_tag,
            None => {
                warn!(log = %log_file_name, "No integrity tag stored");
                return Ok(false);
            }
        };

        if !tokio::fs::try_exists(&path).await? {
            warn!(log = %log_file_name, "Log file missing");
            return Ok(false);
        }

        let actual = self.compute_tag(&path).await?;
        Ok(constant_time_eq(actual.as_bytes(), stored.as_bytes()))
    }

    /// Like [`verify`](Self::verify) for this log, but a mismatch is an
    /// [`Error::Integrity`].
    pub async fn ensure_intact(&self) -> Result<()> {
        if self.verify(&self.file_name).await? {
            Ok(())
        } else {
            Err(Error::Integrity(format!(
                "integrity tag mismatch for {}",
                self.file_name
            )))
        }
    }

    async fn compute_tag(&self, path: &Path) -> Result<String> {
        let contents = tokio::fs::read(path).await?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| Error::Crypto("invalid HMAC key".into()))?;
        mac.update(&contents);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path)
            .field("secret", &RedactedBytes(&self.secret))
            .finish()
    }
}
