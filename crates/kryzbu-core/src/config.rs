//! Server and client configuration.
//!
//! Everything that used to be a module-level constant in a deployment
//! (address, folders, buffer size) is carried in these structs and handed to
//! constructors at startup.

use crate::crypto::DEFAULT_RSA_BITS;
use crate::error::Result;
use crate::storage::StoreConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default server port.
pub const DEFAULT_PORT: u16 = 60606;

/// Default server data directory, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = "server/_data";

/// Chunk size for bulk file transfer.
pub const TRANSFER_BUFFER_SIZE: usize = 4096;

/// Name of the audit log file inside `logs/`.
pub const LOG_FILE_NAME: &str = "kryzbu.log";

/// Private key file inside `keys/`.
pub const PRIVATE_KEY_FILE: &str = "priv.pem";

/// Public key file inside `keys/`. This name is sent to clients by GETKEY.
pub const PUBLIC_KEY_FILE: &str = "publ.pem";

/// Record store file.
pub const DATABASE_FILE: &str = "kryzbu.db";

/// Client read timeout.
pub const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 30;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to accept connections on.
    pub listen_addr: SocketAddr,
    /// Root of the persisted layout (files, logs, keys, database).
    pub data_dir: PathBuf,
    /// RSA modulus size used when a key pair has to be generated.
    pub rsa_bits: usize,
    /// Transfer chunk size.
    pub buffer_size: usize,
    /// Drop a connection whose peer stays silent this long while a control
    /// message is expected. File bodies are not covered. `None` waits
    /// forever, which lets an idle client pin a handler task.
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            rsa_bits: DEFAULT_RSA_BITS,
            buffer_size: TRANSFER_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

impl ServerConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Per-owner file storage root.
    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }

    /// Directory holding the audit log.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Audit log path.
    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join(LOG_FILE_NAME)
    }

    /// Directory holding the RSA pair.
    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    /// RSA private key path.
    pub fn private_key_path(&self) -> PathBuf {
        self.keys_dir().join(PRIVATE_KEY_FILE)
    }

    /// RSA public key path.
    pub fn public_key_path(&self) -> PathBuf {
        self.keys_dir().join(PUBLIC_KEY_FILE)
    }

    /// Record store path.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Record store configuration for this layout.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.database_path(),
            in_memory: false,
        }
    }

    /// Create the folder structure. Existing folders are left alone.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.storage_dir(), self.log_dir(), self.keys_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address.
    pub server_addr: SocketAddr,
    /// Applied to connect and to every read; a server that goes quiet
    /// (for example after rejecting a LOGIN proof) fails the call instead of
    /// hanging it.
    pub timeout: Duration,
    /// Transfer chunk size.
    pub buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            timeout: Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECS),
            buffer_size: TRANSFER_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Default configuration pointed at `server_addr`.
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            ..Self::default()
        }
    }
}

/// Owner directory for `owner` below `storage_root`.
pub fn owner_dir(storage_root: &Path, owner: &str) -> PathBuf {
    storage_root.join(owner)
}
