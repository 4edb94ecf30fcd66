//! TCP server.
//!
//! One tokio task per accepted connection; tasks share state only through
//! the [`ServerContext`].

mod handler;

pub use handler::{ConnectionHandler, ConnectionState};

use crate::accounts::Accounts;
use crate::audit::AuditLog;
use crate::config::ServerConfig;
use crate::crypto::ServerKeyPair;
use crate::error::{Error, Result};
use crate::index::FileIndex;
use crate::storage::{open_shared, SharedStore};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Everything a connection handler needs.
pub struct ServerContext {
    /// Active configuration.
    pub config: ServerConfig,
    /// RSA pair used by the LOGIN handshake.
    pub keys: ServerKeyPair,
    /// PEM served by GETKEY.
    pub public_pem: String,
    /// Shared record store.
    pub store: SharedStore,
    /// Audit log.
    pub audit: Arc<AuditLog>,
    /// File catalog.
    pub index: FileIndex,
    /// User administration.
    pub accounts: Accounts,
}

impl ServerContext {
    /// Bring up the persisted layout under `config.data_dir`.
    ///
    /// Creates missing folders, loads or generates the RSA pair, opens the
    /// record store and reconciles the file index with the disk.
    pub async fn open(config: ServerConfig) -> Result<Self> {
        config.ensure_dirs()?;

        let private_path = config.private_key_path();
        let public_path = config.public_key_path();
        let bits = config.rsa_bits;
        let keys = tokio::task::spawn_blocking(move || {
            ServerKeyPair::load_or_generate(&private_path, &public_path, bits)
        })
        .await
        .map_err(|e| Error::Crypto(format!("key loading task failed: {}", e)))??;
        let public_pem = keys.public_key().to_pem()?;

        let store = open_shared(&config.store_config())?;
        let audit = Arc::new(AuditLog::new(config.log_file(), store.clone(), keys.hmac_secret())?);
        let index = FileIndex::init(config.storage_dir(), store.clone(), audit.clone()).await?;
        let accounts = Accounts::new(store.clone(), audit.clone());

        Ok(Self {
            config,
            keys,
            public_pem,
            store,
            audit,
            index,
            accounts,
        })
    }
}

/// Accepts connections and hands each to a [`ConnectionHandler`].
pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl Server {
    /// Bind to `context.config.listen_addr`.
    pub async fn bind(context: Arc<ServerContext>) -> Result<Self> {
        let listener = TcpListener::bind(context.config.listen_addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {}: {}", context.config.listen_addr, e)))?;
        Ok(Self { listener, context })
    }

    /// Address actually bound; differs from the configured one for port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes. In-flight connections keep running.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!(address = %addr, "Kryzbu server started");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        debug!(%peer, "New connection");
                        if let Err(e) = ConnectionHandler::new(socket, peer, context).run().await {
                            error!(%peer, error = %e, detail = e.detail(), "Connection failed");
                        }
                    });
                }
            }
        }
    }
}
