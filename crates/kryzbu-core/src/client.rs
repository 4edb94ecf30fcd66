//! Client side of every exchange.
//!
//! Each call opens its own connection, since the server serves exactly one
//! request per connection.

use crate::config::ClientConfig;
use crate::crypto::{ServerPublicKey, SessionKey};
use crate::error::{Error, Result};
use crate::logging::Redacted;
use crate::protocol::{
    parse_file_header, parse_key_header, read_exact_vec, read_fields, read_line, validate_file_name,
    write_line, write_sized, Command, CommandBody, Reply, GETKEY, LOGIN,
};
use crate::session::{receive_under_session, ClientHandshake, Envelope};
use crate::storage::FileRecord;
use crate::transfer::{receive_exact, send_file};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

type Connection = BufReader<TcpStream>;

/// User name and password for LOGIN.
#[derive(Clone)]
pub struct Credentials {
    /// User name.
    pub username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    /// Pair `username` with `password`.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    /// The password.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &Redacted(()))
            .finish()
    }
}

/// An established session: who we are and the key requests are sealed
/// under.
#[derive(Debug, Clone)]
pub struct Session {
    /// User name sent in every envelope header.
    pub username: String,
    /// Session key delivered by LOGIN.
    pub session_key: SessionKey,
}

impl Session {
    /// Session for `username` under `session_key`.
    pub fn new(username: impl Into<String>, session_key: SessionKey) -> Self {
        Self {
            username: username.into(),
            session_key,
        }
    }
}

/// Server public key as served by GETKEY.
#[derive(Debug, Clone)]
pub struct FetchedKey {
    /// File name the server announced.
    pub file_name: String,
    /// PEM text.
    pub pem: String,
    /// Parsed key.
    pub key: ServerPublicKey,
}

/// Connects to a Kryzbu server.
#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Client for `config.server_addr`.
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.config.timeout, fut)
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn connect(&self) -> Result<Connection> {
        let stream = tokio::time::timeout(self.config.timeout, TcpStream::connect(self.config.server_addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("connect to {} failed: {}", self.config.server_addr, e)))?;
        debug!(server = %self.config.server_addr, "Connected");
        Ok(BufReader::new(stream))
    }

    async fn read_line(&self, conn: &mut Connection) -> Result<String> {
        self.timed(read_line(conn)).await
    }

    /// Wait for the server to close, which it does after its bookkeeping
    /// for the request is done.
    async fn drain(&self, conn: &mut Connection) -> Result<()> {
        let mut rest = Vec::new();
        self.timed(async { conn.read_to_end(&mut rest).await.map_err(Error::from) })
            .await?;
        if !rest.is_empty() {
            warn!(bytes = rest.len(), "Unexpected data before close");
        }
        Ok(())
    }

    /// Fetch the server public key.
    pub async fn get_key(&self) -> Result<FetchedKey> {
        let mut conn = self.connect().await?;
        write_line(&mut conn, GETKEY).await?;

        let line = self.read_line(&mut conn).await?;
        if let Some(reply) = Reply::parse(&line) {
            return Err(reply.into_error("GETKEY"));
        }
        let (file_name, size) = parse_key_header(&line)?;
        let bytes = self.timed(read_exact_vec(&mut conn, size)).await?;
        let pem = String::from_utf8(bytes).map_err(|_| Error::InvalidKey("key is not PEM text".into()))?;
        let key = ServerPublicKey::from_pem(&pem)?;

        info!(file = %file_name, "Server public key received");
        Ok(FetchedKey { file_name, pem, key })
    }

    /// Run the LOGIN handshake and return the session key.
    ///
    /// A wrong password is detected locally when the challenge fails to
    /// verify; the connection is then dropped without a proof.
    pub async fn login(&self, server_key: &ServerPublicKey, credentials: &Credentials) -> Result<SessionKey> {
        let mut handshake = ClientHandshake::new(&credentials.username, credentials.password())?;
        let mut conn = self.connect().await?;

        write_line(&mut conn, LOGIN).await?;
        match Reply::parse(&self.read_line(&mut conn).await?) {
            Some(Reply::Ready) => {}
            Some(reply) => return Err(reply.into_error("LOGIN")),
            None => return Err(Error::Protocol("LOGIN: expected OK;Ready".into())),
        }

        write_sized(&mut conn, &handshake.identity(server_key)?).await?;

        let header = self.read_line(&mut conn).await?;
        if let Some(reply) = Reply::parse(&header) {
            return Err(reply.into_error("LOGIN"));
        }
        let challenge = self.timed(read_fields(&mut conn, &header, 4)).await?;
        let proof = handshake.answer(server_key, &challenge[0], &challenge[1], &challenge[2], &challenge[3])?;

        write_sized(&mut conn, &proof).await?;

        let header = match self.read_line(&mut conn).await {
            Ok(header) => header,
            Err(e) if e.is_disconnect() => {
                return Err(Error::Authentication("server closed the handshake".into()))
            }
            Err(e) => return Err(e),
        };
        if let Some(reply) = Reply::parse(&header) {
            return Err(reply.into_error("LOGIN"));
        }
        let sealed = self.timed(read_fields(&mut conn, &header, 3)).await?;
        let session_key = handshake.session_key(&sealed[0], &sealed[1], &sealed[2])?;

        info!(user = %credentials.username, "Logged in");
        Ok(session_key)
    }

    /// Send an envelope and wait for `OK;Authenticated`.
    async fn request(&self, session: &Session, body: &CommandBody) -> Result<Connection> {
        let envelope = Envelope::seal(&session.username, &session.session_key, body)?;
        let mut conn = self.connect().await?;
        envelope.write_to(&mut conn).await?;

        let context = body.command.token();
        match Reply::parse(&self.read_line(&mut conn).await?) {
            Some(Reply::Authenticated) => Ok(conn),
            Some(reply) => Err(reply.into_error(context)),
            None => Err(Error::Protocol(format!("{}: expected OK;Authenticated", context))),
        }
    }

    /// Upload the file at `path` under its own file name.
    pub async fn upload(&self, session: &Session, path: &Path) -> Result<u64> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Protocol(format!("no usable file name in {}", path.display())))?;
        self.upload_as(session, path, name).await
    }

    /// Upload the file at `path` as `name`.
    ///
    /// Returns once the server has stored and indexed the file.
    pub async fn upload_as(&self, session: &Session, path: &Path, name: &str) -> Result<u64> {
        validate_file_name(name)?;
        if !tokio::fs::metadata(path).await?.is_file() {
            return Err(Error::NotFound(format!("{} is not a file", path.display())));
        }

        let mut conn = self.request(session, &CommandBody::new(Command::Upload, name)).await?;
        let sent = send_file(&mut conn, path, self.config.buffer_size).await?;
        conn.shutdown().await?;

        // The server closes once the upload is indexed.
        self.drain(&mut conn).await?;

        info!(file = %name, bytes = sent, "Upload complete");
        Ok(sent)
    }

    /// Download `name` into `dest_dir`, returning the written path.
    pub async fn download(&self, session: &Session, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        validate_file_name(name)?;
        let mut conn = self.request(session, &CommandBody::new(Command::Download, name)).await?;

        let line = self.read_line(&mut conn).await?;
        if let Some(reply) = Reply::parse(&line) {
            return Err(reply.into_error("DOWNLOAD"));
        }
        let (announced, size) = parse_file_header(&line)?;
        if announced != name {
            return Err(Error::Protocol(format!("asked for {}, server sent {}", name, announced)));
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(name);
        if let Err(e) = receive_exact(&mut conn, &path, size, self.config.buffer_size).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        self.drain(&mut conn).await?;

        info!(file = %name, bytes = size, "Download complete");
        Ok(path)
    }

    /// Delete `name` on the server.
    pub async fn remove(&self, session: &Session, name: &str) -> Result<()> {
        validate_file_name(name)?;
        let mut conn = self.request(session, &CommandBody::new(Command::Remove, name)).await?;

        match Reply::parse(&self.read_line(&mut conn).await?) {
            Some(Reply::FileDeleted(deleted)) if deleted == name => {
                info!(file = %name, "File removed");
                Ok(())
            }
            Some(reply) => Err(reply.into_error("REMOVE")),
            None => Err(Error::Protocol("REMOVE: unexpected reply".into())),
        }
    }

    /// The caller's file records.
    pub async fn list(&self, session: &Session) -> Result<Vec<FileRecord>> {
        let mut conn = self.request(session, &CommandBody::new(Command::ListDir, "")).await?;
        let plaintext = self
            .timed(receive_under_session(&mut conn, &session.session_key))
            .await?;
        Ok(bincode::deserialize(&plaintext)?)
    }
}
