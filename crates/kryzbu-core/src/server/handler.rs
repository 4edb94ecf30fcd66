//! Per-connection request handling.

use super::ServerContext;
use crate::audit::{AuditEvent, EventStatus};
use crate::config::{owner_dir, PUBLIC_KEY_FILE};
use crate::error::{Error, Result};
use crate::logging::sanitize_for_log;
use crate::protocol::{
    format_file_header, format_key_header, read_line, read_sized, send_reply, send_with_body,
    write_line, write_parts, Command, CommandBody, EnvelopeHeader, Reply, Request,
};
use crate::session::{send_under_session, write_sealed, Envelope, ServerHandshake};
use crate::storage::UserRecord;
use crate::transfer::{receive_to_end, send_file};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Resource recorded when an envelope cannot be opened at all.
const OPAQUE_REQUEST: &str = "REQUEST";

/// Lifecycle of a connection. One request per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, nothing read yet.
    Connected,
    /// First line read.
    RequestRead,
    /// Handling GETKEY or LOGIN.
    UnauthCommand,
    /// Envelope received, checking it.
    AuthRequired,
    /// Envelope accepted, command running.
    Dispatched,
    /// Final reply written.
    ResponseSent,
    /// Connection closed.
    Closed,
}

async fn with_idle_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout)?,
        None => fut.await,
    }
}

/// Serves exactly one request on one stream.
pub struct ConnectionHandler<S> {
    stream: BufReader<S>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    state: ConnectionState,
    idle_timeout: Option<Duration>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an accepted stream.
    pub fn new(stream: S, peer: SocketAddr, ctx: Arc<ServerContext>) -> Self {
        let idle_timeout = ctx.config.idle_timeout;
        Self {
            stream: BufReader::new(stream),
            peer,
            ctx,
            state: ConnectionState::Connected,
            idle_timeout,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handle the request and close the stream.
    ///
    /// Peer disconnects and timeouts end the connection quietly; only
    /// server-side failures are returned.
    pub async fn run(mut self) -> Result<()> {
        let result = self.handle().await;

        let _ = self.stream.shutdown().await;
        self.state = ConnectionState::Closed;

        match result {
            Err(e) if e.is_disconnect() => {
                debug!(peer = %self.peer, detail = e.detail(), "Peer went away");
                Ok(())
            }
            other => other,
        }
    }

    async fn handle(&mut self) -> Result<()> {
        let line = with_idle_timeout(self.idle_timeout, read_line(&mut self.stream)).await;
        let line = match line {
            Ok(line) => line,
            Err(Error::Protocol(detail)) => return self.malformed(&detail).await,
            Err(e) => return Err(e),
        };
        self.state = ConnectionState::RequestRead;

        let request = match Request::parse(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    peer = %self.peer,
                    line = %sanitize_for_log(&line),
                    detail = e.detail(),
                    "Unknown request"
                );
                return self.finish(Reply::UnknownRequest).await;
            }
        };

        match request {
            Request::GetKey => {
                self.state = ConnectionState::UnauthCommand;
                self.serve_key().await
            }
            Request::Login => {
                self.state = ConnectionState::UnauthCommand;
                self.login().await
            }
            Request::Envelope(header) => {
                self.state = ConnectionState::AuthRequired;
                self.authenticated(header).await
            }
        }
    }

    async fn finish(&mut self, reply: Reply) -> Result<()> {
        send_reply(&mut self.stream, &reply).await?;
        self.state = ConnectionState::ResponseSent;
        Ok(())
    }

    /// Answer a frame that could not be parsed.
    async fn malformed(&mut self, detail: &str) -> Result<()> {
        warn!(peer = %self.peer, state = ?self.state, detail = %detail, "Malformed frame");
        self.finish(Reply::UnknownRequest).await
    }

    /// Refuse the request: audit it and answer according to the error class.
    async fn deny(&mut self, resource: &str, user: &str, err: Error) -> Result<()> {
        if !(err.is_auth_failure() || matches!(err, Error::Protocol(_))) {
            return Err(err);
        }

        warn!(
            peer = %self.peer,
            user = %sanitize_for_log(user),
            resource = %sanitize_for_log(resource),
            detail = err.detail(),
            "Access denied"
        );

        self.ctx
            .audit
            .record(
                AuditEvent::AccessDenied { resource, user },
                EventStatus::error(err.detail()),
            )
            .await;

        let reply = if err.is_auth_failure() {
            Reply::NotAuthenticated
        } else {
            Reply::UnknownRequest
        };
        self.finish(reply).await
    }

    async fn serve_key(&mut self) -> Result<()> {
        let pem = self.ctx.public_pem.as_bytes();
        let header = format_key_header(PUBLIC_KEY_FILE, pem.len());
        send_with_body(&mut self.stream, &header, pem).await?;
        self.state = ConnectionState::ResponseSent;
        debug!(peer = %self.peer, "Public key served");
        Ok(())
    }

    async fn login(&mut self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let mut handshake = ServerHandshake::new();

        handshake.ready()?;
        send_reply(&mut self.stream, &Reply::Ready).await?;

        let blob = match with_idle_timeout(self.idle_timeout, read_sized(&mut self.stream)).await {
            Ok(blob) => blob,
            Err(Error::Protocol(detail)) => return self.malformed(&detail).await,
            Err(e) => return Err(e),
        };
        let username = match handshake.receive_identity(&ctx.keys, &blob) {
            Ok(username) => username,
            Err(e) => return self.deny("LOGIN", "<unknown>", e).await,
        };

        let user = ctx.accounts.get(&username).await?;
        let challenge = match handshake.challenge(user.as_ref()) {
            Ok(challenge) => challenge,
            Err(e) => return self.deny("LOGIN", &username, e).await,
        };
        write_parts(&mut self.stream, &challenge.parts()).await?;

        let proof = match with_idle_timeout(self.idle_timeout, read_sized(&mut self.stream)).await {
            Ok(proof) => proof,
            Err(Error::Protocol(detail)) => return self.malformed(&detail).await,
            Err(e) if e.is_disconnect() => {
                info!(user = %username, "Client abandoned login after challenge");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = handshake.receive_proof(&ctx.keys, &proof) {
            return self.deny("LOGIN", &username, e).await;
        }

        let user = user.ok_or_else(|| Error::Authentication("user vanished".into()))?;
        let sealed = handshake.release_session_key(&user)?;
        write_sealed(&mut self.stream, &sealed).await?;
        self.state = ConnectionState::ResponseSent;

        info!(peer = %self.peer, user = %username, "Login succeeded");
        Ok(())
    }

    async fn authenticated(&mut self, header: EnvelopeHeader) -> Result<()> {
        let claimed = header.username.clone();
        let envelope =
            match with_idle_timeout(self.idle_timeout, Envelope::read_body(header, &mut self.stream)).await {
                Ok(envelope) => envelope,
                Err(Error::Protocol(detail)) => return self.malformed(&detail).await,
                Err(e) => return Err(e),
            };

        let user = match self.ctx.accounts.get(&claimed).await? {
            Some(user) => user,
            None => {
                let err = Error::Authentication("unknown user".into());
                return self.deny(OPAQUE_REQUEST, &claimed, err).await;
            }
        };

        let body = match envelope.open(&user.session_key) {
            Ok(body) => body,
            Err(e) if e.is_auth_failure() => return self.deny(OPAQUE_REQUEST, &claimed, e).await,
            Err(e) => {
                warn!(peer = %self.peer, user = %claimed, detail = e.detail(), "Bad command");
                return self.finish(Reply::UnknownRequest).await;
            }
        };

        send_reply(&mut self.stream, &Reply::Authenticated).await?;
        self.state = ConnectionState::Dispatched;
        debug!(user = %claimed, command = %body.command, "Request authenticated");

        match body.command {
            Command::Upload => self.upload(&user, &body).await,
            Command::Download => self.download(&user, &body).await,
            Command::Remove => self.remove(&user, &body).await,
            Command::ListDir => self.list_dir(&user).await,
        }
    }

    async fn upload(&mut self, user: &UserRecord, body: &CommandBody) -> Result<()> {
        let owner = &user.username;
        let name = &body.file_name;
        let dir = owner_dir(self.ctx.index.storage_root(), owner);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(name);
        if tokio::fs::try_exists(&path).await? {
            warn!(user = %owner, file = %name, "Upload overwrites existing file");
        }

        let buffer_size = self.ctx.config.buffer_size;
        let bytes = match receive_to_end(&mut self.stream, &path, buffer_size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(user = %owner, file = %name, detail = e.detail(), "Upload interrupted");
                self.ctx
                    .audit
                    .record(
                        AuditEvent::Upload { file: name, user: owner },
                        EventStatus::error(e.detail()),
                    )
                    .await;
                return Err(e);
            }
        };

        self.ctx.index.add(name, owner).await?;
        self.ctx
            .audit
            .record(AuditEvent::Upload { file: name, user: owner }, EventStatus::Success)
            .await;
        self.state = ConnectionState::ResponseSent;

        info!(user = %owner, file = %name, bytes, "Upload complete");
        Ok(())
    }

    async fn download(&mut self, user: &UserRecord, body: &CommandBody) -> Result<()> {
        let owner = &user.username;
        let name = &body.file_name;
        let path = self.ctx.index.file_path(owner, name);

        let size = if self.ctx.index.user_owns(owner, name).await? {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Some(meta.len()),
                _ => None,
            }
        } else {
            None
        };

        let size = match size {
            Some(size) => size,
            None => {
                debug!(user = %owner, file = %name, "Download of missing file");
                return self.finish(Reply::FileNotFound).await;
            }
        };

        write_line(&mut self.stream, &format_file_header(name, size)).await?;
        let buffer_size = self.ctx.config.buffer_size;
        let sent = match send_file(&mut self.stream, &path, buffer_size).await {
            Ok(sent) => sent,
            Err(e) => {
                self.ctx
                    .audit
                    .record(
                        AuditEvent::Download { file: name, user: owner },
                        EventStatus::error(e.detail()),
                    )
                    .await;
                return Err(e);
            }
        };

        let downloads = self.ctx.index.download(name, owner).await?;
        self.ctx
            .audit
            .record(AuditEvent::Download { file: name, user: owner }, EventStatus::Success)
            .await;
        self.state = ConnectionState::ResponseSent;

        info!(user = %owner, file = %name, bytes = sent, downloads, "Download complete");
        Ok(())
    }

    async fn remove(&mut self, user: &UserRecord, body: &CommandBody) -> Result<()> {
        let owner = &user.username;
        let name = &body.file_name;
        let path = self.ctx.index.file_path(owner, name);

        let exists = matches!(tokio::fs::metadata(&path).await, Ok(meta) if meta.is_file());
        if !exists {
            debug!(user = %owner, file = %name, "Remove of missing file");
            return self.finish(Reply::FileNotFound).await;
        }

        if let Err(e) = tokio::fs::remove_file(&path).await {
            let err = Error::from(e);
            self.ctx
                .audit
                .record(
                    AuditEvent::Delete { file: name, user: owner },
                    EventStatus::error(err.detail()),
                )
                .await;
            return Err(err);
        }

        self.ctx.index.delete(name, owner).await?;
        self.ctx
            .audit
            .record(AuditEvent::Delete { file: name, user: owner }, EventStatus::Success)
            .await;

        info!(user = %owner, file = %name, "File removed");
        self.finish(Reply::FileDeleted(name.clone())).await
    }

    async fn list_dir(&mut self, user: &UserRecord) -> Result<()> {
        let files = self.ctx.index.user_files(&user.username).await?;
        let encoded = bincode::serialize(&files)?;
        send_under_session(&mut self.stream, &user.session_key, &encoded).await?;
        self.state = ConnectionState::ResponseSent;

        debug!(user = %user.username, count = files.len(), "Listing sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::protocol::{parse_key_header, read_parts, write_sized};
    use crate::session::ClientHandshake;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn context(dir: &tempfile::TempDir) -> Arc<ServerContext> {
        let mut config = ServerConfig::with_data_dir(dir.path());
        config.rsa_bits = 1024;
        Arc::new(ServerContext::open(config).await.expect("context"))
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1))
    }

    async fn exchange(ctx: Arc<ServerContext>, request: &[u8]) -> Vec<u8> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(ConnectionHandler::new(server, peer(), ctx).run());

        client.write_all(request).await.expect("write");
        client.shutdown().await.expect("shutdown");

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.expect("read");
        task.await.expect("join").expect("handler");
        reply
    }

    #[tokio::test]
    async fn test_unknown_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reply = exchange(context(&dir).await, b"HELLO\n").await;
        assert_eq!(reply, b"ERROR;UnknownRequest\n");
    }

    #[tokio::test]
    async fn test_getkey() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir).await;
        let reply = exchange(ctx.clone(), b"GETKEY\n").await;

        let newline = reply.iter().position(|b| *b == b'\n').expect("header");
        let header = std::str::from_utf8(&reply[..newline]).expect("utf8");
        let (name, size) = parse_key_header(header).expect("parse");
        assert_eq!(name, "publ.pem");
        assert_eq!(&reply[newline + 1..], ctx.public_pem.as_bytes());
        assert_eq!(size, ctx.public_pem.len());
    }

    #[tokio::test]
    async fn test_unknown_user_envelope_denied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir).await;

        let envelope = Envelope::seal(
            "mallory",
            &crate::crypto::SessionKey::generate(),
            &CommandBody::new(Command::ListDir, ""),
        )
        .expect("seal");
        let reply = exchange(ctx.clone(), &envelope.to_bytes()).await;
        assert_eq!(reply, b"ERROR;NotAuthenticatedError\n");

        let log = std::fs::read_to_string(ctx.config.log_file()).expect("log");
        assert!(log.contains("ACCESS_DENIED ERROR User mallory was denied access to REQUEST"));
    }

    #[tokio::test]
    async fn test_wrong_session_key_denied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir).await;
        ctx.accounts.register("alice", "pw1").await.expect("register");

        let envelope = Envelope::seal(
            "alice",
            &crate::crypto::SessionKey::generate(),
            &CommandBody::new(Command::Download, "notes.txt"),
        )
        .expect("seal");
        let reply = exchange(ctx, &envelope.to_bytes()).await;
        assert_eq!(reply, b"ERROR;NotAuthenticatedError\n");
    }

    #[tokio::test]
    async fn test_missing_file_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir).await;
        let key = ctx.accounts.register("alice", "pw1").await.expect("register");

        let envelope =
            Envelope::seal("alice", &key, &CommandBody::new(Command::Download, "nope.txt")).expect("seal");
        let reply = exchange(ctx, &envelope.to_bytes()).await;
        assert_eq!(reply, b"OK;Authenticated\nERROR;FileNotFoundError\n");
    }

    #[tokio::test]
    async fn test_malformed_login_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reply = exchange(context(&dir).await, b"LOGIN\nzz-not-hex\n").await;
        assert_eq!(reply, b"OK;Ready\nERROR;UnknownRequest\n");
    }

    #[tokio::test]
    async fn test_garbage_identity_denied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir).await;

        let mut request = b"LOGIN\n80\n".to_vec();
        request.extend_from_slice(&[0x42u8; 128]);
        let reply = exchange(ctx.clone(), &request).await;
        assert_eq!(reply, b"OK;Ready\nERROR;NotAuthenticatedError\n");

        let log = std::fs::read_to_string(ctx.config.log_file()).expect("log");
        assert!(log.contains("ACCESS_DENIED ERROR User <unknown> was denied access to LOGIN"));
    }

    #[tokio::test]
    async fn test_bad_proof_denied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir).await;
        ctx.accounts.register("alice", "pw1").await.expect("register");

        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(ConnectionHandler::new(server, peer(), ctx.clone()).run());
        let mut client = BufReader::new(client);

        write_line(&mut client, "LOGIN").await.expect("login");
        assert_eq!(read_line(&mut client).await.expect("ready"), "OK;Ready");

        let handshake = ClientHandshake::new("alice", "pw1").expect("handshake");
        let identity = handshake.identity(ctx.keys.public_key()).expect("identity");
        write_sized(&mut client, &identity).await.expect("send identity");
        let challenge = read_parts(&mut client, 4).await.expect("challenge");
        assert_eq!(challenge.len(), 4);

        // Nonces the server never issued.
        let mut forged = vec![0u8; 16];
        forged.push(b';');
        forged.extend_from_slice(&[0u8; 16]);
        let proof = ctx.keys.public_key().encrypt(&forged).expect("encrypt");
        write_sized(&mut client, &proof).await.expect("send proof");

        assert_eq!(
            read_line(&mut client).await.expect("reply"),
            "ERROR;NotAuthenticatedError"
        );
        task.await.expect("join").expect("handler");

        let log = std::fs::read_to_string(ctx.config.log_file()).expect("log");
        assert!(log.contains("ACCESS_DENIED ERROR User alice was denied access to LOGIN"));
    }

    #[tokio::test]
    async fn test_connection_states() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir).await;
        let key = ctx.accounts.register("alice", "pw1").await.expect("register");

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut handler = ConnectionHandler::new(server, peer(), ctx.clone());
        assert_eq!(handler.state(), ConnectionState::Connected);
        client.write_all(b"GETKEY\n").await.expect("write");
        handler.handle().await.expect("getkey");
        assert_eq!(handler.state(), ConnectionState::ResponseSent);

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut handler = ConnectionHandler::new(server, peer(), ctx.clone());
        client.write_all(b"HELLO\n").await.expect("write");
        handler.handle().await.expect("unknown");
        assert_eq!(handler.state(), ConnectionState::ResponseSent);

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut handler = ConnectionHandler::new(server, peer(), ctx);
        let envelope = Envelope::seal("alice", &key, &CommandBody::new(Command::ListDir, "")).expect("seal");
        client.write_all(&envelope.to_bytes()).await.expect("write");
        handler.handle().await.expect("list");
        assert_eq!(handler.state(), ConnectionState::ResponseSent);
    }
}
