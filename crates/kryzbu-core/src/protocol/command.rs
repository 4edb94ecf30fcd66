//! Request and reply vocabulary.

use super::frame::parse_lengths;
use crate::error::{Error, Result};
use std::fmt;

/// Token of the unauthenticated public key request.
pub const GETKEY: &str = "GETKEY";

/// Token that opens a handshake.
pub const LOGIN: &str = "LOGIN";

/// Longest accepted user or file name, in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

/// Operations carried inside an authenticated envelope.
///
/// Parsed by exact token; anything else is an unknown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Store a file; the body follows the envelope.
    Upload,
    /// Fetch a file.
    Download,
    /// Delete a file.
    Remove,
    /// List the caller's files.
    ListDir,
}

impl Command {
    /// Wire token.
    pub fn token(&self) -> &'static str {
        match self {
            Command::Upload => "UPLOAD",
            Command::Download => "DOWNLOAD",
            Command::Remove => "REMOVE",
            Command::ListDir => "LIST_DIR",
        }
    }

    /// Parse a wire token.
    pub fn from_token(token: &str) -> Result<Self> {
        match token {
            "UPLOAD" => Ok(Command::Upload),
            "DOWNLOAD" => Ok(Command::Download),
            "REMOVE" => Ok(Command::Remove),
            "LIST_DIR" => Ok(Command::ListDir),
            other => Err(Error::Protocol(format!(
                "unknown command: {}",
                crate::logging::sanitize_for_log(other)
            ))),
        }
    }

    /// Whether the command names a file.
    pub fn takes_file(&self) -> bool {
        !matches!(self, Command::ListDir)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Decrypted body of an envelope, after the pad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBody {
    /// Requested operation.
    pub command: Command,
    /// Target file; empty for [`Command::ListDir`].
    pub file_name: String,
}

impl CommandBody {
    /// Body for `command` on `file_name`.
    pub fn new(command: Command, file_name: impl Into<String>) -> Self {
        Self {
            command,
            file_name: file_name.into(),
        }
    }

    /// `COMMAND;filename` bytes.
    pub fn encode(&self) -> Vec<u8> {
        format!("{};{}", self.command.token(), self.file_name).into_bytes()
    }

    /// Parse `COMMAND;filename`, validating the file name when the command
    /// needs one.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::Protocol("command is not UTF-8".into()))?;
        let (token, file_name) = text
            .split_once(';')
            .ok_or_else(|| Error::Protocol("command without separator".into()))?;

        let command = Command::from_token(token)?;
        if command.takes_file() {
            validate_file_name(file_name)?;
        } else if !file_name.is_empty() {
            return Err(Error::Protocol("LIST_DIR takes no file name".into()));
        }

        Ok(Self::new(command, file_name))
    }
}

/// Envelope header: `username;len(c);len(tag);len(pad);len(nonce)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Claimed sender.
    pub username: String,
    /// Ciphertext length.
    pub ciphertext_len: usize,
    /// Tag length.
    pub tag_len: usize,
    /// Pad length.
    pub pad_len: usize,
    /// Nonce length.
    pub nonce_len: usize,
}

impl EnvelopeHeader {
    /// Header line without the trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{};{};{};{};{}",
            self.username, self.ciphertext_len, self.tag_len, self.pad_len, self.nonce_len
        )
    }
}

/// First line of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Fetch the server public key.
    GetKey,
    /// Start a handshake.
    Login,
    /// An authenticated command envelope follows.
    Envelope(EnvelopeHeader),
}

impl Request {
    /// Classify the first line of a connection.
    pub fn parse(line: &str) -> Result<Self> {
        match line {
            GETKEY => return Ok(Request::GetKey),
            LOGIN => return Ok(Request::Login),
            _ => {}
        }

        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() != 5 {
            return Err(Error::Protocol("unrecognized request line".into()));
        }

        let username = fields[0];
        validate_username(username)?;
        let lengths = parse_lengths(&fields[1..])?;

        Ok(Request::Envelope(EnvelopeHeader {
            username: username.to_string(),
            ciphertext_len: lengths[0],
            tag_len: lengths[1],
            pad_len: lengths[2],
            nonce_len: lengths[3],
        }))
    }
}

/// Fixed status lines sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `OK;Ready`: the handshake may proceed.
    Ready,
    /// `OK;Authenticated`: the envelope checked out.
    Authenticated,
    /// `ERROR;NotAuthenticatedError`.
    NotAuthenticated,
    /// `ERROR;UnknownRequest`.
    UnknownRequest,
    /// `ERROR;FileNotFoundError`.
    FileNotFound,
    /// `OK;FileDeleted;<name>`.
    FileDeleted(String),
}

impl Reply {
    /// Line without the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            Reply::Ready => "OK;Ready".into(),
            Reply::Authenticated => "OK;Authenticated".into(),
            Reply::NotAuthenticated => "ERROR;NotAuthenticatedError".into(),
            Reply::UnknownRequest => "ERROR;UnknownRequest".into(),
            Reply::FileNotFound => "ERROR;FileNotFoundError".into(),
            Reply::FileDeleted(name) => format!("OK;FileDeleted;{}", name),
        }
    }

    /// Recognize a status line. `None` for anything else, such as a file
    /// header.
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "OK;Ready" => Some(Reply::Ready),
            "OK;Authenticated" => Some(Reply::Authenticated),
            "ERROR;NotAuthenticatedError" => Some(Reply::NotAuthenticated),
            "ERROR;UnknownRequest" => Some(Reply::UnknownRequest),
            "ERROR;FileNotFoundError" => Some(Reply::FileNotFound),
            _ => line
                .strip_prefix("OK;FileDeleted;")
                .map(|name| Reply::FileDeleted(name.to_string())),
        }
    }

    /// Error a client raises when it receives this reply unexpectedly.
    pub fn into_error(self, context: &str) -> Error {
        match self {
            Reply::NotAuthenticated => Error::Authentication(format!("{}: not authenticated", context)),
            Reply::FileNotFound => Error::NotFound(format!("{}: file not found", context)),
            other => Error::Protocol(format!("{}: unexpected reply {}", context, other.to_line())),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// `<name>;<size>` header preceding a streamed body.
pub fn format_file_header(name: &str, size: u64) -> String {
    format!("{};{}", name, size)
}

/// Parse a `<name>;<size>` header.
pub fn parse_file_header(line: &str) -> Result<(String, u64)> {
    let (name, size) = line
        .rsplit_once(';')
        .ok_or_else(|| Error::Protocol("bad file header".into()))?;
    let size = size
        .parse()
        .map_err(|_| Error::Protocol("bad file size".into()))?;
    Ok((name.to_string(), size))
}

/// `OK;<key file>;<size>` header of the GETKEY reply.
pub fn format_key_header(key_file: &str, size: usize) -> String {
    format!("OK;{};{}", key_file, size)
}

/// Parse the GETKEY reply header into (key file name, size).
pub fn parse_key_header(line: &str) -> Result<(String, usize)> {
    let rest = line
        .strip_prefix("OK;")
        .ok_or_else(|| Error::Protocol("bad key header".into()))?;
    let (name, size) = parse_file_header(rest)?;
    let size = usize::try_from(size)
        .ok()
        .filter(|s| *s <= super::frame::MAX_FIELD_SIZE)
        .ok_or_else(|| Error::Protocol("key too large".into()))?;
    Ok((name, size))
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Protocol(format!("empty {}", kind)));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::Protocol(format!("{} too long", kind)));
    }
    if name == "." || name == ".." {
        return Err(Error::Protocol(format!("reserved {}", kind)));
    }
    if name
        .chars()
        .any(|c| matches!(c, '/' | '\\' | ';' | '\0') || c.is_control())
    {
        return Err(Error::Protocol(format!("forbidden character in {}", kind)));
    }
    Ok(())
}

/// Check that a file name is a single safe path component.
pub fn validate_file_name(name: &str) -> Result<()> {
    validate_name("file name", name)
}

/// Check that a user name can be framed and used as a folder name.
pub fn validate_username(name: &str) -> Result<()> {
    validate_name("user name", name)
}
