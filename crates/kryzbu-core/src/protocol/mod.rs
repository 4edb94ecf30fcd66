//! Wire protocol for Kryzbu.
//!
//! A text-framed protocol over a plain TCP stream, one request per
//! connection. The first line selects the exchange:
//!
//! ```text
//! GETKEY                                   -> OK;publ.pem;<size>\n <pem>
//! LOGIN                                    -> OK;Ready\n  (handshake)
//! <user>;<lc>;<lt>;<lp>;<ln>\n <c><t><p><n> -> OK;Authenticated\n ...
//! ```
//!
//! Binary fields are never escaped; they are preceded by a header line
//! carrying their lengths. Malformed input gets `ERROR;UnknownRequest` and
//! the connection is closed.

mod command;
mod frame;

pub use command::{
    format_file_header, format_key_header, parse_file_header, parse_key_header,
    validate_file_name, validate_username, Command, CommandBody, EnvelopeHeader, Reply, Request,
    GETKEY, LOGIN, MAX_NAME_LENGTH,
};
pub use frame::{
    parse_lengths, parse_lengths_within, read_exact_vec, read_fields, read_line, read_parts,
    read_parts_within, read_sized, write_line, write_parts, write_sized, MAX_FIELD_SIZE,
    MAX_LINE_LENGTH,
};

use crate::error::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Send a status reply.
pub async fn send_reply<W>(writer: &mut W, reply: &Reply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, &reply.to_line()).await
}

/// Send a line and then a raw body in one flush.
pub async fn send_with_body<W>(writer: &mut W, line: &str, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(line.len() + 1 + body.len());
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(body);
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}
