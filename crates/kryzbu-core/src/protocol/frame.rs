//! Line and length-delimited framing.
//!
//! Control messages are single `\n`-terminated lines. Binary fields follow
//! a header line listing their lengths, either one hex length (RSA blobs) or
//! several decimal lengths joined by `;`.

use crate::error::{Error, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted control line, newline included.
pub const MAX_LINE_LENGTH: usize = 4096;

/// Largest accepted binary field (64 KiB).
pub const MAX_FIELD_SIZE: usize = 64 * 1024;

/// Read one `\n`-terminated line, without the terminator.
///
/// A trailing `\r` is dropped as well. EOF before any byte is a
/// transport error; an over-long or non UTF-8 line is a protocol error.
pub async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', &mut buf)
        .await?;

    if read == 0 {
        return Err(Error::Transport("connection closed".into()));
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if read == MAX_LINE_LENGTH {
        return Err(Error::Protocol("line too long".into()));
    } else {
        return Err(Error::Transport("connection closed mid-line".into()));
    }

    String::from_utf8(buf).map_err(|_| Error::Protocol("line is not UTF-8".into()))
}

/// Write `line` followed by `\n` and flush.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly `len` bytes.
pub async fn read_exact_vec<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Parse decimal field lengths, each bounded by [`MAX_FIELD_SIZE`].
pub fn parse_lengths(fields: &[&str]) -> Result<Vec<usize>> {
    parse_lengths_within(fields, MAX_FIELD_SIZE)
}

/// Parse decimal field lengths, each bounded by `limit`.
pub fn parse_lengths_within(fields: &[&str], limit: usize) -> Result<Vec<usize>> {
    fields
        .iter()
        .map(|field| {
            let len: usize = field
                .parse()
                .map_err(|_| Error::Protocol("bad length field".into()))?;
            if len > limit {
                return Err(Error::Protocol(format!("field too large: {}", len)));
            }
            Ok(len)
        })
        .collect()
}

/// Send one blob as a hex length line followed by the raw bytes.
pub async fn write_sized<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = format!("{:x}\n", bytes.len()).into_bytes();
    out.extend_from_slice(bytes);
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a blob sent by [`write_sized`].
pub async fn read_sized<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    let len = usize::from_str_radix(line.trim(), 16)
        .map_err(|_| Error::Protocol("bad hex length".into()))?;
    if len > MAX_FIELD_SIZE {
        return Err(Error::Protocol(format!("field too large: {}", len)));
    }
    read_exact_vec(reader, len).await
}

/// Send several fields as a `len;len;...` header followed by their bytes.
pub async fn write_parts<W>(writer: &mut W, parts: &[&[u8]]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = parts
        .iter()
        .map(|p| p.len().to_string())
        .collect::<Vec<_>>()
        .join(";");

    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(header.len() + 1 + total);
    out.extend_from_slice(header.as_bytes());
    out.push(b'\n');
    for part in parts {
        out.extend_from_slice(part);
    }

    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive exactly `count` fields sent by [`write_parts`].
pub async fn read_parts<R>(reader: &mut R, count: usize) -> Result<Vec<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    read_parts_within(reader, count, MAX_FIELD_SIZE).await
}

/// Like [`read_parts`], with each field bounded by `limit` instead of
/// [`MAX_FIELD_SIZE`].
pub async fn read_parts_within<R>(reader: &mut R, count: usize, limit: usize) -> Result<Vec<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    read_fields_within(reader, &line, count, limit).await
}

/// Read the `count` fields announced by an already received header line.
pub async fn read_fields<R>(reader: &mut R, header: &str, count: usize) -> Result<Vec<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    read_fields_within(reader, header, count, MAX_FIELD_SIZE).await
}

async fn read_fields_within<R>(reader: &mut R, header: &str, count: usize, limit: usize) -> Result<Vec<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let fields: Vec<&str> = header.split(';').collect();
    if fields.len() != count {
        return Err(Error::Protocol(format!(
            "expected {} length fields, got {}",
            count,
            fields.len()
        )));
    }

    let mut parts = Vec::with_capacity(count);
    for len in parse_lengths_within(&fields, limit)? {
        parts.push(read_exact_vec(reader, len).await?);
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_line_roundtrip() {
        let mut out = Vec::new();
        write_line(&mut out, "OK;Ready").await.expect("write");
        write_line(&mut out, "GETKEY").await.expect("write");
        assert_eq!(out, b"OK;Ready\nGETKEY\n");

        let mut reader = BufReader::new(&out[..]);
        assert_eq!(read_line(&mut reader).await.expect("read"), "OK;Ready");
        assert_eq!(read_line(&mut reader).await.expect("read"), "GETKEY");
        assert!(read_line(&mut reader).await.expect_err("eof").is_disconnect());
    }

    #[tokio::test]
    async fn test_crlf_is_trimmed() {
        let mut reader = BufReader::new(&b"LOGIN\r\n"[..]);
        assert_eq!(read_line(&mut reader).await.expect("read"), "LOGIN");
    }

    #[tokio::test]
    async fn test_long_line_rejected() {
        let data = vec![b'a'; MAX_LINE_LENGTH + 10];
        let mut reader = BufReader::new(&data[..]);
        assert!(matches!(read_line(&mut reader).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_sized_blob_uses_hex_length() {
        let blob = vec![7u8; 256];
        let mut out = Vec::new();
        write_sized(&mut out, &blob).await.expect("write");
        assert!(out.starts_with(b"100\n"));

        let mut reader = BufReader::new(&out[..]);
        assert_eq!(read_sized(&mut reader).await.expect("read"), blob);
    }

    #[tokio::test]
    async fn test_parts() {
        let mut out = Vec::new();
        write_parts(&mut out, &[&b"abc"[..], &b""[..], &b"12345"[..]]).await.expect("write");
        assert!(out.starts_with(b"3;0;5\n"));

        let mut reader = BufReader::new(&out[..]);
        let parts = read_parts(&mut reader, 3).await.expect("read");
        assert_eq!(parts, vec![b"abc".to_vec(), Vec::new(), b"12345".to_vec()]);
    }

    #[tokio::test]
    async fn test_parts_count_mismatch() {
        let mut reader = BufReader::new(&b"1;2\nabc"[..]);
        assert!(matches!(read_parts(&mut reader, 3).await, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_oversized_length_rejected() {
        assert!(parse_lengths(&["16", "65536"]).is_ok());
        assert!(parse_lengths(&["65537"]).is_err());
        assert!(parse_lengths(&["-1"]).is_err());
        assert!(parse_lengths(&["x"]).is_err());
    }

    #[tokio::test]
    async fn test_parts_within_larger_limit() {
        let big = vec![1u8; MAX_FIELD_SIZE + 1];
        let mut out = Vec::new();
        write_parts(&mut out, &[big.as_slice()]).await.expect("write");

        let mut reader = BufReader::new(&out[..]);
        assert!(matches!(read_parts(&mut reader, 1).await, Err(Error::Protocol(_))));

        let mut reader = BufReader::new(&out[..]);
        let parts = read_parts_within(&mut reader, 1, 2 * MAX_FIELD_SIZE)
            .await
            .expect("read");
        assert_eq!(parts[0].len(), MAX_FIELD_SIZE + 1);
    }

    #[tokio::test]
    async fn test_truncated_field_is_disconnect() {
        let mut reader = BufReader::new(&b"10\nabc"[..]);
        let err = read_parts(&mut reader, 1).await.expect_err("short");
        assert!(err.is_disconnect());
    }
}
