//! Chunked bulk transfer of file bodies.
//!
//! File bytes go over the connection raw, with no per-chunk framing. The
//! sender either announces the size up front (downloads) or signals the end
//! by shutting down its write half (uploads).

use crate::error::{Error, Result};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

const PROGRESS_STEP: u64 = 1024 * 1024;

/// Stream the file at `path` to `writer` in `buffer_size` chunks.
///
/// Returns the number of bytes sent.
pub async fn send_file<W>(writer: &mut W, path: &Path, buffer_size: usize) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut file = File::open(path).await?;
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut bytes_sent: u64 = 0;

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }

        writer.write_all(&buffer[..n]).await?;
        bytes_sent += n as u64;

        if bytes_sent % PROGRESS_STEP == 0 {
            debug!(sent = bytes_sent, "Transfer progress");
        }
    }

    writer.flush().await?;
    Ok(bytes_sent)
}

/// Write everything `reader` yields until EOF into a new file at `path`.
///
/// An existing file is overwritten. On a read error the partial file stays
/// on disk.
pub async fn receive_to_end<R>(reader: &mut R, path: &Path, buffer_size: usize) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut output = File::create(path).await?;
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut bytes_received: u64 = 0;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }

        output.write_all(&buffer[..n]).await?;
        bytes_received += n as u64;

        if bytes_received % PROGRESS_STEP == 0 {
            debug!(received = bytes_received, "Receive progress");
        }
    }

    output.flush().await?;
    Ok(bytes_received)
}

/// Read exactly `size` bytes from `reader` into a new file at `path`.
///
/// Fails with a transport error if the peer closes early.
pub async fn receive_exact<R>(
    reader: &mut R,
    path: &Path,
    size: u64,
    buffer_size: usize,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut output = File::create(path).await?;
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut bytes_received: u64 = 0;

    while bytes_received < size {
        let remaining = size - bytes_received;
        let to_read = remaining.min(buffer.len() as u64) as usize;

        let n = reader.read(&mut buffer[..to_read]).await?;
        if n == 0 {
            warn!(
                received = bytes_received,
                expected = size,
                "Connection closed before transfer complete"
            );
            return Err(Error::Transport(format!(
                "peer closed after {} of {} bytes",
                bytes_received, size
            )));
        }

        output.write_all(&buffer[..n]).await?;
        bytes_received += n as u64;
    }

    output.flush().await?;
    Ok(bytes_received)
}
