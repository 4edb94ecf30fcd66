//! Session establishment and request protection.
//!
//! The LOGIN [`handshake`] delivers a user's long-lived session key; every
//! later request travels in an [`Envelope`] sealed under that key.

pub mod envelope;
pub mod handshake;

pub use envelope::{Envelope, PAD_SIZE};
pub use handshake::{Challenge, ClientHandshake, HandshakeState, ServerHandshake};

use crate::crypto::{open, seal, Sealed, SessionKey};
use crate::error::Result;
use crate::protocol::{read_parts_within, write_parts};
use tokio::io::{AsyncBufRead, AsyncWrite};
use zeroize::Zeroizing;

/// Send a sealed payload as `len(c);len(tag);len(nonce)` + fields.
pub async fn write_sealed<W>(writer: &mut W, sealed: &Sealed) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_parts(
        writer,
        &[
            sealed.ciphertext.as_slice(),
            &sealed.tag[..],
            &sealed.nonce.as_bytes()[..],
        ],
    )
    .await
}

/// Largest payload accepted under a session key. A LIST_DIR reply grows with
/// the caller's file count, so it gets far more room than a handshake field.
pub const MAX_SESSION_PAYLOAD: usize = 64 * 1024 * 1024;

/// Raw fields of a payload sent by [`write_sealed`].
pub async fn read_sealed<R>(reader: &mut R) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)>
where
    R: AsyncBufRead + Unpin,
{
    let mut parts = read_parts_within(reader, 3, MAX_SESSION_PAYLOAD).await?.into_iter();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(c), Some(t), Some(n)) => Ok((c, t, n)),
        _ => Err(crate::Error::Protocol("sealed payload needs three fields".into())),
    }
}

/// Seal `plaintext` under a session key and send it.
pub async fn send_under_session<W>(writer: &mut W, key: &SessionKey, plaintext: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let sealed = seal(key.as_bytes(), plaintext)?;
    write_sealed(writer, &sealed).await
}

/// Receive and open a payload sealed under a session key.
pub async fn receive_under_session<R>(reader: &mut R, key: &SessionKey) -> Result<Zeroizing<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let (ciphertext, tag, nonce) = read_sealed(reader).await?;
    open(key.as_bytes(), &ciphertext, &tag, &nonce)
}
