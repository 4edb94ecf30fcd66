//! Per-request authenticated envelope.
//!
//! `username;len(c);len(tag);len(pad);len(nonce)\n` followed by the four
//! fields. The plaintext is `pad || COMMAND;filename`, sealed under the
//! user's session key; the pad travels in the clear as well and must match
//! the decrypted prefix.

use crate::crypto::{constant_time_eq, open, random_bytes, seal, SessionKey, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use crate::protocol::{read_exact_vec, CommandBody, EnvelopeHeader};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

/// Random prefix of every request plaintext.
pub const PAD_SIZE: usize = 8;

/// Raw envelope fields as read from the wire.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Claimed sender.
    pub username: String,
    /// Sealed `pad || body`.
    pub ciphertext: Vec<u8>,
    /// EAX tag.
    pub tag: Vec<u8>,
    /// Cleartext copy of the pad.
    pub pad: Vec<u8>,
    /// EAX nonce.
    pub nonce: Vec<u8>,
}

impl Envelope {
    /// Seal `body` for `username` under `key`.
    pub fn seal(username: &str, key: &SessionKey, body: &CommandBody) -> Result<Self> {
        let pad: [u8; PAD_SIZE] = random_bytes();

        let mut plaintext = Zeroizing::new(Vec::with_capacity(PAD_SIZE + 64));
        plaintext.extend_from_slice(&pad);
        plaintext.extend_from_slice(&body.encode());

        let sealed = seal(key.as_bytes(), &plaintext)?;
        Ok(Self {
            username: username.to_string(),
            ciphertext: sealed.ciphertext,
            tag: sealed.tag.to_vec(),
            pad: pad.to_vec(),
            nonce: sealed.nonce.as_bytes().to_vec(),
        })
    }

    /// Header describing this envelope.
    pub fn header(&self) -> EnvelopeHeader {
        EnvelopeHeader {
            username: self.username.clone(),
            ciphertext_len: self.ciphertext.len(),
            tag_len: self.tag.len(),
            pad_len: self.pad.len(),
            nonce_len: self.nonce.len(),
        }
    }

    /// Header line and fields as one buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = self.header().to_line();
        let mut out = Vec::with_capacity(
            header.len() + 1 + self.ciphertext.len() + self.tag.len() + self.pad.len() + self.nonce.len(),
        );
        out.extend_from_slice(header.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.pad);
        out.extend_from_slice(&self.nonce);
        out
    }

    /// Send the envelope.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the fields announced by an already parsed header line.
    pub async fn read_body<R>(header: EnvelopeHeader, reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let ciphertext = read_exact_vec(reader, header.ciphertext_len).await?;
        let tag = read_exact_vec(reader, header.tag_len).await?;
        let pad = read_exact_vec(reader, header.pad_len).await?;
        let nonce = read_exact_vec(reader, header.nonce_len).await?;

        Ok(Self {
            username: header.username,
            ciphertext,
            tag,
            pad,
            nonce,
        })
    }

    /// Verify and decrypt under `key`.
    ///
    /// A bad tag, wrong field sizes or a pad mismatch are authentication
    /// failures. A well-authenticated body naming an unknown command or a
    /// bad file name is a protocol error.
    pub fn open(&self, key: &SessionKey) -> Result<CommandBody> {
        if self.pad.len() != PAD_SIZE || self.tag.len() != TAG_SIZE || self.nonce.len() != NONCE_SIZE {
            return Err(Error::Authentication("bad envelope field sizes".into()));
        }

        let plaintext = open(key.as_bytes(), &self.ciphertext, &self.tag, &self.nonce)
            .map_err(|_| Error::Authentication("envelope did not verify".into()))?;

        if plaintext.len() < PAD_SIZE || !constant_time_eq(&plaintext[..PAD_SIZE], &self.pad) {
            return Err(Error::Authentication("pad mismatch".into()));
        }

        CommandBody::decode(&plaintext[PAD_SIZE..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_line, Command, Request};
    use tokio::io::BufReader;

    #[test]
    fn test_seal_open() {
        let key = SessionKey::generate();
        let body = CommandBody::new(Command::Upload, "notes.txt");

        let envelope = Envelope::seal("alice", &key, &body).expect("seal");
        assert_eq!(envelope.pad.len(), PAD_SIZE);
        assert_eq!(envelope.ciphertext.len(), PAD_SIZE + "UPLOAD;notes.txt".len());
        assert_eq!(envelope.open(&key).expect("open"), body);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let envelope = Envelope::seal(
            "alice",
            &SessionKey::generate(),
            &CommandBody::new(Command::ListDir, ""),
        )
        .expect("seal");

        let err = envelope.open(&SessionKey::generate()).expect_err("wrong key");
        assert!(err.is_auth_failure());
    }

    #[test]
    fn test_pad_mismatch_rejected() {
        let key = SessionKey::generate();
        let mut envelope =
            Envelope::seal("alice", &key, &CommandBody::new(Command::Remove, "a.txt")).expect("seal");
        envelope.pad[0] ^= 0xff;

        assert!(matches!(envelope.open(&key), Err(Error::Authentication(_))));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = SessionKey::generate();
        let mut envelope =
            Envelope::seal("alice", &key, &CommandBody::new(Command::Download, "a.txt")).expect("seal");
        envelope.ciphertext[PAD_SIZE] ^= 0x01;

        assert!(envelope.open(&key).expect_err("tampered").is_auth_failure());
    }

    #[tokio::test]
    async fn test_wire_roundtrip() {
        let key = SessionKey::generate();
        let body = CommandBody::new(Command::Download, "notes.txt");
        let envelope = Envelope::seal("alice", &key, &body).expect("seal");

        let mut wire = Vec::new();
        envelope.write_to(&mut wire).await.expect("write");

        let mut reader = BufReader::new(&wire[..]);
        let line = read_line(&mut reader).await.expect("line");
        assert_eq!(line, "alice;26;16;8;16");

        let header = match Request::parse(&line).expect("parse") {
            Request::Envelope(header) => header,
            other => panic!("unexpected request {:?}", other),
        };
        let received = Envelope::read_body(header, &mut reader).await.expect("body");
        assert_eq!(received.open(&key).expect("open"), body);
    }
}
