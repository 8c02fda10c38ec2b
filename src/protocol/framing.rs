//! Length-prefix-free envelope framing.
//!
//! An implementer must not add a length prefix — the contract is that a
//! receiver can tell where one JSON object ends and the next begins purely
//! from `serde_json`'s own parser state. We get that by running
//! `serde_json::Deserializer`'s streaming mode over an accumulating byte
//! buffer and advancing the buffer by exactly the bytes one value consumed.

use super::Envelope;
use crate::error::{Result, SyncError};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 16 * 1024;

/// Wraps a half (or both halves) of a connection with the buffering state
/// needed to decode one JSON-self-delimited envelope at a time.
pub struct EnvelopeReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    /// Decode the next envelope, reading more bytes from the socket as
    /// needed. Returns `Transport` on a clean EOF with no pending bytes.
    pub async fn read_envelope(&mut self) -> Result<Envelope> {
        loop {
            if let Some(env) = try_decode_one(&mut self.buf)? {
                return Ok(env);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self
                .inner
                .read(&mut chunk)
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Err(SyncError::Transport("connection closed".into()));
                }
                let io_err = std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated envelope at eof",
                );
                return Err(SyncError::ProtocolDecode(io_err.into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

fn try_decode_one(buf: &mut BytesMut) -> Result<Option<Envelope>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut de = serde_json::Deserializer::from_slice(buf);
    let mut stream = de.into_iter::<Envelope>();
    match stream.next() {
        Some(Ok(env)) => {
            let consumed = stream.byte_offset();
            buf.advance(consumed);
            Ok(Some(env))
        }
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(SyncError::ProtocolDecode(e)),
        None => Ok(None),
    }
}

/// Encode-and-write: no checksum, no length prefix, just the JSON bytes.
pub async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let bytes = serde_json::to_vec(envelope)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, PathPayload};

    #[tokio::test]
    async fn reads_back_to_back_envelopes_with_no_delimiter() {
        let a = Envelope::new(MessageType::Md5Request, "u1", PathPayload { path: "m".into() });
        let b = Envelope::new(MessageType::ListRequest, "u1", PathPayload { path: "n".into() });
        let mut wire = Vec::new();
        wire.extend(serde_json::to_vec(&a).unwrap());
        wire.extend(serde_json::to_vec(&b).unwrap());

        let mut reader = EnvelopeReader::new(std::io::Cursor::new(wire));
        let got_a = reader.read_envelope().await.unwrap();
        let got_b = reader.read_envelope().await.unwrap();
        assert_eq!(got_a, a);
        assert_eq!(got_b, b);
    }

    #[tokio::test]
    async fn reads_envelope_arriving_in_fragments() {
        let env = Envelope::new(MessageType::Init, "u1", serde_json::json!({"uuid": "u1"}));
        let bytes = serde_json::to_vec(&env).unwrap();

        let (client, mut server) = tokio::io::duplex(64);
        let expected = env.clone();
        let writer_task = tokio::spawn(async move {
            let mut w = client;
            for chunk in bytes.chunks(3) {
                w.write_all(chunk).await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        });

        let mut reader = EnvelopeReader::new(&mut server);
        let got = reader.read_envelope().await.unwrap();
        assert_eq!(got, expected);
        writer_task.await.unwrap();
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let env = Envelope::new(
            MessageType::Data,
            "u2",
            crate::protocol::DataPayload::ok("done"),
        );
        let (mut client, server) = tokio::io::duplex(256);
        write_envelope(&mut client, &env).await.unwrap();
        drop(client);

        let mut reader = EnvelopeReader::new(server);
        let got = reader.read_envelope().await.unwrap();
        assert_eq!(got, env);
    }

    #[tokio::test]
    async fn eof_with_no_bytes_is_transport_error() {
        let mut reader = EnvelopeReader::new(std::io::Cursor::new(Vec::<u8>::new()));
        let err = reader.read_envelope().await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }
}
