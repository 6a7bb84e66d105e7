//! Wire framing for peer connections
//!
//! Every unit on the wire starts with a one-byte tag:
//! - `0x1` MESSAGE: followed by a `u32` little-endian length and that many
//!   bytes of encoded [`crate::messages::Message`]
//! - `0x2` STREAM: no inline payload; the bytes that follow are a raw stream
//!   whose extent is defined by the preceding protocol exchange
//!
//! MESSAGE payloads are bounded by a configurable maximum.

use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};

pub const MESSAGE_TAG: u8 = 0x1;
pub const STREAM_TAG: u8 = 0x2;

/// Default cap on a control payload
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Connection closed")]
    Closed,

    #[error("Unknown frame tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("Message of {len} bytes exceeds maximum of {max}")]
    Oversized { len: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// Whether the connection can no longer be read after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Closed | DecodeError::Io(_))
    }
}

/// One decoded unit from a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Vec<u8>),
    /// Raw bytes follow; the reader must be handed to a consumer
    Stream,
}

/// A control message received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    /// Remote address of the sending connection
    pub from: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_message_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Read exactly one frame from `reader`
    pub async fn decode<R>(&self, reader: &mut R) -> Result<Frame, DecodeError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let tag = match reader.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(DecodeError::Closed),
            Err(e) => return Err(e.into()),
        };

        match tag {
            STREAM_TAG => Ok(Frame::Stream),
            MESSAGE_TAG => {
                let len = reader.read_u32_le().await? as usize;
                if len > self.max_message_size {
                    // Skip the body so the next tag lines up
                    let mut body = (&mut *reader).take(len as u64);
                    tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
                    return Err(DecodeError::Oversized {
                        len,
                        max: self.max_message_size,
                    });
                }

                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                Ok(Frame::Message(payload))
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

/// Encode a MESSAGE frame carrying `payload`
pub fn encode_message(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 4 + payload.len());
    buf.push(MESSAGE_TAG);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Reader yielding exactly `len` bytes of a raw stream
///
/// Never reads past `len`; an EOF before `len` bytes is an
/// `UnexpectedEof` error rather than a short success.
pub struct ExactReader<R> {
    inner: Take<R>,
}

pub fn exact_reader<R: AsyncRead + Unpin>(reader: R, len: u64) -> ExactReader<R> {
    ExactReader {
        inner: reader.take(len),
    }
}

impl<R: AsyncRead> ExactReader<R> {
    /// Bytes still expected
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ExactReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;

        let outstanding = self.inner.limit();
        if buf.filled().len() == before && outstanding > 0 && buf.remaining() > 0 {
            return Poll::Ready(Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("stream ended {} bytes early", outstanding),
            )));
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_decode_message() {
        let wire = encode_message(b"hello");
        let frame = FrameDecoder::default()
            .decode(&mut &wire[..])
            .await
            .unwrap();
        assert_eq!(frame, Frame::Message(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_decode_stream_leaves_body_unread() {
        let wire = [STREAM_TAG, 0xde, 0xad];
        let mut reader = &wire[..];

        let frame = FrameDecoder::default().decode(&mut reader).await.unwrap();
        assert_eq!(frame, Frame::Stream);
        assert_eq!(reader, &[0xde, 0xad]);
    }

    #[tokio::test]
    async fn test_message_followed_by_stream() {
        // A message larger than a single read must not swallow the stream tag
        let mut wire = encode_message(&[7u8; 1000]);
        wire.push(STREAM_TAG);
        wire.extend_from_slice(b"raw");
        let mut reader = &wire[..];
        let decoder = FrameDecoder::default();

        assert_eq!(
            decoder.decode(&mut reader).await.unwrap(),
            Frame::Message(vec![7u8; 1000])
        );
        assert_eq!(decoder.decode(&mut reader).await.unwrap(), Frame::Stream);
        assert_eq!(reader, b"raw");
    }

    #[tokio::test]
    async fn test_closed_on_eof() {
        let result = FrameDecoder::default().decode(&mut &b""[..]).await;
        assert!(matches!(result, Err(DecodeError::Closed)));
        assert!(result.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_fatal() {
        let mut wire = encode_message(b"hello world");
        wire.truncate(8);
        let result = FrameDecoder::default().decode(&mut &wire[..]).await;
        assert!(matches!(result, Err(DecodeError::Io(_))));
    }

    #[tokio::test]
    async fn test_unknown_tag_then_recover() {
        let mut wire = vec![0x7f];
        wire.extend(encode_message(b"next"));
        let mut reader = &wire[..];
        let decoder = FrameDecoder::default();

        let err = decoder.decode(&mut reader).await.unwrap_err();
        assert!(matches!(err, DecodeError::UnknownTag(0x7f)));
        assert!(!err.is_fatal());

        assert_eq!(
            decoder.decode(&mut reader).await.unwrap(),
            Frame::Message(b"next".to_vec())
        );
    }

    #[tokio::test]
    async fn test_oversized_message_is_skipped() {
        let decoder = FrameDecoder::new(8);
        let mut wire = encode_message(&[1u8; 32]);
        wire.extend(encode_message(b"small"));
        let mut reader = &wire[..];

        let err = decoder.decode(&mut reader).await.unwrap_err();
        assert!(matches!(err, DecodeError::Oversized { len: 32, max: 8 }));

        assert_eq!(
            decoder.decode(&mut reader).await.unwrap(),
            Frame::Message(b"small".to_vec())
        );
    }

    #[tokio::test]
    async fn test_exact_reader_stops_at_len() {
        let wire = b"0123456789";
        let mut reader = &wire[..];

        let mut out = Vec::new();
        exact_reader(&mut reader, 4).read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123");
        assert_eq!(reader, b"456789");
    }

    #[tokio::test]
    async fn test_exact_reader_short_stream() {
        let mut exact = exact_reader(&b"abc"[..], 10);
        let mut out = Vec::new();
        let err = exact.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
        assert_eq!(exact.remaining(), 7);
    }
}
