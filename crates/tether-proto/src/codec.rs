//! Codec for reading and writing framed control messages

use crate::messages::{Message, MessageType};
use crate::{DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Which part of a frame was being read when the stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSection {
    Header,
    Payload,
}

impl fmt::Display for FrameSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSection::Header => f.write_str("header"),
            FrameSection::Payload => f.write_str("payload"),
        }
    }
}

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Truncated read: stream ended after {received} of {expected} {section} bytes")]
    TruncatedRead {
        section: FrameSection,
        expected: u64,
        received: u64,
    },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("Write error: {0}")]
    WriteError(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether the stream is still positioned on a frame boundary.
    ///
    /// Only an unknown type qualifies: its payload has already been consumed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::UnknownMessageType(_))
    }

    /// True when the peer closed the connection cleanly between frames
    pub fn is_clean_close(&self) -> bool {
        matches!(
            self,
            CodecError::TruncatedRead {
                section: FrameSection::Header,
                received: 0,
                ..
            }
        )
    }
}

/// Reads and writes `[type: u64][length: u64][payload]` frames
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_payload_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl MessageCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Decode one message from `reader`.
    ///
    /// Reads exactly one frame and nothing past it. Fails with
    /// [`CodecError::TruncatedRead`] if the stream ends mid-frame.
    pub async fn read_message<R>(&self, reader: &mut R) -> Result<Message, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; HEADER_SIZE];
        let received = read_full(reader, &mut header).await?;
        if received < HEADER_SIZE {
            return Err(CodecError::TruncatedRead {
                section: FrameSection::Header,
                expected: HEADER_SIZE as u64,
                received: received as u64,
            });
        }

        let mut code = [0u8; 8];
        let mut length = [0u8; 8];
        code.copy_from_slice(&header[..8]);
        length.copy_from_slice(&header[8..]);
        let code = u64::from_be_bytes(code);
        let length = u64::from_be_bytes(length);

        if length > self.max_payload_size as u64 {
            return Err(CodecError::PayloadTooLarge {
                size: length,
                max: self.max_payload_size,
            });
        }

        let mut payload = vec![0u8; length as usize];
        let received = read_full(reader, &mut payload).await?;
        if received < payload.len() {
            return Err(CodecError::TruncatedRead {
                section: FrameSection::Payload,
                expected: length,
                received: received as u64,
            });
        }

        let kind = MessageType::try_from(code).map_err(CodecError::UnknownMessageType)?;

        Ok(Message {
            kind,
            payload: Bytes::from(payload),
        })
    }

    /// Encode `message` onto `writer` and flush.
    ///
    /// Returns the number of bytes written. A failure here leaves the frame
    /// boundary unknown, so callers must treat it as fatal for the connection.
    pub async fn write_message<W>(&self, writer: &mut W, message: &Message) -> Result<u64, CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let frame = encode_frame(message);

        writer
            .write_all(&frame)
            .await
            .map_err(CodecError::WriteError)?;
        writer.flush().await.map_err(CodecError::WriteError)?;

        Ok(frame.len() as u64)
    }
}

/// Serialize a message into a single contiguous frame
pub fn encode_frame(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + message.payload.len());
    buf.put_u64(message.kind.code());
    buf.put_u64(message.payload_len());
    buf.put_slice(&message.payload);
    buf.freeze()
}

/// Fill `buf` from `reader`, looping over short reads.
///
/// Returns the number of bytes read, which is less than `buf.len()` only if
/// the stream reached end-of-file first.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
