//! Message encoding with self-check, and framed message I/O.

use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::frame::{read_frame, write_frame};
use crate::header::MAX_BODY_LENGTH;
use crate::message::SpCoreMessage;
use crate::WireError;

/// Encode a message and parse the bytes back before handing them out.
///
/// A body that does not parse is never returned; the caller gets
/// [`WireError::Reparse`] instead.
pub fn encode_message(message: &SpCoreMessage) -> Result<Bytes, WireError> {
    let body = encode_unchecked(message)?;
    SpCoreMessage::decode(&body[..]).map_err(WireError::Reparse)?;
    Ok(body)
}

/// Encode a message without the self-check
fn encode_unchecked(message: &SpCoreMessage) -> Result<Bytes, WireError> {
    let len = message.encoded_len();
    if len > MAX_BODY_LENGTH as usize {
        return Err(WireError::LengthOutOfRange(len as i64));
    }
    let mut buf = BytesMut::with_capacity(len);
    message.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Decode a frame body
pub fn decode_message(body: &[u8]) -> Result<SpCoreMessage, WireError> {
    SpCoreMessage::decode(body).map_err(WireError::Decode)
}

/// Reads framed messages from a stream
pub struct MessageReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a stream
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read and decode the next message.
    ///
    /// Not cancel safe: dropping the future mid-frame leaves the stream
    /// positioned inside a frame, so only cancel when the stream is being
    /// discarded.
    pub async fn read(&mut self) -> Result<SpCoreMessage, WireError> {
        let body = read_frame(&mut self.inner).await?;
        trace!("read frame body of {} bytes", body.len());
        decode_message(&body)
    }

    /// Recover the underlying stream
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes framed messages to a stream
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Wrap a stream; outbound bodies are re-parsed before sending
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and write one message, returning the body size
    pub async fn write(&mut self, message: &SpCoreMessage) -> Result<usize, WireError> {
        let body = encode_message(message)?;
        write_frame(&mut self.inner, &body).await?;
        trace!("wrote frame body of {} bytes", body.len());
        Ok(body.len())
    }

    /// Recover the underlying stream
    pub fn into_inner(self) -> W {
        self.inner
    }
}
