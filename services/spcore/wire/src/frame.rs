//! Frame reading and writing over async byte streams.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::header::{check_length, check_magic, FrameHeader, FRAME_HEADER_SIZE};
use crate::WireError;

/// Build the complete on-wire representation of one frame
pub fn encode_frame(body: &[u8]) -> Result<Bytes, WireError> {
    let header = FrameHeader::for_body(body.len())?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    header.encode(&mut buf);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Write one frame. Header and body go out in a single buffered write so a
/// frame is never interleaved with another writer's bytes; callers must
/// still serialize access to the stream.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(body)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and return its body.
///
/// The magic is validated before the length is read, and the length before
/// any body byte is read.
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes, WireError>
where
    R: AsyncRead + Unpin,
{
    let magic = reader.read_u16().await?;
    check_magic(magic)?;

    let length = check_length(reader.read_i32().await?)?;

    let mut body = BytesMut::zeroed(length as usize);
    reader.read_exact(&mut body).await?;
    Ok(body.freeze())
}
