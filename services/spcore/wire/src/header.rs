//! Frame header for the SpCore wire protocol.
//!
//! Every frame starts with a 2-byte magic followed by a 4-byte body length,
//! both big-endian. The length is validated before any body byte is read.

use bytes::{Buf, BufMut};

use crate::WireError;

/// Magic that opens every frame
pub const FRAME_MAGIC: u16 = 0x3E4B;

/// Largest body a frame may carry
pub const MAX_BODY_LENGTH: u32 = 0x0001_ffff;

/// Size of the magic field in bytes
pub const MAGIC_SIZE: usize = 2;

/// Size of the length field in bytes
pub const LENGTH_SIZE: usize = 4;

/// Total header size in bytes
pub const FRAME_HEADER_SIZE: usize = MAGIC_SIZE + LENGTH_SIZE;

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length in bytes
    pub length: u32,
}

impl FrameHeader {
    /// Header for a body of the given size, rejecting oversized bodies
    pub fn for_body(len: usize) -> Result<Self, WireError> {
        match u32::try_from(len) {
            Ok(length) if length <= MAX_BODY_LENGTH => Ok(Self { length }),
            _ => Err(WireError::LengthOutOfRange(len as i64)),
        }
    }

    /// Encode magic and length into the buffer
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(FRAME_MAGIC);
        buf.put_u32(self.length);
    }

    /// Encode into a fresh array
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        let mut cursor = &mut out[..];
        self.encode(&mut cursor);
        out
    }

    /// Decode a full header from a buffer holding at least [`FRAME_HEADER_SIZE`] bytes
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < FRAME_HEADER_SIZE {
            return Err(WireError::UnexpectedEof);
        }
        check_magic(buf.get_u16())?;
        let length = check_length(buf.get_i32())?;
        Ok(Self { length })
    }
}

/// Validate the magic field
pub fn check_magic(found: u16) -> Result<(), WireError> {
    if found != FRAME_MAGIC {
        return Err(WireError::BadMagic {
            expected: FRAME_MAGIC,
            found,
        });
    }
    Ok(())
}

/// Validate the length field. The field is read signed so that a peer
/// writing a negative length is reported as such.
pub fn check_length(raw: i32) -> Result<u32, WireError> {
    if raw < 0 || raw as u32 > MAX_BODY_LENGTH {
        return Err(WireError::LengthOutOfRange(raw as i64));
    }
    Ok(raw as u32)
}
