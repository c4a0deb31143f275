//! Wire protocol error types.

use std::io;
use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame did not start with the protocol magic; the stream is unrecoverable
    #[error("bad frame magic: expected {expected:#06x}, found {found:#06x}")]
    BadMagic {
        /// Magic the reader expected
        expected: u16,
        /// Magic actually read from the stream
        found: u16,
    },

    /// Declared (or requested) body length outside `0..=MAX_BODY_LENGTH`
    #[error("frame length out of range: {0}")]
    LengthOutOfRange(i64),

    /// Peer closed the stream before a complete frame arrived
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Body could not be decoded as a protocol message
    #[error("message decode failed: {0}")]
    Decode(prost::DecodeError),

    /// Freshly encoded body failed to parse back; never sent
    #[error("encoded message failed self-check: {0}")]
    Reparse(prost::DecodeError),

    /// Message could not be encoded
    #[error("message encode failed: {0}")]
    Encode(#[from] prost::EncodeError),

    /// Underlying stream error
    #[error("io error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            WireError::UnexpectedEof
        } else {
            WireError::Io(err)
        }
    }
}

impl WireError {
    /// Whether this error means the peer went away rather than sent garbage
    pub fn is_disconnect(&self) -> bool {
        match self {
            WireError::UnexpectedEof => true,
            WireError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
