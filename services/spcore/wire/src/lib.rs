//! Wire protocol framing and message schema for SpCore controllers.
//!
//! This crate provides the low-level wire protocol spoken between the host
//! and access-control controllers: the fixed frame header, async frame I/O,
//! and the protobuf message schema carried in frame bodies.
//!
//! ## Features
//!
//! - **Fixed Header**: 2-byte magic plus 4-byte length, validated before the body is read
//! - **Bounded Bodies**: frames never exceed [`MAX_BODY_LENGTH`] bytes
//! - **Self-Checked Encoding**: outbound bodies are re-parsed before they are sent
//! - **Typed Messages**: `prost` message types for the kinds the session layer consumes
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u16 magic (0x3E4B)   | big-endian                 |
//! +----------------------+----------------------------+
//! | u32 length           | big-endian, 0..=131071     |
//! +----------------------+----------------------------+
//! | body                 | protobuf SpCoreMessage     |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod message;

// Re-export main types
pub use codec::{decode_message, encode_message, MessageReader, MessageWriter};
pub use error::WireError;
pub use frame::{encode_frame, read_frame, write_frame};
pub use header::{FrameHeader, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_BODY_LENGTH};
pub use message::{
    ConfigChange, ConfigChangeResult, ConfigRecord, DeviceActionRequest, DeviceActionResult,
    DeviceActionType, DeviceStateRecord, Event, EventFlow, EventFlowControl, Identification,
    MessageKind, ProtocolCapabilities, SpCoreMessage, TerminationReason,
};
