//! Session error types.

use spcore_wire::{TerminationReason, WireError};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by sessions, supervisors and the fleet manager
#[derive(Error, Debug)]
pub enum SessionError {
    /// Handle has no live session, or the session has no active connection
    #[error("not connected")]
    NotConnected,

    /// Session was stopped; no further requests are accepted
    #[error("session stopped")]
    Stopped,

    /// Request is larger than the peer's body limit or the frame limit
    #[error("message of {size} bytes exceeds negotiated limit of {max} bytes")]
    Oversize {
        /// Encoded message size
        size: usize,
        /// Smaller of the peer's announced limit and the frame limit
        max: u32,
    },

    /// Request lacks a required field
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Outbound queue is full
    #[error("outbound queue full")]
    QueueFull,

    /// Peer sent Terminate
    #[error("peer terminated session: {reason:?}")]
    Terminated {
        /// Reason supplied by the peer
        reason: TerminationReason,
    },

    /// Peer identification failed validation
    #[error("identification rejected: {0}")]
    Identity(String),

    /// No frame arrived within the idle timeout
    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),

    /// Write did not complete within the write timeout
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Connect attempt timed out
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Controller configuration is unusable
    #[error("invalid configuration: {0}")]
    Config(String),

    /// TLS setup or handshake failed
    #[error("tls: {0}")]
    Tls(String),

    /// Framing or encoding failure
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether this error came from the caller rather than the connection
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SessionError::NotConnected
                | SessionError::Stopped
                | SessionError::Oversize { .. }
                | SessionError::MissingField(_)
                | SessionError::QueueFull
        )
    }
}
