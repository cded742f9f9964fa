//! The control channel: one ordered, reliable, message-oriented connection
//! per peer carrying encoded `ControlMessage`s in both directions.

pub mod memory;
pub mod ws;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::ControlMessage;

pub use memory::MemoryChannel;
pub use ws::WsChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => f.write_str("websocket"),
            TransportKind::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Io,
    EncodingFailure,
    /// One unit could not be decoded. The channel itself is still usable.
    DecodingFailure,
    ConnectionClosed,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn closed() -> Self {
        Self::new(TransportErrorKind::ConnectionClosed, "channel closed")
    }

    /// Whether reading may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        self.kind == TransportErrorKind::DecodingFailure
    }

    pub fn is_closed(&self) -> bool {
        self.kind == TransportErrorKind::ConnectionClosed
    }
}

/// Each `send_message` corresponds to exactly one `recv_message` on the
/// other end.
#[async_trait]
pub trait ControlChannel: Send {
    fn kind(&self) -> TransportKind;

    async fn send_message(&mut self, message: &ControlMessage) -> Result<(), TransportError>;

    /// Next message. A `DecodingFailure` consumes one bad unit; callers log it
    /// and keep reading.
    async fn recv_message(&mut self) -> Result<ControlMessage, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_decode_failures_are_recoverable() {
        assert!(TransportError::new(TransportErrorKind::DecodingFailure, "x").is_recoverable());
        assert!(!TransportError::closed().is_recoverable());
        assert!(TransportError::closed().is_closed());
    }
}
