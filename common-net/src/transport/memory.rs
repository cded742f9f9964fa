use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ControlChannel, TransportError, TransportErrorKind, TransportKind};
use crate::message::{self, ControlMessage};

/// In-process channel carrying encoded units, for tests and simulations.
pub struct MemoryChannel {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryChannel {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }

    /// Push raw bytes, e.g. to exercise decode failures.
    pub fn send_raw(&mut self, bytes: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or_else(TransportError::closed)?;
        tx.send(bytes.into()).map_err(|_| TransportError::closed())
    }
}

#[async_trait]
impl ControlChannel for MemoryChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn send_message(&mut self, message: &ControlMessage) -> Result<(), TransportError> {
        let bytes = message::encode(message).map_err(|err| {
            TransportError::new(TransportErrorKind::EncodingFailure, err.to_string())
        })?;
        self.send_raw(bytes)
    }

    async fn recv_message(&mut self) -> Result<ControlMessage, TransportError> {
        let bytes = self.rx.recv().await.ok_or_else(TransportError::closed)?;
        message::decode(&bytes)
            .map_err(|err| TransportError::new(TransportErrorKind::DecodingFailure, err.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}
