//! Media path: the unit exchanged between peers, the engine boundary the
//! session machine negotiates through, and the capture/overlay collaborators.

pub mod sdp;
pub mod synthetic;
pub mod udp;

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::info;

use crate::clock::Micros;
use crate::error::NegotiationError;
use crate::message::{ControlMessage, PeerRole};
use crate::metrics::media_metrics;
use crate::peer::PeerId;

pub use synthetic::SyntheticCapture;
pub use udp::UdpMediaEngine;

/// One encoded video sample. The capture timestamp travels in-band; the
/// arrival timestamp is local to the receiver and never encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUnit {
    pub sequence: u64,
    pub capture_timestamp: Micros,
    #[serde(skip)]
    pub arrival_timestamp: Option<Micros>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl MediaUnit {
    pub fn new(sequence: u64, capture_timestamp: Micros, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            capture_timestamp,
            arrival_timestamp: None,
            payload,
        }
    }

    pub fn arrived_at(mut self, arrival: Micros) -> Self {
        self.arrival_timestamp = Some(arrival);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, MediaError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MediaError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("media io: {0}")]
    Io(#[from] io::Error),
}

/// Result of feeding one negotiation message to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NegotiationOutcome {
    /// Messages to send back over the control channel (answer, candidates).
    pub replies: Vec<ControlMessage>,
    /// Set exactly once per peer, when the media path becomes usable.
    pub established: bool,
}

/// Boundary to whatever moves media between peers. The core only hands it
/// negotiation messages and media units.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Local offer plus the candidates that go with it.
    async fn create_offer(
        &self,
        peer: &PeerId,
        role: PeerRole,
    ) -> Result<Vec<ControlMessage>, NegotiationError>;

    async fn negotiate(
        &self,
        peer: &PeerId,
        message: &ControlMessage,
    ) -> Result<NegotiationOutcome, NegotiationError>;

    /// Best-effort send to every established peer. Returns how many peers
    /// the unit was handed to.
    async fn send_media_unit(&self, unit: &MediaUnit) -> Result<usize, MediaError>;

    /// Stream of received units, arrival-stamped, drop-oldest on overflow.
    fn subscribe(&self) -> broadcast::Receiver<MediaUnit>;

    /// Forget everything about `peer`. Queued units for it are discarded.
    fn release(&self, peer: &PeerId);
}

/// Starts and stops frame production.
pub trait CaptureControl: Send + Sync {
    fn set_playing(&self, playing: bool);
}

/// Receives overlay text verbatim.
pub trait Overlay: Send + Sync {
    fn set_text(&self, text: &str);
}

/// For nodes that consume media and have nothing to start or stop.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl CaptureControl for NoCapture {
    fn set_playing(&self, _playing: bool) {}
}

/// Overlay for headless nodes: the text is logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOverlay;

impl Overlay for LogOverlay {
    fn set_text(&self, text: &str) {
        info!(text, "overlay text updated");
    }
}

/// A unit taken from a drop-oldest queue, with how many older units were
/// discarded since the previous receive.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub unit: MediaUnit,
    pub dropped: u64,
}

/// Bounded media queue. Slow receivers lose the oldest units rather than
/// blocking the producer.
pub fn media_queue(capacity: usize) -> (broadcast::Sender<MediaUnit>, broadcast::Receiver<MediaUnit>) {
    broadcast::channel(capacity.max(1))
}

/// Next unit from a drop-oldest queue. `None` once every sender is gone.
pub async fn recv_latest(rx: &mut broadcast::Receiver<MediaUnit>) -> Option<Received> {
    let mut dropped = 0;
    loop {
        match rx.recv().await {
            Ok(unit) => return Some(Received { unit, dropped }),
            Err(RecvError::Lagged(skipped)) => {
                dropped += skipped;
                media_metrics().inc_dropped(skipped);
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrival_timestamp_is_not_encoded() {
        let unit = MediaUnit::new(3, 100, vec![1, 2, 3]).arrived_at(140);
        let decoded = MediaUnit::decode(&unit.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.sequence, 3);
        assert_eq!(decoded.capture_timestamp, 100);
        assert_eq!(decoded.arrival_timestamp, None);
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(
            MediaUnit::decode(&[0xff; 3]),
            Err(MediaError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn slow_receiver_drops_oldest() {
        let (tx, mut rx) = media_queue(2);
        for sequence in 0..5 {
            tx.send(MediaUnit::new(sequence, 0, Vec::new())).expect("send");
        }

        let first = recv_latest(&mut rx).await.expect("unit");
        assert_eq!(first.dropped, 3);
        assert_eq!(first.unit.sequence, 3);
        let second = recv_latest(&mut rx).await.expect("unit");
        assert_eq!((second.unit.sequence, second.dropped), (4, 0));

        drop(tx);
        assert!(recv_latest(&mut rx).await.is_none());
    }
}
