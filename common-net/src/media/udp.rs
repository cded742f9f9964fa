use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{media_queue, sdp, MediaEngine, MediaError, MediaUnit, NegotiationOutcome};
use crate::clock::Clock;
use crate::error::NegotiationError;
use crate::message::{ControlBody, ControlMessage, PeerRole};
use crate::metrics::media_metrics;
use crate::peer::PeerId;

const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Default)]
struct PeerMedia {
    local_description: bool,
    remote_description: bool,
    remote_addr: Option<SocketAddr>,
    established: bool,
}

impl PeerMedia {
    /// True exactly once: the first time both descriptions and a remote
    /// candidate are known.
    fn try_establish(&mut self) -> bool {
        if self.established
            || !self.local_description
            || !self.remote_description
            || self.remote_addr.is_none()
        {
            return false;
        }
        self.established = true;
        true
    }
}

/// Media engine sending bincode-encoded units as UDP datagrams to each
/// peer's host candidate.
pub struct UdpMediaEngine {
    socket: Arc<UdpSocket>,
    advertised: SocketAddr,
    session_id: u64,
    peers: Arc<Mutex<HashMap<PeerId, PeerMedia>>>,
    units: broadcast::Sender<MediaUnit>,
    receiver: JoinHandle<()>,
}

impl UdpMediaEngine {
    /// Binds `bind` and starts the receive task. When `advertise_ip` is unset
    /// the bound IP is advertised, or loopback for a wildcard bind.
    pub async fn bind(
        bind: SocketAddr,
        advertise_ip: Option<IpAddr>,
        clock: Arc<dyn Clock>,
        queue_capacity: usize,
    ) -> Result<Self, MediaError> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let local = socket.local_addr()?;
        let ip = advertise_ip.unwrap_or_else(|| {
            if local.ip().is_unspecified() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                local.ip()
            }
        });
        let advertised = SocketAddr::new(ip, local.port());
        let (units, _) = media_queue(queue_capacity);
        let peers = Arc::new(Mutex::new(HashMap::new()));
        let receiver = tokio::spawn(receive_loop(
            socket.clone(),
            peers.clone(),
            units.clone(),
            clock,
        ));

        info!(%local, %advertised, "udp media engine bound");
        Ok(Self {
            socket,
            advertised,
            session_id: u64::from(local.port()),
            peers,
            units,
            receiver,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, MediaError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<PeerId, PeerMedia>> {
        lock_peers(&self.peers)
    }

    fn local_messages(&self, role: PeerRole, answer: bool) -> Vec<ControlMessage> {
        let description = sdp::build(self.session_id, self.advertised, role);
        let description = if answer {
            ControlMessage::answer(description)
        } else {
            ControlMessage::offer(description, role)
        };
        vec![
            description,
            ControlMessage::candidate(
                sdp::candidate_line(self.advertised),
                Some(sdp::VIDEO_MID.to_owned()),
                Some(0),
            ),
        ]
    }
}

impl Drop for UdpMediaEngine {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

#[async_trait]
impl MediaEngine for UdpMediaEngine {
    async fn create_offer(
        &self,
        peer: &PeerId,
        role: PeerRole,
    ) -> Result<Vec<ControlMessage>, NegotiationError> {
        self.peers().entry(peer.clone()).or_default().local_description = true;
        Ok(self.local_messages(role, false))
    }

    async fn negotiate(
        &self,
        peer: &PeerId,
        message: &ControlMessage,
    ) -> Result<NegotiationOutcome, NegotiationError> {
        let mut replies = Vec::new();
        let mut peers = self.peers();
        let state = peers.entry(peer.clone()).or_default();

        match message.body() {
            ControlBody::Offer { sdp: remote, role } => {
                sdp::validate(remote)?;
                state.remote_description = true;
                if !state.local_description {
                    state.local_description = true;
                    replies = self.local_messages(*role, true);
                }
            }
            ControlBody::Answer { sdp: remote } => {
                sdp::validate(remote)?;
                if !state.local_description {
                    return Err(NegotiationError::Rejected("answer without a local offer".into()));
                }
                state.remote_description = true;
            }
            ControlBody::Candidate { candidate, .. } => {
                state.remote_addr = Some(sdp::parse_candidate(candidate)?);
            }
            other => {
                return Err(NegotiationError::Rejected(format!(
                    "{} is not a negotiation message",
                    other.kind()
                )));
            }
        }

        let established = state.try_establish();
        if established {
            debug!(%peer, remote = ?state.remote_addr, "media path established");
        }
        Ok(NegotiationOutcome {
            replies,
            established,
        })
    }

    async fn send_media_unit(&self, unit: &MediaUnit) -> Result<usize, MediaError> {
        let targets: Vec<SocketAddr> = self
            .peers()
            .values()
            .filter(|peer| peer.established)
            .filter_map(|peer| peer.remote_addr)
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let bytes = unit.encode()?;
        let mut delivered = 0;
        for target in targets {
            match self.socket.send_to(&bytes, target).await {
                Ok(_) => delivered += 1,
                Err(err) => debug!(%err, %target, "media send failed"),
            }
        }
        media_metrics().inc_sent(delivered as u64);
        Ok(delivered)
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaUnit> {
        self.units.subscribe()
    }

    fn release(&self, peer: &PeerId) {
        if self.peers().remove(peer).is_some() {
            debug!(%peer, "media peer released");
        }
    }
}

fn lock_peers(peers: &Mutex<HashMap<PeerId, PeerMedia>>) -> MutexGuard<'_, HashMap<PeerId, PeerMedia>> {
    peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Publishes units arriving from a negotiated remote candidate. Datagrams
/// from any other source are dropped.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<HashMap<PeerId, PeerMedia>>>,
    units: broadcast::Sender<MediaUnit>,
    clock: Arc<dyn Clock>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!(%err, "media socket receive failed");
                continue;
            }
        };
        let arrival = clock.now_micros();
        let known = lock_peers(&peers)
            .values()
            .any(|peer| peer.remote_addr == Some(from));
        if !known {
            debug!(%from, len, "dropping datagram from unknown source");
            continue;
        }
        match MediaUnit::decode(&buf[..len]) {
            // No subscribers is fine; the unit is simply not consumed.
            Ok(unit) => {
                let _ = units.send(unit.arrived_at(arrival));
            }
            Err(err) => debug!(%err, %from, "dropping undecodable datagram"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::media::recv_latest;
    use std::time::Duration;

    async fn engine(clock: Arc<dyn Clock>) -> UdpMediaEngine {
        UdpMediaEngine::bind("127.0.0.1:0".parse().expect("addr"), None, clock, 8)
            .await
            .expect("bind")
    }

    #[tokio::test]
    async fn offer_answer_candidate_establishes_once() {
        let clock = ManualClock::starting_at(0);
        let offerer = engine(clock.clone()).await;
        let answerer = engine(clock).await;
        let a = PeerId::from("a");
        let b = PeerId::from("b");

        let offer = offerer.create_offer(&b, PeerRole::Viewer).await.expect("offer");
        assert_eq!(offer.len(), 2);

        let outcome = answerer.negotiate(&a, &offer[0]).await.expect("offer in");
        assert!(!outcome.established);
        assert_eq!(outcome.replies.len(), 2);
        let outcome = answerer.negotiate(&a, &offer[1]).await.expect("candidate in");
        assert!(outcome.established);
        let again = answerer.negotiate(&a, &offer[1]).await.expect("duplicate candidate");
        assert!(!again.established);

        let replies = answerer
            .negotiate(&PeerId::from("c"), &offer[0])
            .await
            .expect("other peer")
            .replies;
        let first = offerer.negotiate(&b, &replies[0]).await.expect("answer");
        assert!(!first.established);
        let second = offerer.negotiate(&b, &replies[1]).await.expect("candidate");
        assert!(second.established);
    }

    #[tokio::test]
    async fn malformed_sdp_is_a_negotiation_error() {
        let engine = engine(ManualClock::starting_at(0)).await;
        let err = engine
            .negotiate(&PeerId::from("x"), &ControlMessage::offer("nope", PeerRole::Viewer))
            .await
            .expect_err("malformed");
        assert!(matches!(err, NegotiationError::MalformedSdp(_)));
    }

    #[tokio::test]
    async fn units_reach_established_peers_with_arrival_stamp() {
        let clock = ManualClock::starting_at(5_000);
        let sender = engine(clock.clone()).await;
        let receiver = engine(clock.clone()).await;
        let peer = PeerId::from("receiver");
        let mut units = receiver.subscribe();

        assert_eq!(
            sender.send_media_unit(&MediaUnit::new(0, 1, vec![])).await.expect("send"),
            0
        );

        let offer = ControlMessage::offer(
            sdp::build(1, receiver.advertised_addr(), PeerRole::Viewer),
            PeerRole::Viewer,
        );
        let candidate =
            ControlMessage::candidate(sdp::candidate_line(receiver.advertised_addr()), None, None);
        sender.negotiate(&peer, &offer).await.expect("offer");
        assert!(sender.negotiate(&peer, &candidate).await.expect("candidate").established);
        let sender_candidate =
            ControlMessage::candidate(sdp::candidate_line(sender.advertised_addr()), None, None);
        receiver
            .negotiate(&PeerId::from("sender"), &sender_candidate)
            .await
            .expect("sender candidate");

        let sent = sender
            .send_media_unit(&MediaUnit::new(9, 4_000, vec![7; 32]))
            .await
            .expect("send");
        assert_eq!(sent, 1);

        let received = tokio::time::timeout(Duration::from_secs(2), recv_latest(&mut units))
            .await
            .expect("timely")
            .expect("unit");
        assert_eq!(received.unit.sequence, 9);
        assert_eq!(received.unit.arrival_timestamp, Some(5_000));

        sender.release(&peer);
        assert_eq!(
            sender.send_media_unit(&MediaUnit::new(10, 1, vec![])).await.expect("send"),
            0
        );
    }

    #[tokio::test]
    async fn datagrams_from_unknown_sources_are_dropped() {
        let clock = ManualClock::starting_at(0);
        let receiver = engine(clock.clone()).await;
        let sender = engine(clock).await;
        let mut units = receiver.subscribe();

        let stranger = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let forged = MediaUnit::new(1, 0, vec![1; 4]).encode().expect("encode");
        stranger
            .send_to(&forged, receiver.advertised_addr())
            .await
            .expect("send");

        let peer = PeerId::from("receiver");
        let offer = ControlMessage::offer(
            sdp::build(1, receiver.advertised_addr(), PeerRole::Viewer),
            PeerRole::Viewer,
        );
        sender.negotiate(&peer, &offer).await.expect("offer");
        sender
            .negotiate(
                &peer,
                &ControlMessage::candidate(sdp::candidate_line(receiver.advertised_addr()), None, None),
            )
            .await
            .expect("candidate");
        receiver
            .negotiate(
                &PeerId::from("sender"),
                &ControlMessage::candidate(sdp::candidate_line(sender.advertised_addr()), None, None),
            )
            .await
            .expect("sender candidate");
        sender
            .send_media_unit(&MediaUnit::new(2, 0, vec![2; 4]))
            .await
            .expect("send");

        let received = tokio::time::timeout(Duration::from_secs(2), recv_latest(&mut units))
            .await
            .expect("timely")
            .expect("unit");
        assert_eq!(received.unit.sequence, 2);
        assert_eq!(received.dropped, 0);
    }
}
