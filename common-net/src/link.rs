use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::message::{ControlMessage, PeerRole};
use crate::metrics::signaling_metrics;
use crate::peer::{CloseReason, PeerId, SessionInput, SessionParts};
use crate::registry::{Route, SessionRegistry};
use crate::transport::{ControlChannel, TransportError, TransportErrorKind};

/// Why a link stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEnd {
    /// The remote end closed the channel.
    RemoteClosed,
    /// The session task finished; pending outbound messages were flushed.
    SessionClosed,
}

/// Pump one control channel: inbound units are decoded and routed through
/// the registry as coming from `peer`, and the session's outbound messages
/// are written in order. `observer` sees every decoded inbound message
/// before it is routed.
///
/// Undecodable units are logged and skipped. Any other transport error ends
/// the link and is returned.
pub async fn drive<C, F>(
    channel: &mut C,
    registry: &SessionRegistry,
    peer: &PeerId,
    outbound: &mut mpsc::UnboundedReceiver<ControlMessage>,
    mut observer: F,
) -> Result<LinkEnd, TransportError>
where
    C: ControlChannel + ?Sized,
    F: FnMut(&ControlMessage) + Send,
{
    loop {
        tokio::select! {
            biased;

            outgoing = outbound.recv() => match outgoing {
                Some(message) => channel.send_message(&message).await?,
                None => {
                    if let Err(err) = channel.close().await {
                        debug!(%peer, %err, "close after session end failed");
                    }
                    return Ok(LinkEnd::SessionClosed);
                }
            },
            incoming = channel.recv_message() => match incoming {
                Ok(message) => {
                    observer(&message);
                    let kind = message.kind();
                    if registry.route(peer, message).await == Route::Dropped {
                        debug!(%peer, %kind, "inbound message not routed");
                    }
                }
                Err(err) if err.is_recoverable() => {
                    signaling_metrics().inc_decode_errors();
                    warn!(%peer, %err, "undecodable control unit skipped");
                }
                Err(err) if err.is_closed() => return Ok(LinkEnd::RemoteClosed),
                Err(err) => return Err(err),
            }
        }
    }
}

/// Register a freshly built session, run its task and drive `channel` until
/// either side ends. When `open` is set the session starts by sending an
/// offer with that role. The session is always closed and unregistered
/// before returning.
pub async fn run_session<C, F>(
    channel: &mut C,
    registry: &SessionRegistry,
    parts: SessionParts,
    open: Option<PeerRole>,
    observer: F,
) -> Result<LinkEnd, TransportError>
where
    C: ControlChannel + ?Sized,
    F: FnMut(&ControlMessage) + Send,
{
    let SessionParts {
        machine,
        session,
        inbox,
        mut outbound,
    } = parts;
    let handle = session.handle.clone();
    let id = handle.id().clone();

    if !registry.register(session).await {
        return Err(TransportError::new(
            TransportErrorKind::Unsupported,
            format!("session {id} is already registered"),
        ));
    }
    let task = tokio::spawn(machine.run(inbox));
    if let Some(role) = open {
        handle.send(SessionInput::Open(role));
    }

    let result = drive(channel, registry, &id, &mut outbound, observer).await;

    let reason = match &result {
        Err(err) => CloseReason::Error(SessionError::Transport(err.to_string())),
        Ok(_) => CloseReason::Requested,
    };
    handle.close(reason);
    registry.unregister(&id).await;
    match task.await {
        Ok(state) => debug!(peer = %id, %state, ?result, "session finished"),
        Err(err) => warn!(peer = %id, %err, "session task failed"),
    }

    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SessionSettings;
    use crate::media::{MediaEngine, UdpMediaEngine};
    use crate::message::ControlKind;
    use crate::peer::{Collaborators, PeerMachine, PeerState};
    use crate::transport::MemoryChannel;

    async fn collaborators(clock: Arc<ManualClock>) -> Collaborators {
        let engine: Arc<dyn MediaEngine> = Arc::new(
            UdpMediaEngine::bind("127.0.0.1:0".parse().expect("addr"), None, clock.clone(), 8)
                .await
                .expect("bind"),
        );
        Collaborators::new(engine, clock)
    }

    #[tokio::test]
    async fn two_links_negotiate_and_survive_garbage() {
        let clock = ManualClock::starting_at(1_000);
        let settings = SessionSettings::default().without_ping();
        let answerer_registry = Arc::new(SessionRegistry::new(clock.clone(), Duration::from_secs(30)));
        let offerer_registry = SessionRegistry::new(clock.clone(), Duration::from_secs(30));
        let (mut near, mut far) = MemoryChannel::pair();

        let answerer_parts = PeerMachine::build(
            PeerId::from("offerer"),
            collaborators(clock.clone()).await,
            settings.clone(),
        );
        let answerer = {
            let registry = answerer_registry.clone();
            tokio::spawn(async move {
                run_session(&mut far, &registry, answerer_parts, None, |_| {}).await
            })
        };

        near.send_raw(b"\x00garbage".to_vec()).expect("raw");

        let offerer_parts = PeerMachine::build(
            PeerId::from("answerer"),
            collaborators(clock.clone()).await,
            settings,
        );
        let offerer_handle = offerer_parts.session.handle.clone();
        let mut seen = Vec::new();
        let offerer = run_session(
            &mut near,
            &offerer_registry,
            offerer_parts,
            Some(PeerRole::Controller),
            |message| seen.push(message.kind()),
        );

        let watcher = async {
            offerer_handle.wait_for(|state| state == PeerState::Connected).await;
            let peer = PeerId::from("offerer");
            let answerer_state = loop {
                match answerer_registry.state_of(&peer).await {
                    Some(PeerState::Connected) => break PeerState::Connected,
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            };
            assert_eq!(answerer_registry.role_of(&peer).await, Some(PeerRole::Controller));
            offerer_handle.close(CloseReason::Requested);
            answerer_state
        };

        let (end, answerer_state) = tokio::join!(offerer, watcher);
        assert_eq!(end.expect("offerer link"), LinkEnd::SessionClosed);
        assert_eq!(answerer_state, PeerState::Connected);
        assert_eq!(seen, vec![ControlKind::Answer, ControlKind::Candidate]);

        let answerer_end = answerer.await.expect("join").expect("answerer link");
        assert_eq!(answerer_end, LinkEnd::RemoteClosed);
        assert!(answerer_registry.is_empty().await);
    }
}
