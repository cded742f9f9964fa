use std::net::SocketAddr;
use std::sync::Arc;

use common_net::{
    config::SessionSettings,
    link::{self, LinkEnd},
    peer::{Collaborators, PeerId, PeerMachine},
    registry::SessionRegistry,
    shutdown::ShutdownReceiver,
    transport::{ControlChannel, WsChannel},
};
use tokio::{net::TcpListener, task::JoinSet};
use tracing::{error, info, warn};

/// Accepts control channels and runs one answering session per channel.
#[derive(Clone)]
pub struct RobotNode {
    registry: Arc<SessionRegistry>,
    collab: Collaborators,
    settings: SessionSettings,
}

impl RobotNode {
    pub fn new(
        registry: Arc<SessionRegistry>,
        collab: Collaborators,
        settings: SessionSettings,
    ) -> Self {
        Self {
            registry,
            collab,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept connections until shutdown. Returns the connection tasks that
    /// are still running so the caller can drain them.
    pub async fn serve(&self, listener: TcpListener, mut shutdown_rx: ShutdownReceiver) -> JoinSet<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let node = self.clone();
                        connections.spawn(async move {
                            match WsChannel::accept(stream).await {
                                Ok(mut channel) => node.serve_channel(&mut channel, remote).await,
                                Err(err) => warn!(%remote, %err, "websocket handshake failed"),
                            }
                        });
                    }
                    Err(err) => error!(%err, "accept failed"),
                },
                // Reap finished connections so the set does not grow unbounded.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections
    }

    /// Run one answering session over `channel` until either side ends it.
    pub async fn serve_channel<C>(&self, channel: &mut C, remote: SocketAddr)
    where
        C: ControlChannel + ?Sized,
    {
        let id = PeerId::random();
        info!(peer = %id, %remote, "peer connected");
        let parts = PeerMachine::build(id.clone(), self.collab.clone(), self.settings.clone());

        match link::run_session(channel, &self.registry, parts, None, |_| {}).await {
            Ok(LinkEnd::RemoteClosed) => info!(peer = %id, %remote, "peer disconnected"),
            Ok(LinkEnd::SessionClosed) => info!(peer = %id, %remote, "session ended by robot"),
            Err(err) => warn!(peer = %id, %remote, %err, "control channel failed"),
        }
    }
}
