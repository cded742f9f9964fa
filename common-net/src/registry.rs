use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::{duration_micros, Clock};
use crate::error::SessionError;
use crate::message::{ControlBody, ControlMessage, PeerRole};
use crate::metrics::signaling_metrics;
use crate::peer::{CloseReason, PeerId, PeerSession, PeerState, SessionInput};
use crate::shutdown::ShutdownReceiver;

/// How `route` delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Delivered to the originating session only.
    Direct,
    /// Delivered to the originating session and relayed to `recipients`
    /// other live sessions.
    Broadcast { recipients: usize },
    /// Unknown or closed origin.
    Dropped,
}

/// The set of sessions a node holds. All mutation goes through this type;
/// per-session work is only ever enqueued, never awaited, under the lock.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<PeerId, PeerSession>>,
    clock: Arc<dyn Clock>,
    liveness_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>, liveness_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
            liveness_timeout,
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Returns false if a live session with the same id is already held.
    pub async fn register(&self, session: PeerSession) -> bool {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(session.id()) {
            if !existing.handle.is_closed() {
                warn!(peer = %session.id(), "duplicate session id rejected");
                return false;
            }
        }
        debug!(peer = %session.id(), "session registered");
        sessions.insert(session.id().clone(), session);
        signaling_metrics().set_active_sessions(sessions.len());
        true
    }

    /// Remove `id`, asking its task to close if it is still running.
    pub async fn unregister(&self, id: &PeerId) -> Option<PeerSession> {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.remove(id);
        if let Some(session) = &removed {
            session.handle.close(CloseReason::Requested);
            debug!(peer = %id, "session unregistered");
        }
        signaling_metrics().set_active_sessions(sessions.len());
        removed
    }

    pub async fn close(&self, id: &PeerId, reason: CloseReason) -> bool {
        let sessions = self.sessions.lock().await;
        sessions
            .get(id)
            .map(|session| session.handle.close(reason))
            .unwrap_or(false)
    }

    /// Deliver a message received from `from`. Broadcast-class commands from
    /// a controller are also relayed to every other CONNECTED or PAUSED
    /// session.
    pub async fn route(&self, from: &PeerId, message: ControlMessage) -> Route {
        let now = self.clock.now_micros();
        let kind = message.kind();
        let mut sessions = self.sessions.lock().await;

        let Some(origin) = sessions.get_mut(from) else {
            debug!(peer = %from, %kind, "message from unknown session dropped");
            return Route::Dropped;
        };
        if origin.handle.is_closed() {
            debug!(peer = %from, %kind, "message for closed session dropped");
            return Route::Dropped;
        }

        origin.last_seen_at = now;
        if let ControlBody::Offer { role, .. } = message.body() {
            if !origin.role_announced && origin.state() == PeerState::New {
                origin.role = *role;
                origin.role_announced = true;
            } else if origin.role != *role {
                warn!(peer = %from, announced = ?origin.role, offered = ?role, "role change in later offer ignored");
            }
        }
        signaling_metrics().inc_routed(kind);

        let fan_out =
            kind.is_broadcast() && origin.role.is_controller() && origin.state().is_live();
        let relay = fan_out.then(|| message.clone());
        if !origin.handle.send(SessionInput::Remote(message)) {
            return Route::Dropped;
        }

        let Some(relay) = relay else {
            return Route::Direct;
        };
        let recipients = sessions
            .values()
            .filter(|session| session.id() != from && session.state().is_live())
            .filter(|session| session.handle.send(SessionInput::Relay(relay.clone())))
            .count();
        debug!(peer = %from, %kind, recipients, "command broadcast");
        Route::Broadcast { recipients }
    }

    pub async fn send_to(&self, id: &PeerId, input: SessionInput) -> bool {
        let sessions = self.sessions.lock().await;
        sessions
            .get(id)
            .map(|session| session.handle.send(input))
            .unwrap_or(false)
    }

    /// Close sessions silent for longer than the liveness timeout and drop
    /// already-closed ones. Returns the ids that timed out.
    pub async fn sweep(&self) -> Vec<PeerId> {
        let now = self.clock.now_micros();
        let limit = duration_micros(self.liveness_timeout);
        let mut timed_out = Vec::new();
        let mut sessions = self.sessions.lock().await;

        sessions.retain(|id, session| {
            if session.handle.is_closed() {
                return false;
            }
            if now - session.last_seen_at > limit {
                session.handle.close(CloseReason::Error(SessionError::LivenessTimeout(
                    self.liveness_timeout,
                )));
                timed_out.push(id.clone());
                return false;
            }
            true
        });
        signaling_metrics().set_active_sessions(sessions.len());

        for id in &timed_out {
            info!(peer = %id, timeout = ?self.liveness_timeout, "session timed out");
        }
        timed_out
    }

    pub async fn state_of(&self, id: &PeerId) -> Option<PeerState> {
        self.sessions.lock().await.get(id).map(PeerSession::state)
    }

    pub async fn role_of(&self, id: &PeerId) -> Option<PeerRole> {
        self.sessions.lock().await.get(id).map(|session| session.role)
    }

    pub async fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn close_all(&self, reason: CloseReason) {
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values() {
            session.handle.close(reason.clone());
        }
        sessions.clear();
        signaling_metrics().set_active_sessions(0);
    }
}

/// Run `sweep` every `interval` until shutdown.
pub fn spawn_sweeper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    mut shutdown_rx: ShutdownReceiver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    registry.sweep().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
