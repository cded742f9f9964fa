use tokio::sync::{mpsc, watch};

use super::{PeerId, PeerState};
use crate::clock::Micros;
use crate::error::SessionError;
use crate::message::{ControlMessage, PeerRole};

/// Work queued to a session task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    /// Start negotiating: send an offer announcing `PeerRole`.
    Open(PeerRole),
    /// A message received from this session's own peer.
    Remote(ControlMessage),
    /// A broadcast command that originated at another peer. Applied to this
    /// session's state and forwarded to its peer.
    Relay(ControlMessage),
    /// A locally originated command for this session's peer.
    Send(ControlMessage),
    /// Out-of-band establishment signal from the media engine.
    MediaEstablished,
    Close(CloseReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    Requested,
    Error(SessionError),
}

impl CloseReason {
    pub fn label(&self) -> &'static str {
        match self {
            CloseReason::Requested => "requested",
            CloseReason::Error(err) => err.label(),
        }
    }
}

/// Notifications published by session tasks for node-level observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        id: PeerId,
        from: PeerState,
        to: PeerState,
    },
    Failed {
        id: PeerId,
        error: SessionError,
    },
}

/// Cloneable handle to a running session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: PeerId,
    inbox: mpsc::UnboundedSender<SessionInput>,
    state: watch::Receiver<PeerState>,
    clock_offset: watch::Receiver<Option<Micros>>,
}

impl SessionHandle {
    pub fn new(
        id: PeerId,
        inbox: mpsc::UnboundedSender<SessionInput>,
        state: watch::Receiver<PeerState>,
        clock_offset: watch::Receiver<Option<Micros>>,
    ) -> Self {
        Self {
            id,
            inbox,
            state,
            clock_offset,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed() || self.inbox.is_closed()
    }

    /// Queue `input` without waiting. Returns false once the task has exited.
    pub fn send(&self, input: SessionInput) -> bool {
        self.inbox.send(input).is_ok()
    }

    pub fn close(&self, reason: CloseReason) -> bool {
        self.send(SessionInput::Close(reason))
    }

    /// Estimated `local - remote` clock offset, once the ping handshake has
    /// produced a sample.
    pub fn clock_offset(&self) -> Option<Micros> {
        *self.clock_offset.borrow()
    }

    pub fn clock_offset_watch(&self) -> watch::Receiver<Option<Micros>> {
        self.clock_offset.clone()
    }

    /// Wait until the session reaches a state matching `predicate`. Returns
    /// the final state if the task exits first.
    pub async fn wait_for(&self, predicate: impl Fn(PeerState) -> bool) -> PeerState {
        let mut state = self.state.clone();
        let result = state
            .wait_for(|current| predicate(*current))
            .await
            .map(|current| *current);
        match result {
            Ok(current) => current,
            Err(_) => *state.borrow(),
        }
    }
}

/// Registry record for one remote endpoint.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub handle: SessionHandle,
    /// Role announced in the peer's first offer; viewer until one arrives.
    pub role: PeerRole,
    /// Set once the first offer has fixed `role`.
    pub role_announced: bool,
    /// Last time a message from this peer was routed.
    pub last_seen_at: Micros,
}

impl PeerSession {
    pub fn new(handle: SessionHandle, created_at: Micros) -> Self {
        Self {
            handle,
            role: PeerRole::default(),
            role_announced: false,
            last_seen_at: created_at,
        }
    }

    pub fn id(&self) -> &PeerId {
        self.handle.id()
    }

    pub fn state(&self) -> PeerState {
        self.handle.state()
    }
}
