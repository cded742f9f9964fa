use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::session::{CloseReason, PeerSession, SessionEvent, SessionHandle, SessionInput};
use super::state::{PeerEvent, PeerState};
use super::PeerId;
use crate::clock::{Clock, Micros};
use crate::config::SessionSettings;
use crate::error::{NegotiationError, SessionError};
use crate::latency::ClockSync;
use crate::media::{CaptureControl, LogOverlay, MediaEngine, NoCapture, Overlay};
use crate::message::{ControlBody, ControlKind, ControlMessage, PeerRole};
use crate::metrics::signaling_metrics;

/// Unanswered pings remembered for matching PONGs.
const MAX_PENDING_PINGS: usize = 8;

/// External collaborators a session forwards to.
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn MediaEngine>,
    pub capture: Arc<dyn CaptureControl>,
    pub overlay: Arc<dyn Overlay>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Media-consuming defaults: nothing to capture, overlay text is logged.
    pub fn new(engine: Arc<dyn MediaEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            capture: Arc::new(NoCapture),
            overlay: Arc::new(LogOverlay),
            clock,
        }
    }

    pub fn with_capture(mut self, capture: Arc<dyn CaptureControl>) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_overlay(mut self, overlay: Arc<dyn Overlay>) -> Self {
        self.overlay = overlay;
        self
    }
}

/// Everything produced when a session is created.
pub struct SessionParts {
    pub machine: PeerMachine,
    /// Registry record; register it before routing anything to the session.
    pub session: PeerSession,
    pub inbox: mpsc::UnboundedReceiver<SessionInput>,
    /// Messages the session wants written to its control channel, in order.
    pub outbound: mpsc::UnboundedReceiver<ControlMessage>,
}

/// Owns one session's state. Runs as its own task; everything else talks to
/// it through the session inbox.
pub struct PeerMachine {
    id: PeerId,
    collab: Collaborators,
    settings: SessionSettings,
    state: watch::Sender<PeerState>,
    clock_offset: watch::Sender<Option<Micros>>,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    sync: ClockSync,
    negotiation_deadline: Option<Instant>,
    next_nonce: u64,
    /// Local send time of each unanswered ping, oldest first.
    pending_pings: VecDeque<(u64, Micros)>,
}

impl PeerMachine {
    pub fn build(id: PeerId, collab: Collaborators, settings: SessionSettings) -> SessionParts {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(PeerState::New);
        let (clock_offset, offset_rx) = watch::channel(None);

        let created_at = collab.clock.now_micros();
        let handle = SessionHandle::new(id.clone(), inbox_tx, state_rx, offset_rx);
        let machine = Self {
            id,
            collab,
            settings,
            state,
            clock_offset,
            outbound: outbound_tx,
            events: None,
            sync: ClockSync::new(),
            negotiation_deadline: None,
            next_nonce: 0,
            pending_pings: VecDeque::new(),
        };

        SessionParts {
            machine,
            session: PeerSession::new(handle, created_at),
            inbox,
            outbound,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    /// Process inputs until the session closes. A dropped inbox counts as an
    /// explicit close.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionInput>) -> PeerState {
        let mut ping = self.settings.ping_interval().map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        while !self.state().is_closed() {
            tokio::select! {
                input = inbox.recv() => match input {
                    Some(input) => self.handle(input).await,
                    None => self.close(CloseReason::Requested),
                },
                _ = sleep_until_opt(self.negotiation_deadline) => {
                    let limit = self.settings.negotiation_timeout();
                    self.fail(NegotiationError::Timeout(limit).into());
                }
                _ = tick_opt(ping.as_mut()) => {
                    if self.state().is_live() {
                        self.send_ping();
                    }
                }
            }
        }

        self.state()
    }

    pub async fn handle(&mut self, input: SessionInput) {
        if self.state().is_closed() {
            debug!(peer = %self.id, ?input, "session closed, input ignored");
            return;
        }

        match input {
            SessionInput::Open(role) => self.open(role).await,
            SessionInput::Remote(message) => self.on_message(message).await,
            SessionInput::Relay(message) => self.on_relay(message),
            SessionInput::Send(message) => self.on_send(message),
            SessionInput::MediaEstablished => self.apply(PeerEvent::MediaEstablished),
            SessionInput::Close(reason) => self.close(reason),
        }
    }

    async fn open(&mut self, role: PeerRole) {
        if self.state() != PeerState::New {
            warn!(peer = %self.id, state = %self.state(), "offer already exchanged");
            return;
        }
        match self.collab.engine.create_offer(&self.id, role).await {
            Ok(messages) => {
                self.apply(PeerEvent::OfferSent);
                for message in messages {
                    self.write(message);
                }
            }
            Err(err) => self.fail(err.into()),
        }
    }

    async fn on_message(&mut self, message: ControlMessage) {
        let state = self.state();
        let kind = message.kind();

        match message.body() {
            ControlBody::Offer { .. } => match state {
                PeerState::New => {
                    self.apply(PeerEvent::OfferReceived);
                    self.negotiate(&message).await;
                }
                PeerState::Negotiating => self.negotiate(&message).await,
                _ => warn!(peer = %self.id, %state, "renegotiation is not supported, offer ignored"),
            },
            ControlBody::Answer { .. } => match state {
                PeerState::Negotiating => self.negotiate(&message).await,
                PeerState::New => self.fail(NegotiationError::Unexpected { kind, state }.into()),
                _ => debug!(peer = %self.id, %state, "late answer ignored"),
            },
            // Trickled candidates may arrive before the offer or after
            // establishment; the engine keeps track of them either way.
            ControlBody::Candidate { .. } => self.negotiate(&message).await,
            ControlBody::Play | ControlBody::Pause => {
                if self.command_allowed(kind) {
                    self.apply_command(kind);
                    self.collab.capture.set_playing(kind == ControlKind::Play);
                }
            }
            ControlBody::Text { message: text } => {
                if self.command_allowed(kind) {
                    self.collab.overlay.set_text(text);
                }
            }
            ControlBody::Ping { nonce } => {
                let now = self.collab.clock.now_micros();
                let ping_sent_at = message.sent_at().unwrap_or(now);
                self.write(ControlMessage::pong(*nonce, ping_sent_at, now));
            }
            ControlBody::Pong { nonce, .. } => {
                // The echoed send time is the peer's claim; only our own
                // record of the ping is trusted.
                let Some(ping_sent_at) = self.take_pending_ping(*nonce) else {
                    debug!(peer = %self.id, nonce, "pong for unknown ping ignored");
                    return;
                };
                let Some(remote_at) = message.sent_at() else {
                    warn!(peer = %self.id, nonce, "pong without timestamp ignored");
                    return;
                };
                let received_at = self.collab.clock.now_micros();
                let Some(sample) = self.sync.record(ping_sent_at, remote_at, received_at) else {
                    warn!(peer = %self.id, nonce, remote_at, "pong timestamp unusable, sample discarded");
                    return;
                };
                if let Ok(offset) = self.sync.offset() {
                    self.clock_offset.send_replace(Some(offset));
                    debug!(
                        peer = %self.id,
                        nonce,
                        round_trip_us = sample.round_trip,
                        offset_us = offset,
                        "clock offset updated"
                    );
                }
            }
        }
    }

    /// A command that another peer issued, fanned out by the registry.
    fn on_relay(&mut self, message: ControlMessage) {
        let kind = message.kind();
        if !self.command_allowed(kind) {
            return;
        }
        self.apply_command(kind);
        self.write(message);
    }

    fn on_send(&mut self, message: ControlMessage) {
        let kind = message.kind();
        if kind.is_command() {
            if !self.command_allowed(kind) {
                return;
            }
            self.apply_command(kind);
        }
        self.write(message);
    }

    async fn negotiate(&mut self, message: &ControlMessage) {
        match self.collab.engine.negotiate(&self.id, message).await {
            Ok(outcome) => {
                for reply in outcome.replies {
                    self.write(reply);
                }
                if outcome.established {
                    self.apply(PeerEvent::MediaEstablished);
                }
            }
            Err(err) => self.fail(err.into()),
        }
    }

    fn command_allowed(&self, kind: ControlKind) -> bool {
        let state = self.state();
        if !state.is_live() {
            warn!(peer = %self.id, %kind, %state, "command before media is connected, ignored");
            return false;
        }
        true
    }

    fn apply_command(&mut self, kind: ControlKind) {
        match kind {
            ControlKind::Play => self.apply(PeerEvent::PlayReceived),
            ControlKind::Pause => self.apply(PeerEvent::PauseReceived),
            _ => {}
        }
    }

    fn apply(&mut self, event: PeerEvent) {
        let from = self.state();
        let to = from.on(event);
        if to == from {
            return;
        }
        self.state.send_replace(to);

        if to == PeerState::Negotiating {
            self.negotiation_deadline = Some(Instant::now() + self.settings.negotiation_timeout());
        } else if from == PeerState::Negotiating {
            self.negotiation_deadline = None;
        }

        info!(peer = %self.id, %from, %to, "session state changed");
        self.emit(SessionEvent::StateChanged {
            id: self.id.clone(),
            from,
            to,
        });

        // Estimate the clock offset as soon as media starts flowing.
        if from == PeerState::Negotiating
            && to == PeerState::Connected
            && self.settings.ping_interval().is_some()
        {
            self.send_ping();
        }
    }

    fn close(&mut self, reason: CloseReason) {
        if self.state().is_closed() {
            return;
        }
        self.apply(PeerEvent::Close);
        self.collab.engine.release(&self.id);
        signaling_metrics().inc_closed(reason.label());

        match reason {
            CloseReason::Requested => info!(peer = %self.id, "session closed"),
            CloseReason::Error(error) => {
                warn!(peer = %self.id, %error, "session failed");
                self.emit(SessionEvent::Failed {
                    id: self.id.clone(),
                    error,
                });
            }
        }
    }

    fn fail(&mut self, error: SessionError) {
        self.close(CloseReason::Error(error));
    }

    fn send_ping(&mut self) {
        let nonce = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        let now = self.collab.clock.now_micros();
        if self.pending_pings.len() == MAX_PENDING_PINGS {
            self.pending_pings.pop_front();
        }
        self.pending_pings.push_back((nonce, now));
        self.write(ControlMessage::ping(nonce, now));
    }

    /// Remove and return the send time of ping `nonce`. Older pings still
    /// pending were lost and are dropped with it.
    fn take_pending_ping(&mut self, nonce: u64) -> Option<Micros> {
        let index = self.pending_pings.iter().position(|(sent, _)| *sent == nonce)?;
        let (_, sent_at) = self.pending_pings.drain(..=index).last()?;
        Some(sent_at)
    }

    fn write(&self, message: ControlMessage) {
        if self.outbound.send(message).is_err() {
            debug!(peer = %self.id, "control channel gone, outbound message dropped");
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn tick_opt(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}
