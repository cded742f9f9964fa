use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Paused,
    /// Terminal. Reconnecting requires a fresh session.
    Closed,
}

/// Inputs that can move a session between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    OfferSent,
    OfferReceived,
    MediaEstablished,
    PauseReceived,
    PlayReceived,
    Close,
}

impl PeerState {
    /// Next state after `event`. Events with no transition leave the state
    /// unchanged.
    pub fn on(self, event: PeerEvent) -> PeerState {
        use PeerEvent::*;
        use PeerState::*;

        match (self, event) {
            (Closed, _) => Closed,
            (_, Close) => Closed,
            (New, OfferSent | OfferReceived) => Negotiating,
            (Negotiating, MediaEstablished) => Connected,
            (Connected, PauseReceived) => Paused,
            (Paused, PlayReceived) => Connected,
            (state, _) => state,
        }
    }

    /// CONNECTED or PAUSED: the states in which commands are processed.
    pub fn is_live(self) -> bool {
        matches!(self, PeerState::Connected | PeerState::Paused)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, PeerState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::New => "NEW",
            PeerState::Negotiating => "NEGOTIATING",
            PeerState::Connected => "CONNECTED",
            PeerState::Paused => "PAUSED",
            PeerState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
