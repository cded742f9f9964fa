use std::time::Duration;

use thiserror::Error;

use crate::message::ControlKind;
use crate::peer::PeerState;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure while exchanging offer/answer/candidates. Fatal to the affected
/// session only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("malformed SDP: {0}")]
    MalformedSdp(String),
    #[error("malformed ICE candidate: {0}")]
    MalformedCandidate(String),
    #[error("unexpected {kind} while {state}")]
    Unexpected { kind: ControlKind, state: PeerState },
    #[error("negotiation did not complete within {0:?}")]
    Timeout(Duration),
    #[error("media engine rejected negotiation: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("no message received for {0:?}")]
    LivenessTimeout(Duration),
    #[error("transport failure: {0}")]
    Transport(String),
    /// Latency cannot be computed yet; reporting degrades to "unknown".
    #[error("clock offset has not been estimated")]
    ClockSyncUnavailable,
}

impl SessionError {
    /// Whether the error ends the session it occurred in.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::ClockSyncUnavailable)
    }

    /// Short label used for metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            SessionError::Negotiation(_) => "negotiation",
            SessionError::LivenessTimeout(_) => "liveness_timeout",
            SessionError::Transport(_) => "transport",
            SessionError::ClockSyncUnavailable => "clock_sync_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_clock_sync_is_non_fatal() {
        assert!(!SessionError::ClockSyncUnavailable.is_fatal());
        assert!(SessionError::LivenessTimeout(Duration::from_secs(30)).is_fatal());
        assert!(SessionError::from(NegotiationError::MalformedSdp("x".into())).is_fatal());
    }

    #[test]
    fn unexpected_message_names_kind_and_state() {
        let err = NegotiationError::Unexpected {
            kind: ControlKind::Answer,
            state: PeerState::New,
        };
        assert_eq!(err.to_string(), "unexpected answer while NEW");
    }
}
