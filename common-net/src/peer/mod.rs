//! Per-peer connection state machine.
//!
//! [`state`] holds the pure transition table, [`session`] the handle the
//! registry keeps for each peer, and [`machine`] the task that owns a
//! session's state and talks to the media collaborators.

pub mod machine;
pub mod session;
pub mod state;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use machine::{Collaborators, PeerMachine, SessionParts};
pub use session::{CloseReason, PeerSession, SessionEvent, SessionHandle, SessionInput};
pub use state::{PeerEvent, PeerState};

/// Opaque identifier, one per remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
