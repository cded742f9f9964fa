use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::clock::Micros;

/// Largest encoded control message accepted by `decode`.
pub const MAX_MESSAGE_LEN: usize = 1_048_576;

/// Role a peer announces in its offer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Issues PLAY/PAUSE/TEXT that are broadcast to every session.
    Controller,
    #[default]
    Viewer,
    Recorder,
}

impl PeerRole {
    pub fn is_controller(self) -> bool {
        matches!(self, PeerRole::Controller)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Controller => "controller",
            PeerRole::Viewer => "viewer",
            PeerRole::Recorder => "recorder",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of a control message, used for dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Offer,
    Answer,
    Candidate,
    Play,
    Pause,
    Text,
    Ping,
    Pong,
}

impl ControlKind {
    pub const ALL: [ControlKind; 8] = [
        ControlKind::Offer,
        ControlKind::Answer,
        ControlKind::Candidate,
        ControlKind::Play,
        ControlKind::Pause,
        ControlKind::Text,
        ControlKind::Ping,
        ControlKind::Pong,
    ];

    /// Wire tag, matching the serde representation of `ControlBody`.
    pub fn as_str(self) -> &'static str {
        match self {
            ControlKind::Offer => "offer",
            ControlKind::Answer => "answer",
            ControlKind::Candidate => "candidate",
            ControlKind::Play => "play",
            ControlKind::Pause => "pause",
            ControlKind::Text => "text",
            ControlKind::Ping => "ping",
            ControlKind::Pong => "pong",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    pub fn is_negotiation(self) -> bool {
        matches!(
            self,
            ControlKind::Offer | ControlKind::Answer | ControlKind::Candidate
        )
    }

    /// Application commands: the kinds recorded by the alignment log.
    pub fn is_command(self) -> bool {
        matches!(self, ControlKind::Play | ControlKind::Pause | ControlKind::Text)
    }

    /// Commands fanned out to every live session when a controller sends them.
    pub fn is_broadcast(self) -> bool {
        self.is_command()
    }

    pub fn requires_timestamp(self) -> bool {
        !self.is_negotiation()
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-dependent payload of a control message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlBody {
    Offer {
        sdp: String,
        #[serde(default)]
        role: PeerRole,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
    Play,
    Pause,
    Text {
        message: String,
    },
    Ping {
        nonce: u64,
    },
    /// Answer to a ping; `ping_sent_at` echoes the ping's timestamp.
    Pong {
        nonce: u64,
        ping_sent_at: Micros,
    },
}

impl ControlBody {
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlBody::Offer { .. } => ControlKind::Offer,
            ControlBody::Answer { .. } => ControlKind::Answer,
            ControlBody::Candidate { .. } => ControlKind::Candidate,
            ControlBody::Play => ControlKind::Play,
            ControlBody::Pause => ControlKind::Pause,
            ControlBody::Text { .. } => ControlKind::Text,
            ControlBody::Ping { .. } => ControlKind::Ping,
            ControlBody::Pong { .. } => ControlKind::Pong,
        }
    }
}

/// One unit on the control channel. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlMessage {
    #[serde(flatten)]
    body: ControlBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sent_at: Option<Micros>,
}

impl ControlMessage {
    pub fn new(body: ControlBody, sent_at: Option<Micros>) -> Self {
        Self { body, sent_at }
    }

    pub fn offer(sdp: impl Into<String>, role: PeerRole) -> Self {
        Self::new(
            ControlBody::Offer {
                sdp: sdp.into(),
                role,
            },
            None,
        )
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(ControlBody::Answer { sdp: sdp.into() }, None)
    }

    pub fn candidate(
        candidate: impl Into<String>,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Self {
        Self::new(
            ControlBody::Candidate {
                candidate: candidate.into(),
                sdp_mid,
                sdp_mline_index,
            },
            None,
        )
    }

    pub fn play(sent_at: Micros) -> Self {
        Self::new(ControlBody::Play, Some(sent_at))
    }

    pub fn pause(sent_at: Micros) -> Self {
        Self::new(ControlBody::Pause, Some(sent_at))
    }

    pub fn text(message: impl Into<String>, sent_at: Micros) -> Self {
        Self::new(
            ControlBody::Text {
                message: message.into(),
            },
            Some(sent_at),
        )
    }

    pub fn ping(nonce: u64, sent_at: Micros) -> Self {
        Self::new(ControlBody::Ping { nonce }, Some(sent_at))
    }

    pub fn pong(nonce: u64, ping_sent_at: Micros, sent_at: Micros) -> Self {
        Self::new(
            ControlBody::Pong {
                nonce,
                ping_sent_at,
            },
            Some(sent_at),
        )
    }

    pub fn kind(&self) -> ControlKind {
        self.body.kind()
    }

    pub fn body(&self) -> &ControlBody {
        &self.body
    }

    pub fn sent_at(&self) -> Option<Micros> {
        self.sent_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed control message: {0}")]
    Malformed(String),
    #[error("unknown control message kind `{0}`")]
    UnknownKind(String),
}

impl DecodeError {
    fn malformed(reason: impl fmt::Display) -> Self {
        DecodeError::Malformed(reason.to_string())
    }
}

/// Encode a control message into one self-describing JSON unit.
pub fn encode(message: &ControlMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Decode one unit read from the control channel.
///
/// The `kind` tag is checked before the payload so that messages from a newer
/// peer surface as `UnknownKind` instead of a generic parse failure.
pub fn decode(bytes: &[u8]) -> Result<ControlMessage, DecodeError> {
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(DecodeError::malformed(format!(
            "{} bytes exceeds limit of {MAX_MESSAGE_LEN}",
            bytes.len()
        )));
    }

    let value: Value = serde_json::from_slice(bytes).map_err(DecodeError::malformed)?;
    let tag = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::malformed("missing `kind` tag"))?;
    let kind =
        ControlKind::from_tag(tag).ok_or_else(|| DecodeError::UnknownKind(tag.to_owned()))?;

    let message: ControlMessage = serde_json::from_value(value).map_err(DecodeError::malformed)?;
    if kind.requires_timestamp() && message.sent_at.is_none() {
        return Err(DecodeError::malformed(format!("`{kind}` without sent_at")));
    }

    Ok(message)
}
