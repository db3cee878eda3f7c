//! Wire protocol between host and guests.
//!
//! Every message is a JSON object tagged by `type`. Decoding distinguishes an
//! unrecognized kind from a known kind with a bad payload so callers can log
//! the difference; both are dropped, never fatal.

use crate::types::*;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message kind {kind} cannot travel {direction:?}")]
    WrongDirection { kind: &'static str, direction: Direction },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Which way a message kind is allowed to travel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToHost,
    ToGuest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Request roster membership
    Join { display_name: String },
    /// Authoritative roster snapshot, replaces the guest mirror wholesale
    Roster { participants: Vec<Participant> },
    /// Shared stimulus for the coming round
    Preload { stimulus: StimulusPayload },
    /// Stimulus decoded and playable on the sender
    Ready { id: ParticipantId },
    /// Synchronized playback schedule
    Begin {
        stop_offset_seconds: f64,
        start_instant: Timestamp,
    },
    /// Reaction timestamp on the sender's clock
    Clicked {
        id: ParticipantId,
        local_timestamp: Timestamp,
    },
    Outcome {
        loser: RankedParticipant,
        ranking: Vec<RankedParticipant>,
    },
    /// Back to the lobby
    Rematch,
}

const KNOWN_KINDS: &[&str] = &[
    "join", "roster", "preload", "ready", "begin", "clicked", "outcome", "rematch",
];

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Roster { .. } => "roster",
            Self::Preload { .. } => "preload",
            Self::Ready { .. } => "ready",
            Self::Begin { .. } => "begin",
            Self::Clicked { .. } => "clicked",
            Self::Outcome { .. } => "outcome",
            Self::Rematch => "rematch",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::Join { .. } | Self::Ready { .. } | Self::Clicked { .. } => Direction::ToHost,
            Self::Roster { .. }
            | Self::Preload { .. }
            | Self::Begin { .. }
            | Self::Outcome { .. }
            | Self::Rematch => Direction::ToGuest,
        }
    }

    /// Reject a message that arrived on the wrong side of the session
    pub fn expect_direction(self, direction: Direction) -> ProtocolResult<Self> {
        if self.direction() == direction {
            Ok(self)
        } else {
            Err(ProtocolError::WrongDirection {
                kind: self.kind(),
                direction,
            })
        }
    }
}

impl From<Outcome> for WireMessage {
    fn from(outcome: Outcome) -> Self {
        Self::Outcome {
            loser: outcome.loser,
            ranking: outcome.ranking,
        }
    }
}

pub fn encode(msg: &WireMessage) -> ProtocolResult<String> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode(text: &str) -> ProtocolResult<WireMessage> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProtocolError::Malformed("missing `type` tag".to_string()))?;

    if !KNOWN_KINDS.contains(&kind) {
        return Err(ProtocolError::UnknownKind(kind.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encoded stimulus as it travels inside a `preload` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimulusPayload {
    pub mime: String,
    /// Base64 (standard alphabet) of the raw file bytes
    pub data: String,
}

impl StimulusPayload {
    pub fn from_bytes(mime: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime: mime.into(),
            data: STANDARD.encode(bytes),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}
