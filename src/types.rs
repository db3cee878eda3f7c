use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque ID types for type safety
pub type ConnectionId = String;
pub type RoomId = String;

/// Milliseconds since the Unix epoch on the sampling participant's clock
pub type Timestamp = i64;

/// Identity of a roster member.
///
/// The host never holds a transport-assigned id, so its identity is a
/// dedicated variant rather than a reserved string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ParticipantId {
    Host,
    Peer(ConnectionId),
}

impl ParticipantId {
    pub fn peer(id: impl Into<ConnectionId>) -> Self {
        Self::Peer(id.into())
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Peer(id) => write!(f, "peer:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
}

impl Participant {
    pub fn new(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

/// Authoritative round phase, owned by the host
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundPhase {
    Setup,
    Lobby,
    Loading,
    Countdown,
    Active,
    Resolved,
}

/// Shadow phase a guest reconstructs from the messages it has received.
///
/// Countdown and Active are indistinguishable to a guest and share `Active`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuestPhase {
    Connecting,
    Lobby,
    Loading,
    Active,
    Resolved,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

/// One line of a round result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedParticipant {
    pub id: ParticipantId,
    pub display_name: String,
    /// `None` when the participant never clicked
    pub timestamp: Option<Timestamp>,
}

/// Final result of a round as broadcast by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub loser: RankedParticipant,
    pub ranking: Vec<RankedParticipant>,
}

impl Outcome {
    pub fn is_loser(&self, id: &ParticipantId) -> bool {
        self.loser.id == *id
    }
}
