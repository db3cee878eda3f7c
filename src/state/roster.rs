use super::{StateError, StateResult};
use crate::types::*;

/// Host-owned, ordered list of participants.
///
/// Order is join order with the host first; ranking ties fall back to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    /// Roster holding only the host
    pub fn with_host(display_name: impl Into<String>) -> Self {
        Self {
            participants: vec![Participant::new(ParticipantId::Host, display_name)],
        }
    }

    pub fn add(&mut self, participant: Participant) -> StateResult<()> {
        if self.contains(&participant.id) {
            return Err(StateError::DuplicateParticipant(participant.id));
        }
        self.participants.push(participant);
        Ok(())
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        let index = self.participants.iter().position(|p| p.id == *id)?;
        Some(self.participants.remove(index))
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.iter().any(|p| p.id == *id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == *id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ParticipantId> {
        self.participants.iter().map(|p| &p.id)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn snapshot(&self) -> Vec<Participant> {
        self.participants.clone()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

/// Guest-side read-only copy of the host roster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterMirror {
    participants: Vec<Participant>,
}

impl RosterMirror {
    /// Replace wholesale; there is no incremental update
    pub fn replace(&mut self, participants: Vec<Participant>) {
        self.participants = participants;
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == *id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
