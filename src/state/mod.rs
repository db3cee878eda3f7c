mod ledger;
mod ranking;
mod roster;

pub use ledger::{ClickLedger, ReadinessSet};
pub use ranking::{outcome, rank};
pub use roster::{Roster, RosterMirror};

use crate::types::*;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StateError {
    #[error("participant {0} is already on the roster")]
    DuplicateParticipant(ParticipantId),

    #[error("invalid phase transition from {from:?} to {to:?}")]
    InvalidTransition { from: RoundPhase, to: RoundPhase },
}

/// Everything the host owns about the game.
///
/// Only the host's session mutates this, one event at a time.
#[derive(Debug, Clone)]
pub struct HostState {
    pub phase: RoundPhase,
    pub round_no: u32,
    pub roster: Roster,
    pub readiness: ReadinessSet,
    pub clicks: ClickLedger,
    /// Joins received mid-round, admitted on the next return to the lobby
    pending_joins: Vec<Participant>,
}

impl HostState {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            phase: RoundPhase::Setup,
            round_no: 0,
            roster: Roster::with_host(host_name),
            readiness: ReadinessSet::default(),
            clicks: ClickLedger::default(),
            pending_joins: Vec::new(),
        }
    }

    /// Check if a phase transition is valid
    pub fn is_valid_transition(from: RoundPhase, to: RoundPhase) -> bool {
        use RoundPhase::*;

        matches!(
            (from, to),
            (Setup, Lobby)
                | (Lobby, Loading)
                | (Loading, Countdown)
                | (Countdown, Active)
                | (Active, Resolved)
                | (Resolved, Lobby)
                // Loading abandoned by the host
                | (Loading, Lobby)
        )
    }

    fn transition(&mut self, to: RoundPhase) -> StateResult<()> {
        if !Self::is_valid_transition(self.phase, to) {
            return Err(StateError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        tracing::info!("Phase {:?} -> {:?}", self.phase, to);
        self.phase = to;
        Ok(())
    }

    pub fn open_lobby(&mut self) -> StateResult<()> {
        self.transition(RoundPhase::Lobby)
    }

    /// Enter `Loading` with nobody ready
    pub fn start_loading(&mut self) -> StateResult<()> {
        self.transition(RoundPhase::Loading)?;
        self.readiness.reset(&self.roster);
        Ok(())
    }

    pub fn start_countdown(&mut self) -> StateResult<()> {
        self.transition(RoundPhase::Countdown)
    }

    /// Enter `Active` with an empty click ledger
    pub fn activate(&mut self) -> StateResult<()> {
        self.transition(RoundPhase::Active)?;
        self.clicks.clear();
        self.round_no += 1;
        Ok(())
    }

    /// Rank the round and enter `Resolved`
    pub fn resolve(&mut self) -> StateResult<Outcome> {
        let result = outcome(self.roster.participants(), &self.clicks).ok_or(
            StateError::InvalidTransition {
                from: self.phase,
                to: RoundPhase::Resolved,
            },
        )?;
        self.transition(RoundPhase::Resolved)?;
        Ok(result)
    }

    /// Back to `Lobby`, clearing round data. Returns participants admitted
    /// from the pending-join queue.
    pub fn return_to_lobby(&mut self) -> StateResult<Vec<Participant>> {
        self.transition(RoundPhase::Lobby)?;
        self.readiness.clear();
        self.clicks.clear();

        let mut admitted = Vec::new();
        for participant in std::mem::take(&mut self.pending_joins) {
            match self.roster.add(participant.clone()) {
                Ok(()) => admitted.push(participant),
                Err(e) => tracing::warn!("Dropping parked join: {}", e),
            }
        }
        Ok(admitted)
    }

    /// Park a join until the next lobby. Returns false if already parked.
    pub fn park_join(&mut self, participant: Participant) -> bool {
        if self.pending_joins.iter().any(|p| p.id == participant.id) {
            return false;
        }
        self.pending_joins.push(participant);
        true
    }

    pub fn is_parked(&self, id: &ParticipantId) -> bool {
        self.pending_joins.iter().any(|p| p.id == *id)
    }

    /// Forget a participant everywhere. Returns true if they were on the roster.
    pub fn remove_participant(&mut self, id: &ParticipantId) -> bool {
        self.pending_joins.retain(|p| p.id != *id);
        self.roster.remove(id).is_some()
    }

    /// Level-triggered: loading may end once every current member is ready
    pub fn readiness_complete(&self) -> bool {
        self.phase == RoundPhase::Loading && self.readiness.is_complete(&self.roster)
    }

    /// Level-triggered: the round may resolve once every current member clicked
    pub fn clicks_complete(&self) -> bool {
        self.phase == RoundPhase::Active && self.clicks.is_complete(&self.roster)
    }
}
