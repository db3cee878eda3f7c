//! Per-round bookkeeping: who has loaded the stimulus and who has clicked.
//!
//! Completeness is always judged against the roster's current membership,
//! never by comparing counts. Entries left behind by a participant who has
//! since left are simply ignored.

use super::Roster;
use crate::types::*;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct ReadinessSet {
    ready: HashMap<ParticipantId, bool>,
}

impl ReadinessSet {
    /// Start a loading phase: everyone currently on the roster is not ready
    pub fn reset(&mut self, roster: &Roster) {
        self.ready = roster.ids().map(|id| (id.clone(), false)).collect();
    }

    pub fn clear(&mut self) {
        self.ready.clear();
    }

    pub fn mark_ready(&mut self, id: ParticipantId) {
        self.ready.insert(id, true);
    }

    pub fn is_ready(&self, id: &ParticipantId) -> bool {
        self.ready.get(id).copied().unwrap_or(false)
    }

    /// Number of roster members that are ready
    pub fn ready_count(&self, roster: &Roster) -> usize {
        roster.ids().filter(|id| self.is_ready(id)).count()
    }

    pub fn is_complete(&self, roster: &Roster) -> bool {
        roster.ids().all(|id| self.is_ready(id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClickLedger {
    clicks: HashMap<ParticipantId, Timestamp>,
}

impl ClickLedger {
    /// Record a click. The first timestamp for an identity wins; returns
    /// whether this call recorded anything.
    pub fn record(&mut self, id: ParticipantId, timestamp: Timestamp) -> bool {
        match self.clicks.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(timestamp);
                true
            }
        }
    }

    pub fn get(&self, id: &ParticipantId) -> Option<Timestamp> {
        self.clicks.get(id).copied()
    }

    pub fn has_clicked(&self, id: &ParticipantId) -> bool {
        self.clicks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clicks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clicks.is_empty()
    }

    pub fn clear(&mut self) {
        self.clicks.clear();
    }

    pub fn is_complete(&self, roster: &Roster) -> bool {
        roster.ids().all(|id| self.has_clicked(id))
    }
}

impl FromIterator<(ParticipantId, Timestamp)> for ClickLedger {
    fn from_iter<I: IntoIterator<Item = (ParticipantId, Timestamp)>>(iter: I) -> Self {
        let mut ledger = Self::default();
        for (id, ts) in iter {
            ledger.record(id, ts);
        }
        ledger
    }
}
